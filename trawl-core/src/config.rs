use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level Trawl configuration, matching `trawl.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrawlConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub run: RunSection,
}

impl TrawlConfig {
    /// Read and parse the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        Self::parse(&text)
    }

    /// Read the config file at `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.source.page_size == 0 {
            return Err(ConfigError::Invalid(
                "source.page_size must be at least 1".to_string(),
            ));
        }
        if self.source.rate_limit.requests == 0 {
            return Err(ConfigError::Invalid(
                "source.rate_limit.requests must be at least 1".to_string(),
            ));
        }
        if self.source.rate_limit.interval_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "source.rate_limit.interval_secs must be positive".to_string(),
            ));
        }
        if self.source.rate_limit.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "source.rate_limit.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.run.parallel_projects == 0 {
            return Err(ConfigError::Invalid(
                "run.parallel_projects must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tracker API endpoint, credential, and transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Base URL of the tracker API, without a trailing slash.
    pub base_url: String,
    /// API token. The environment variable named by `token_env` is
    /// preferred; this field exists for setups that cannot use one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Environment variable consulted when `token` is unset.
    pub token_env: String,
    /// Items requested per page.
    pub page_size: u32,
    /// Retry budget for 429/5xx/network failures per request.
    pub max_retries: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub rate_limit: RateLimitSection,
}

impl SourceSection {
    /// Resolve the API token: explicit config value first, then the
    /// environment variable it names.
    pub fn resolve_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.token {
            if !token.is_empty() {
                return Ok(token.clone());
            }
        }
        match std::env::var(&self.token_env) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(ConfigError::MissingCredential(self.token_env.clone())),
        }
    }
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            base_url: "https://www.pivotaltracker.com/services/v5".to_string(),
            token: None,
            token_env: "TRACKER_API_TOKEN".to_string(),
            page_size: 100,
            max_retries: 5,
            timeout_secs: 30,
            rate_limit: RateLimitSection::default(),
        }
    }
}

/// Request pacing: a token bucket refilled continuously, plus a cap on
/// concurrent in-flight requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Tokens granted per interval (also the burst capacity).
    pub requests: u32,
    /// Refill interval in seconds.
    pub interval_secs: f64,
    /// Maximum concurrent in-flight requests.
    pub max_in_flight: usize,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            requests: 6,
            interval_secs: 5.0,
            max_in_flight: 4,
        }
    }
}

/// Local artifact locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Root directory for downloaded attachment files.
    pub attachments_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("trawl.db"),
            attachments_dir: PathBuf::from("attachments"),
        }
    }
}

/// Run-shaping defaults; the CLI can override the project filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Source project ids to extract. Empty means every project the
    /// credential can see.
    pub projects: Vec<i64>,
    /// Projects extracted concurrently.
    pub parallel_projects: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            parallel_projects: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrawlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.source.page_size, 100);
        assert_eq!(config.source.rate_limit.requests, 6);
        assert_eq!(config.run.parallel_projects, 1);
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config = TrawlConfig::parse("").unwrap();
        assert_eq!(config.source.base_url, TrawlConfig::default().source.base_url);
        assert_eq!(config.storage.db_path, PathBuf::from("trawl.db"));
    }

    #[test]
    fn full_toml_round_trip() {
        let text = r#"
            [source]
            base_url = "https://tracker.example.com/api/v5"
            token_env = "MY_TOKEN"
            page_size = 50
            max_retries = 3
            timeout_secs = 10

            [source.rate_limit]
            requests = 2
            interval_secs = 1.0
            max_in_flight = 1

            [storage]
            db_path = "out/tracker.db"
            attachments_dir = "out/files"

            [run]
            projects = [11, 22]
            parallel_projects = 2
        "#;
        let config = TrawlConfig::parse(text).unwrap();
        assert_eq!(config.source.base_url, "https://tracker.example.com/api/v5");
        assert_eq!(config.source.token_env, "MY_TOKEN");
        assert_eq!(config.source.page_size, 50);
        assert_eq!(config.source.rate_limit.requests, 2);
        assert_eq!(config.storage.db_path, PathBuf::from("out/tracker.db"));
        assert_eq!(config.run.projects, vec![11, 22]);
        assert_eq!(config.run.parallel_projects, 2);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let text = r#"
            [source]
            page_size = 25

            [storage]
            db_path = "custom.db"
        "#;
        let config = TrawlConfig::parse(text).unwrap();
        assert_eq!(config.source.page_size, 25);
        assert_eq!(config.source.base_url, SourceSection::default().base_url);
        assert_eq!(config.source.rate_limit.requests, 6);
        assert_eq!(config.storage.db_path, PathBuf::from("custom.db"));
        assert_eq!(config.storage.attachments_dir, PathBuf::from("attachments"));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = TrawlConfig::parse("[source]\npage_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("page_size"), "got: {err}");
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let err = TrawlConfig::parse("[run]\nparallel_projects = 0\n").unwrap_err();
        assert!(err.to_string().contains("parallel_projects"), "got: {err}");
    }

    #[test]
    fn config_token_wins_over_env() {
        let section = SourceSection {
            token: Some("from-config".to_string()),
            token_env: "TRAWL_TEST_UNSET_TOKEN_VAR".to_string(),
            ..SourceSection::default()
        };
        assert_eq!(section.resolve_token().unwrap(), "from-config");
    }

    #[test]
    fn missing_token_names_the_env_var() {
        let section = SourceSection {
            token: None,
            token_env: "TRAWL_TEST_UNSET_TOKEN_VAR".to_string(),
            ..SourceSection::default()
        };
        let err = section.resolve_token().unwrap_err();
        assert!(
            err.to_string().contains("TRAWL_TEST_UNSET_TOKEN_VAR"),
            "got: {err}"
        );
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrawlConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.source.page_size, 100);
    }

    #[test]
    fn load_reads_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trawl.toml");
        std::fs::write(&path, "[source]\npage_size = 25\n").unwrap();
        let config = TrawlConfig::load(&path).unwrap();
        assert_eq!(config.source.page_size, 25);
    }
}
