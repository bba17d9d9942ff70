/// Top-level Trawl error type.
///
/// All fallible operations in `trawl-core` return [`Result<T, TrawlError>`](Result).
/// Each variant wraps a domain-specific error enum, allowing callers to
/// match on the error source without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum TrawlError {
    /// Error from the relational store layer (`SQLite` operations, schema).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Error fetching data from the tracker API.
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Error mapping a source payload into the local schema.
    #[error("Mapping error: {0}")]
    Map(#[from] MapError),

    /// Error downloading or writing an attachment file.
    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TrawlError {
    /// Whether this error must abort the whole run rather than a single
    /// project. Credential rejections and configuration problems cannot be
    /// recovered by moving on to the next project.
    pub fn halts_run(&self) -> bool {
        matches!(
            self,
            Self::Fetch(FetchError::Auth { .. }) | Self::Config(_)
        )
    }
}

/// Errors from the SQLite-backed relational store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema setup failed (version mismatch or DDL error).
    #[error("Migration failed: {0}")]
    Migration(String),

    /// A referenced row was not found in the store.
    #[error("Row not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization of stored values failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors talking to the tracker HTTP API.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// The credential was rejected (HTTP 401/403). Never retried.
    #[error("Authentication rejected (HTTP {status}) fetching {resource}")]
    Auth {
        /// HTTP status code returned by the tracker.
        status: u16,
        /// Resource being fetched when the credential was rejected.
        resource: String,
    },

    /// Retryable failures (HTTP 429/5xx, network errors) exhausted the
    /// retry budget.
    #[error("Gave up fetching {resource} after {attempts} attempts: {message}")]
    Transient {
        /// Resource being fetched.
        resource: String,
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// The tracker returned a non-retryable, non-auth error status.
    #[error("Unexpected HTTP {status} fetching {resource}")]
    Status {
        /// HTTP status code returned by the tracker.
        status: u16,
        /// Resource being fetched.
        resource: String,
    },

    /// The response body could not be decoded as the expected JSON shape.
    #[error("Undecodable response for {resource}: {message}")]
    Decode {
        /// Resource being fetched.
        resource: String,
        /// Description of the decode failure.
        message: String,
    },
}

/// Errors mapping one source entity into local rows.
///
/// These are always scoped to a single entity: the mapper skips the entity,
/// the caller records the skip, and the extraction continues.
#[derive(thiserror::Error, Debug)]
pub enum MapError {
    /// The payload did not match the expected shape (missing required
    /// field, wrong type).
    #[error("Undecodable {entity} payload: {message}")]
    Decode {
        /// Entity kind being decoded.
        entity: &'static str,
        /// Description of the decode failure.
        message: String,
    },

    /// The payload decoded but violates a semantic constraint.
    #[error("Invalid {entity}: {message}")]
    Constraint {
        /// Entity kind being mapped.
        entity: &'static str,
        /// Description of the violated constraint.
        message: String,
    },
}

/// Errors downloading or writing one attachment file.
#[derive(thiserror::Error, Debug)]
pub enum AttachmentError {
    /// The attachment body could not be fetched.
    #[error("Download failed for {filename}: {message}")]
    Download {
        /// Attachment filename as reported by the tracker.
        filename: String,
        /// Description of the fetch failure.
        message: String,
    },

    /// Filesystem I/O error writing the attachment.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in Trawl configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// No API token in the config and the named environment variable is
    /// unset or empty.
    #[error("No API token: set the {0} environment variable or [source].token")]
    MissingCredential(String),
}

/// Convenience alias for `Result<T, TrawlError>`.
pub type Result<T> = std::result::Result<T, TrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_halt_the_run() {
        let err = TrawlError::Fetch(FetchError::Auth {
            status: 401,
            resource: "projects".to_string(),
        });
        assert!(err.halts_run());

        let err = TrawlError::Config(ConfigError::MissingCredential(
            "TRACKER_API_TOKEN".to_string(),
        ));
        assert!(err.halts_run());
    }

    #[test]
    fn transient_and_map_errors_do_not_halt() {
        let err = TrawlError::Fetch(FetchError::Transient {
            resource: "stories".to_string(),
            attempts: 5,
            message: "HTTP 503".to_string(),
        });
        assert!(!err.halts_run());

        let err = TrawlError::Map(MapError::Decode {
            entity: "story",
            message: "missing field `name`".to_string(),
        });
        assert!(!err.halts_run());
    }

    #[test]
    fn display_includes_context() {
        let err = FetchError::Transient {
            resource: "projects/99/stories".to_string(),
            attempts: 5,
            message: "HTTP 503".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("projects/99/stories"), "got: {text}");
        assert!(text.contains("5 attempts"), "got: {text}");
    }
}
