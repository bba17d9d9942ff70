use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::SourceSection;
use crate::error::{AttachmentError, FetchError};

use super::rate_limit::RateLimiter;
use super::traits::{Page, Resource, TrackerApi};

/// Tracker REST client: token auth, request pacing, bounded concurrency,
/// and retry with exponential backoff.
pub struct HttpTrackerClient {
    base_url: String,
    token: String,
    client: Client,
    limiter: Arc<RateLimiter>,
    in_flight: Semaphore,
    page_size: u64,
    max_retries: u32,
    timeout: Duration,
}

impl std::fmt::Debug for HttpTrackerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTrackerClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl HttpTrackerClient {
    /// The limiter is shared so that every client of a run draws from the
    /// same token bucket.
    pub fn new(config: &SourceSection, token: String, limiter: Arc<RateLimiter>) -> Self {
        // reqwest's `no-provider` rustls stack panics at client build unless a
        // process-wide crypto provider is installed first.
        static CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();
        CRYPTO_PROVIDER.call_once(|| {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        });
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            client: Client::new(),
            limiter,
            in_flight: Semaphore::new(config.rate_limit.max_in_flight),
            page_size: u64::from(config.page_size),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Issue a GET, retrying 429/5xx and network failures with exponential
    /// backoff. 401/403 fail immediately: retrying a rejected credential
    /// only burns the rate budget.
    async fn send_with_retry(
        &self,
        url: &str,
        resource: &str,
    ) -> crate::error::Result<reqwest::Response> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("request semaphore closed");
        let mut delay = Duration::from_secs(1);

        for attempt in 0..=self.max_retries {
            self.limiter.acquire().await;

            debug!(url = %url, attempt, "tracker API request");
            let result = self
                .client
                .get(url)
                .header("X-TrackerToken", &self.token)
                .timeout(self.timeout)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt < self.max_retries {
                        warn!(attempt, error = %e, "request failed, backing off");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(60));
                        continue;
                    }
                    return Err(FetchError::Transient {
                        resource: resource.to_string(),
                        attempts: attempt + 1,
                        message: e.to_string(),
                    }
                    .into());
                }
            };

            if resp.status().is_success() {
                return Ok(resp);
            }

            let status = resp.status().as_u16();
            if status == 401 || status == 403 {
                return Err(FetchError::Auth {
                    status,
                    resource: resource.to_string(),
                }
                .into());
            }

            if status == 429 || resp.status().is_server_error() {
                if attempt < self.max_retries {
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map_or(delay, Duration::from_secs);
                    warn!(
                        attempt,
                        status,
                        wait_secs = wait.as_secs(),
                        "transient response, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(Duration::from_secs(60));
                    continue;
                }
                return Err(FetchError::Transient {
                    resource: resource.to_string(),
                    attempts: attempt + 1,
                    message: format!("HTTP {status}"),
                }
                .into());
            }

            return Err(FetchError::Status {
                status,
                resource: resource.to_string(),
            }
            .into());
        }

        Err(FetchError::Transient {
            resource: resource.to_string(),
            attempts: self.max_retries + 1,
            message: "retry budget exhausted".to_string(),
        }
        .into())
    }

    async fn get_json(&self, url: &str, resource: &str) -> crate::error::Result<Value> {
        let resp = self.send_with_retry(url, resource).await?;
        resp.json().await.map_err(|e| {
            FetchError::Decode {
                resource: resource.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

#[async_trait::async_trait]
impl TrackerApi for HttpTrackerClient {
    async fn fetch_page(&self, resource: &Resource, offset: u64) -> crate::error::Result<Page> {
        let url = format!(
            "{}{}?limit={}&offset={}",
            self.base_url,
            resource.path(),
            self.page_size,
            offset
        );
        let value = self.get_json(&url, resource.name()).await?;
        let Value::Array(items) = value else {
            return Err(FetchError::Decode {
                resource: resource.name().to_string(),
                message: "expected a JSON array".to_string(),
            }
            .into());
        };
        let next = if (items.len() as u64) < self.page_size {
            None
        } else {
            Some(offset + items.len() as u64)
        };
        Ok(Page { items, next })
    }

    async fn fetch_one(&self, resource: &Resource) -> crate::error::Result<Value> {
        let url = format!("{}{}", self.base_url, resource.path());
        self.get_json(&url, resource.name()).await
    }

    async fn download(&self, url_path: &str, dest: &Path) -> crate::error::Result<u64> {
        let base = Url::parse(&self.base_url).map_err(|e| FetchError::Decode {
            resource: "attachment".to_string(),
            message: format!("bad base URL: {e}"),
        })?;
        // join() resolves both server-root paths and absolute URLs.
        let url = base.join(url_path).map_err(|e| FetchError::Decode {
            resource: "attachment".to_string(),
            message: format!("bad attachment URL {url_path}: {e}"),
        })?;

        let resp = self.send_with_retry(url.as_str(), "attachment").await?;
        let bytes = resp.bytes().await.map_err(|e| AttachmentError::Download {
            filename: url_path.to_string(),
            message: e.to_string(),
        })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(AttachmentError::from)?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(AttachmentError::from)?;
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use crate::error::TrawlError;

    use super::*;

    fn client_for(server: &MockServer, max_retries: u32) -> HttpTrackerClient {
        let config = SourceSection {
            base_url: server.base_url(),
            page_size: 2,
            max_retries,
            timeout_secs: 5,
            ..SourceSection::default()
        };
        // Effectively unmetered so tests never sleep on the bucket.
        let limiter = Arc::new(RateLimiter::new(10_000, Duration::from_secs(1)));
        HttpTrackerClient::new(&config, "secret-token".to_string(), limiter)
    }

    #[tokio::test]
    async fn fetch_all_walks_pages_until_a_short_batch() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/projects/1/stories")
                    .query_param("limit", "2")
                    .query_param("offset", "0")
                    .header("X-TrackerToken", "secret-token");
                then.status(200).json_body(json!([{"id": 1}, {"id": 2}]));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/projects/1/stories")
                    .query_param("offset", "2");
                then.status(200).json_body(json!([{"id": 3}]));
            })
            .await;

        let client = client_for(&server, 0);
        let items = client.fetch_all(&Resource::Stories(1)).await.unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["id"], 3);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn empty_collection_costs_a_single_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/projects/1/labels");
                then.status(200).json_body(json!([]));
            })
            .await;

        let client = client_for(&server, 0);
        let items = client.fetch_all(&Resource::Labels(1)).await.unwrap();

        assert!(items.is_empty());
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn rejected_credential_fails_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/projects");
                then.status(401).body("invalid token");
            })
            .await;

        let client = client_for(&server, 3);
        let err = client.fetch_page(&Resource::Projects, 0).await.unwrap_err();

        match err {
            TrawlError::Fetch(FetchError::Auth { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected an auth error, got {other}"),
        }
        assert_eq!(mock.hits_async().await, 1, "401 must not be retried");
    }

    #[tokio::test]
    async fn transient_statuses_exhaust_the_retry_budget() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/projects/1/epics");
                // Retry-After of zero keeps the test fast.
                then.status(503).header("Retry-After", "0");
            })
            .await;

        let client = client_for(&server, 2);
        let err = client.fetch_page(&Resource::Epics(1), 0).await.unwrap_err();

        match err {
            TrawlError::Fetch(FetchError::Transient { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected a transient error, got {other}"),
        }
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn not_found_is_surfaced_as_a_status_error() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/projects/404");
                then.status(404).body("not here");
            })
            .await;

        let client = client_for(&server, 3);
        let err = client.fetch_one(&Resource::Project(404)).await.unwrap_err();

        match err {
            TrawlError::Fetch(FetchError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("expected a status error, got {other}"),
        }
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn fetch_one_returns_the_object() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/projects/42");
                then.status(200)
                    .json_body(json!({"id": 42, "name": "Deep Sea"}));
            })
            .await;

        let client = client_for(&server, 0);
        let value = client.fetch_one(&Resource::Project(42)).await.unwrap();
        assert_eq!(value["name"], "Deep Sea");
    }

    #[tokio::test]
    async fn object_body_on_a_collection_is_a_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/projects/1/iterations");
                then.status(200).json_body(json!({"oops": true}));
            })
            .await;

        let client = client_for(&server, 0);
        let err = client
            .fetch_page(&Resource::Iterations(1), 0)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TrawlError::Fetch(FetchError::Decode { .. })),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn download_writes_the_body_to_disk() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/file_attachments/9/download");
                then.status(200).body("attachment body");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("proj/story/file.txt");
        let client = client_for(&server, 0);
        let written = client
            .download("/file_attachments/9/download", &dest)
            .await
            .unwrap();

        assert_eq!(written, 15);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "attachment body");
    }
}
