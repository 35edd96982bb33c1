//! Content store client
//!
//! Artifacts are uploaded with a PUT of the file body to `{base_url}/{key}`.
//! Metadata travels as `X-Sluice-Meta-*` headers.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::{handle_empty_response, trim_base_url};

/// Key/value metadata stored alongside an object
pub type StoreMetadata = BTreeMap<String, String>;

const INITIAL_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 10_000;

/// Remote store for artifacts
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Uploads a local file under `key`
    ///
    /// Retries up to `max_tries` times in total before returning the last error.
    async fn store_from_file(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
        max_tries: u32,
        metadata: &StoreMetadata,
    ) -> Result<()>;
}

/// HTTP implementation of ContentStore
#[derive(Debug, Clone)]
pub struct HttpContentStore {
    base_url: String,
    client: Client,
}

impl HttpContentStore {
    /// Create a new content store client
    ///
    /// # Arguments
    /// * `base_url` - Base URL objects are stored under (e.g., "http://localhost:9000/artifacts")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a content store client with a configured reqwest Client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: trim_base_url(base_url),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL an object key is stored at
    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    async fn put_once(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
        metadata: &StoreMetadata,
    ) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();

        let mut request = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, length);
        for (name, value) in metadata {
            request = request.header(format!("X-Sluice-Meta-{}", name), value);
        }

        let response = request.body(file).send().await?;
        handle_empty_response(response).await
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn store_from_file(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
        max_tries: u32,
        metadata: &StoreMetadata,
    ) -> Result<()> {
        let max_tries = max_tries.max(1);
        let mut delay_ms = INITIAL_RETRY_DELAY_MS;
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("Uploading {} to {} (attempt {})", path.display(), key, attempt);

            match self.put_once(path, key, content_type, metadata).await {
                Ok(()) => {
                    info!("Stored {} as {}", path.display(), key);
                    return Ok(());
                }
                Err(e) if attempt < max_tries && e.is_retryable() => {
                    warn!(
                        "Upload of {} failed (attempt {}/{}): {}",
                        key, attempt, max_tries, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(MAX_RETRY_DELAY_MS);
                }
                Err(e) => {
                    return Err(ClientError::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
            }
        }
    }
}
