//! Step registry client
//!
//! Registry steps are published as gzipped tarballs at
//! `{base_url}/{owner}/{name}/{version}.tar.gz`, `latest` standing in for
//! an unpinned version.

use reqwest::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::trim_base_url;

#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    client: Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_base_url(base_url),
            client: Client::new(),
        }
    }

    pub fn tarball_url(&self, owner: &str, name: &str, version: Option<&str>) -> String {
        format!(
            "{}/{}/{}/{}.tar.gz",
            self.base_url,
            owner,
            name,
            version.unwrap_or("latest")
        )
    }

    /// Downloads a step tarball into `dest`, streaming the body to disk
    pub async fn download_step(
        &self,
        owner: &str,
        name: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let url = self.tarball_url(owner, name, version);
        debug!("Downloading step from {}", url);

        let mut response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::api_error(status.as_u16(), body));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tarball_url() {
        let client = RegistryClient::new("https://steps.example.com/");
        assert_eq!(
            client.tarball_url("acme", "lint", Some("1.0.0")),
            "https://steps.example.com/acme/lint/1.0.0.tar.gz"
        );
        assert_eq!(
            client.tarball_url("acme", "lint", None),
            "https://steps.example.com/acme/lint/latest.tar.gz"
        );
    }
}
