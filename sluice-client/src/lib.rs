//! Sluice HTTP Client
//!
//! Clients for the two remote services a runner talks to:
//! - The content store, where collected artifacts are uploaded
//! - The step registry, from which step tarballs are downloaded
//!
//! # Example
//!
//! ```no_run
//! use sluice_client::{ContentStore, HttpContentStore, StoreMetadata};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> sluice_client::Result<()> {
//!     let store = HttpContentStore::new("http://localhost:9000/artifacts");
//!     store
//!         .store_from_file(
//!             Path::new("/tmp/output.tar"),
//!             "project-artifacts/app/build/1/step/abc/output.tar",
//!             "application/x-tar",
//!             3,
//!             &StoreMetadata::new(),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod error;
mod registry;
mod store;

pub use error::{ClientError, Result};
pub use registry::RegistryClient;
pub use store::{ContentStore, HttpContentStore, StoreMetadata};

/// Handle a response that carries no content we need
///
/// Checks the status code and returns an error if the request failed.
pub(crate) async fn handle_empty_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::api_error(status.as_u16(), error_text));
    }

    Ok(())
}

/// Normalizes a base URL by removing trailing slashes
pub(crate) fn trim_base_url(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}
