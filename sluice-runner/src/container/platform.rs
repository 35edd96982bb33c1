//! Container platform boundary
//!
//! Everything the runner needs from the container engine, expressed as a
//! trait so the pipeline logic can be driven against a fake in tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::session::transport::ShellStreams;

/// Errors reported by the container engine
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The container, image or path does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The engine ran but reported a failure
    #[error("'{command}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The engine could not be invoked at all
    #[error("Failed to run container engine: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

/// Options for creating a container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// `(host path, guest path)` bind mounts
    pub mounts: Vec<(PathBuf, String)>,
    pub network: Option<String>,
    /// Alias other containers on the network reach this one by
    pub network_alias: Option<String>,
    pub workdir: Option<String>,
    pub entrypoint: Option<String>,
    pub cmd: Vec<String>,
}

/// Live tar stream copied out of a container
///
/// Errors the engine reports while producing the stream arrive on `errors`;
/// the sender is dropped without a value when the copy succeeded.
pub struct CopyStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub errors: oneshot::Receiver<PlatformError>,
}

/// Container engine operations used by the runner
#[async_trait]
pub trait ContainerPlatform: Send + Sync {
    /// Creates a container and returns its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, PlatformError>;

    async fn start_container(&self, id: &str) -> Result<(), PlatformError>;

    async fn stop_container(&self, id: &str) -> Result<(), PlatformError>;

    /// Restarts a container, killing its processes but keeping its filesystem
    async fn restart_container(&self, id: &str) -> Result<(), PlatformError>;

    async fn remove_container(&self, id: &str) -> Result<(), PlatformError>;

    /// Commits the container filesystem to an image, returning the image id
    async fn commit_container(&self, id: &str, image: &str) -> Result<String, PlatformError>;

    /// Saves an image as a tarball on the host
    async fn export_image(&self, image: &str, dest: &Path) -> Result<(), PlatformError>;

    /// Streams `path` out of the container as a tar archive
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<CopyStream, PlatformError>;

    /// Waits for the container to exit and returns its exit code
    async fn wait_container(&self, id: &str) -> Result<i32, PlatformError>;

    /// Combined stdout/stderr of the container
    async fn container_logs(&self, id: &str) -> Result<String, PlatformError>;

    async fn create_network(&self, name: &str) -> Result<(), PlatformError>;

    async fn remove_network(&self, name: &str) -> Result<(), PlatformError>;

    /// Starts an interactive shell inside the container
    ///
    /// The shell is killed when `cancel` fires.
    async fn attach_shell(
        &self,
        id: &str,
        shell: &str,
        cancel: CancellationToken,
    ) -> Result<ShellStreams, PlatformError>;
}
