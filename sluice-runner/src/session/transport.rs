//! Session transport
//!
//! A transport opens the raw stdin/output streams of a shell running in a
//! container. It has no notion of commands; framing is the session's job.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::container::platform::ContainerPlatform;
use crate::session::SessionError;

/// Streams bound to a running shell
pub struct ShellStreams {
    /// Shell stdin
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Lines read from stdout and stderr, newline included
    pub output: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the shell; it lives until `cancel` fires
    async fn attach(&self, cancel: CancellationToken) -> Result<ShellStreams, SessionError>;
}

/// Transport running a shell inside a container through the platform
pub struct ContainerTransport {
    platform: Arc<dyn ContainerPlatform>,
    container_id: String,
    shell: String,
}

impl ContainerTransport {
    pub fn new(
        platform: Arc<dyn ContainerPlatform>,
        container_id: impl Into<String>,
        shell: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            container_id: container_id.into(),
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl Transport for ContainerTransport {
    async fn attach(&self, cancel: CancellationToken) -> Result<ShellStreams, SessionError> {
        self.platform
            .attach_shell(&self.container_id, &self.shell, cancel)
            .await
            .map_err(SessionError::Attach)
    }
}
