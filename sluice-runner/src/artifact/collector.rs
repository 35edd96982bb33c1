//! File collector
//!
//! Opens a live copy-out stream from a running container.

use async_trait::async_trait;
use std::sync::Arc;

use crate::container::platform::{ContainerPlatform, CopyStream, PlatformError};

#[async_trait]
pub trait FileCollector: Send + Sync {
    /// Container the collector reads from
    fn container_id(&self) -> &str;

    /// Starts streaming `guest_path` as a tar archive
    ///
    /// Errors that surface after the stream started arrive on
    /// [`CopyStream::errors`].
    async fn collect(&self, guest_path: &str) -> Result<CopyStream, PlatformError>;
}

/// Collector copying files out of a container through the platform
pub struct ContainerCollector {
    platform: Arc<dyn ContainerPlatform>,
    container_id: String,
}

impl ContainerCollector {
    pub fn new(platform: Arc<dyn ContainerPlatform>, container_id: impl Into<String>) -> Self {
        Self {
            platform,
            container_id: container_id.into(),
        }
    }
}

#[async_trait]
impl FileCollector for ContainerCollector {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn collect(&self, guest_path: &str) -> Result<CopyStream, PlatformError> {
        self.platform
            .copy_from_container(&self.container_id, guest_path)
            .await
    }
}
