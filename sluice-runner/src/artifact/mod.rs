//! Artifact collection
//!
//! Turns a path inside a running container into a durable artifact:
//! - Streams the path out of the container as tar (file collector)
//! - Tees the stream into a tarball on the host while extracting it
//! - Uploads the tarball to the content store when one is configured
//!
//! A path that is missing or holds no regular files is reported as
//! [`ArtifactError::EmptyTarball`] so callers can fall back to another path.

pub mod archive;
pub mod collector;

use sluice_client::{ClientError, ContentStore, StoreMetadata};
use sluice_core::pipeline::PipelineKind;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::container::platform::{CopyStream, PlatformError};
use archive::{Archive, ArchiveError, ChannelReader, Extracted};
pub use collector::{ContainerCollector, FileCollector};

/// Time a copy may take to report an immediate failure before its stream is trusted
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Default ceiling on extracted artifact size (5 GiB)
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const CHUNK_SIZE: usize = 64 * 1024;
const CHUNK_QUEUE: usize = 16;

/// Data accepted after the archive ends, covering tar record padding
const MAX_TRAILING_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Nothing to collect: the path is missing or holds no regular files
    #[error("Artifact contained no files")]
    EmptyTarball,

    #[error("Failed to collect '{path}': {source}")]
    Platform {
        path: String,
        #[source]
        source: PlatformError,
    },

    #[error(transparent)]
    Archive(ArchiveError),

    #[error("Failed to upload artifact: {0}")]
    Upload(#[from] ClientError),

    #[error("I/O error while collecting artifact: {0}")]
    Io(#[from] io::Error),

    #[error("Extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ArtifactError {
    pub fn is_empty(&self) -> bool {
        matches!(self, ArtifactError::EmptyTarball)
    }

    fn from_platform(path: &str, source: PlatformError) -> Self {
        if source.is_not_found() {
            return ArtifactError::EmptyTarball;
        }
        ArtifactError::Platform {
            path: path.to_string(),
            source,
        }
    }
}

impl From<ArchiveError> for ArtifactError {
    fn from(error: ArchiveError) -> Self {
        match error {
            ArchiveError::EmptyTarball => ArtifactError::EmptyTarball,
            other => ArtifactError::Archive(other),
        }
    }
}

/// A path collected out of a container
#[derive(Debug, Clone)]
pub struct Artifact {
    pub container_id: String,
    pub guest_path: String,
    /// Tarball written on the host
    pub host_tar_path: PathBuf,
    /// Directory the tarball is extracted into
    pub host_dir: PathBuf,
    pub application_id: String,
    pub kind: PipelineKind,
    pub run_id: String,
    pub step_id: String,
    pub content_type: String,
}

impl Artifact {
    /// Last component of the guest path, the root of the copied tar stream
    pub fn guest_name(&self) -> String {
        self.guest_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    pub fn file_name(&self) -> String {
        self.host_tar_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.tar", self.guest_name()))
    }

    /// Key the artifact is stored under remotely
    pub fn remote_key(&self) -> String {
        format!(
            "project-artifacts/{}/{}/{}/step/{}/{}",
            self.application_id,
            self.kind,
            self.run_id,
            self.step_id,
            self.file_name()
        )
    }
}

/// Collects artifacts and hands them to the content store
pub struct Artificer {
    store: Option<Arc<dyn ContentStore>>,
    max_bytes: u64,
    max_tries: u32,
    grace: Duration,
}

impl Artificer {
    pub fn new(store: Option<Arc<dyn ContentStore>>, max_bytes: u64, max_tries: u32) -> Self {
        Self {
            store,
            max_bytes,
            max_tries,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    #[cfg(test)]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Copies the artifact out of the container and extracts it on the host
    pub async fn collect(
        &self,
        collector: &dyn FileCollector,
        artifact: &Artifact,
    ) -> Result<Extracted, ArtifactError> {
        let path = artifact.guest_path.as_str();
        debug!("Collecting {} from {}", path, collector.container_id());

        let CopyStream {
            mut reader,
            errors: mut pending,
        } = collector
            .collect(path)
            .await
            .map_err(|e| ArtifactError::from_platform(path, e))?;

        // A missing path is usually reported right away
        let early = tokio::select! {
            result = &mut pending => Some(result),
            _ = tokio::time::sleep(self.grace) => None,
        };
        let errors = match early {
            Some(Ok(error)) => return Err(ArtifactError::from_platform(path, error)),
            Some(Err(_)) => None,
            None => Some(pending),
        };

        if let Some(parent) = artifact.host_tar_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&artifact.host_tar_path).await?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(CHUNK_QUEUE);
        let pump = tokio::spawn(async move {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut sender = Some(tx);
            let mut total = 0u64;
            let mut trailing = 0u64;
            loop {
                let n = reader.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buffer[..n]).await?;
                total += n as u64;
                match &sender {
                    Some(tx) => {
                        if tx.send(buffer[..n].to_vec()).await.is_err() {
                            // Extraction stopped reading
                            sender = None;
                        }
                    }
                    None => {
                        trailing += n as u64;
                        if trailing > MAX_TRAILING_BYTES {
                            debug!("Ignoring stream data after the end of the archive");
                            break;
                        }
                    }
                }
            }
            file.flush().await?;
            Ok::<u64, io::Error>(total)
        });

        let root = artifact.guest_name();
        let dest = artifact.host_dir.clone();
        let max_bytes = self.max_bytes;
        let extraction = tokio::task::spawn_blocking(move || {
            Archive::new(ChannelReader::new(rx)).multi(&root, &dest, max_bytes)
        });

        let extracted = extraction.await;
        let copied = pump.await;
        let result = settle(path, extracted, copied, errors).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&artifact.host_tar_path).await;
        }

        let (extracted, copied) = result?;
        info!(
            "Collected {} ({} file(s), {} bytes streamed)",
            path, extracted.files, copied
        );
        Ok(extracted)
    }

    /// Collects the first candidate that is not empty
    ///
    /// Returns `None` when every candidate was empty.
    pub async fn collect_first(
        &self,
        collector: &dyn FileCollector,
        candidates: &[Artifact],
    ) -> Result<Option<Artifact>, ArtifactError> {
        for candidate in candidates {
            match self.collect(collector, candidate).await {
                Ok(_) => return Ok(Some(candidate.clone())),
                Err(e) if e.is_empty() => {
                    debug!("{} is empty, trying next candidate", candidate.guest_path);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Reads a single file out of the container into memory
    pub async fn collect_bytes(
        &self,
        collector: &dyn FileCollector,
        guest_file: &str,
    ) -> Result<Vec<u8>, ArtifactError> {
        let CopyStream { mut reader, errors } = collector
            .collect(guest_file)
            .await
            .map_err(|e| ArtifactError::from_platform(guest_file, e))?;

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        if let Ok(error) = errors.await {
            return Err(ArtifactError::from_platform(guest_file, error));
        }

        let name = guest_file.rsplit('/').next().unwrap_or(guest_file).to_string();
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(Archive::new(&data[..]).single_bytes(&name));
        });
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ArtifactError::Io(io::Error::other("extraction task ended early"))),
        }
    }

    /// Uploads the artifact tarball, returning false when no store is configured
    pub async fn upload(&self, artifact: &Artifact) -> Result<bool, ArtifactError> {
        let Some(store) = &self.store else {
            debug!("No content store configured, keeping {}", artifact.host_tar_path.display());
            return Ok(false);
        };

        let mut metadata = StoreMetadata::new();
        metadata.insert("Application-Id".to_string(), artifact.application_id.clone());
        metadata.insert("Run-Id".to_string(), artifact.run_id.clone());
        metadata.insert("Step-Id".to_string(), artifact.step_id.clone());

        let key = artifact.remote_key();
        store
            .store_from_file(
                &artifact.host_tar_path,
                &key,
                &artifact.content_type,
                self.max_tries,
                &metadata,
            )
            .await?;

        info!("Uploaded {} as {}", artifact.guest_path, key);
        Ok(true)
    }
}

/// Combines the outcome of extraction, the copy pump and the copy itself
///
/// Archive violations are reported before copy errors.
async fn settle(
    path: &str,
    extracted: Result<Result<Extracted, ArchiveError>, tokio::task::JoinError>,
    copied: Result<io::Result<u64>, tokio::task::JoinError>,
    errors: Option<oneshot::Receiver<PlatformError>>,
) -> Result<(Extracted, u64), ArtifactError> {
    let extracted = match extracted? {
        Err(e @ (ArchiveError::SizeLimitExceeded { .. } | ArchiveError::UnsafePath(_))) => {
            return Err(e.into());
        }
        other => other,
    };
    let copied = copied??;

    if let Some(pending) = errors {
        if let Ok(error) = pending.await {
            return Err(ArtifactError::from_platform(path, error));
        }
    }

    Ok((extracted?, copied))
}
