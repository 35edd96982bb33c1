//! Pipeline box and service containers

use sluice_core::pipeline::{BoxConfig, ServiceConfig};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::platform::{ContainerPlatform, ContainerSpec, PlatformError};
use crate::events::EventBus;
use crate::layout::MNT_ROOT;

/// The primary container steps run in
///
/// It idles on `sleep infinity`; all work goes through an attached shell.
pub struct PipelineBox {
    platform: Arc<dyn ContainerPlatform>,
    config: BoxConfig,
    name: String,
    id: Option<String>,
}

impl PipelineBox {
    pub fn new(platform: Arc<dyn ContainerPlatform>, config: BoxConfig, name: impl Into<String>) -> Self {
        Self {
            platform,
            config,
            name: name.into(),
            id: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn shell(&self) -> &str {
        &self.config.shell
    }

    fn require_id(&self) -> Result<&str, PlatformError> {
        self.id()
            .ok_or_else(|| PlatformError::NotFound(format!("box {} is not running", self.name)))
    }

    /// Creates the box with `host_root` mounted at the mount root
    pub async fn create(
        &mut self,
        env: Vec<(String, String)>,
        host_root: &Path,
        network: Option<&str>,
    ) -> Result<String, PlatformError> {
        let mut spec_env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        spec_env.extend(env);

        let spec = ContainerSpec {
            name: self.name.clone(),
            image: self.config.image.clone(),
            env: spec_env,
            mounts: vec![(host_root.to_path_buf(), MNT_ROOT.to_string())],
            network: network.map(str::to_string),
            network_alias: None,
            workdir: None,
            entrypoint: Some(self.config.shell.clone()),
            cmd: vec!["-c".to_string(), "sleep infinity".to_string()],
        };

        let id = self.platform.create_container(&spec).await?;
        debug!("Created box {} as {}", self.name, id);
        self.id = Some(id.clone());
        Ok(id)
    }

    pub async fn start(&self) -> Result<(), PlatformError> {
        let id = self.require_id()?;
        self.platform.start_container(id).await?;
        info!("Box {} running as {}", self.name, id);
        Ok(())
    }

    /// Kills every process in the box while keeping its filesystem
    pub async fn restart(&self) -> Result<(), PlatformError> {
        let id = self.require_id()?;
        info!("Restarting box {}", id);
        self.platform.restart_container(id).await
    }

    pub async fn commit(&self, image: &str) -> Result<String, PlatformError> {
        let id = self.require_id()?;
        let image_id = self.platform.commit_container(id, image).await?;
        info!("Committed box {} as {} ({})", id, image, image_id);
        Ok(image_id)
    }
}

/// Stops a container and removes it unless `keep` is set
///
/// Returns false if any of it failed; errors are only logged.
pub async fn release(platform: &dyn ContainerPlatform, id: &str, keep: bool) -> bool {
    let mut ok = true;

    if let Err(e) = platform.stop_container(id).await {
        warn!("Failed to stop container {}: {}", id, e);
        ok = false;
    }
    if keep {
        info!("Keeping container {}", id);
        return ok;
    }
    if let Err(e) = platform.remove_container(id).await {
        warn!("Failed to remove container {}: {}", id, e);
        ok = false;
    }

    ok
}

/// Auxiliary container reachable from the box by its alias
pub struct ServiceBox {
    config: ServiceConfig,
}

impl ServiceBox {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    pub fn alias(&self) -> String {
        self.config.alias()
    }

    /// Variables pointing later containers at this service
    pub fn link_env(&self) -> Vec<(String, String)> {
        let alias = self.alias();
        let prefix: String = alias
            .to_uppercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        vec![(format!("{}_HOST", prefix), alias)]
    }

    /// Creates the service on `network` with links to the services started before it
    pub async fn create(
        &self,
        platform: &dyn ContainerPlatform,
        name: String,
        network: &str,
        links: &[(String, String)],
    ) -> Result<String, PlatformError> {
        let alias = self.alias();
        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        env.extend(links.iter().cloned());

        let spec = ContainerSpec {
            name,
            image: self.config.image.clone(),
            env,
            mounts: Vec::new(),
            network: Some(network.to_string()),
            network_alias: Some(alias.clone()),
            workdir: None,
            entrypoint: None,
            cmd: self.config.cmd.clone().unwrap_or_default(),
        };

        let id = platform.create_container(&spec).await?;
        debug!("Created service {} as {}", alias, id);
        Ok(id)
    }

    /// Starts a created service
    ///
    /// A background task waits for the service to exit and reports its logs
    /// if the exit code was non-zero. Cancelling `watch` before stopping the
    /// service keeps its teardown from being reported as a crash.
    pub async fn start(
        &self,
        platform: &Arc<dyn ContainerPlatform>,
        id: &str,
        events: &EventBus,
        watch: CancellationToken,
    ) -> Result<(), PlatformError> {
        let alias = self.alias();
        platform.start_container(id).await?;
        info!("Service {} running as {}", alias, id);

        let watcher_platform = Arc::clone(platform);
        let watcher_events = events.clone();
        let watched = id.to_string();
        tokio::spawn(async move {
            let exit = tokio::select! {
                biased;
                _ = watch.cancelled() => {
                    debug!("Stopped watching service {}", alias);
                    return;
                }
                exit = watcher_platform.wait_container(&watched) => exit,
            };
            match exit {
                Ok(0) => debug!("Service {} exited cleanly", alias),
                Ok(code) => {
                    let logs = watcher_platform
                        .container_logs(&watched)
                        .await
                        .unwrap_or_else(|e| format!("(logs unavailable: {})", e));
                    warn!("Service {} exited with code {}", alias, code);
                    watcher_events.system(None, format!("Service {} exited with code {}", alias, code));
                    watcher_events.system(None, logs);
                }
                Err(e) => debug!("Stopped watching service {}: {}", alias, e),
            }
        });

        Ok(())
    }
}
