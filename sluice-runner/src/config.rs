//! Runner configuration
//!
//! Every option can be given as a flag or through a `SLUICE_*` environment
//! variable.

use clap::{Parser, ValueEnum};
use sluice_core::pipeline::PipelineKind;
use std::path::PathBuf;
use std::time::Duration;

use crate::artifact::DEFAULT_MAX_ARTIFACT_BYTES;
use crate::session::SessionTimeouts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Build,
    Deploy,
}

impl From<KindArg> for PipelineKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Build => PipelineKind::Build,
            KindArg::Deploy => PipelineKind::Deploy,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sluice")]
#[command(about = "Runs a CI pipeline inside a container", long_about = None)]
pub struct Config {
    /// Pipeline definition (JSON)
    #[arg(long, env = "SLUICE_PIPELINE", default_value = "sluice.json")]
    pub pipeline: PathBuf,

    /// Project source directory copied into the container
    #[arg(long, env = "SLUICE_SOURCE_DIR", default_value = ".")]
    pub source_dir: PathBuf,

    /// Directory holding per-run workspaces
    #[arg(long, env = "SLUICE_WORKING_DIR", default_value = ".sluice")]
    pub working_dir: PathBuf,

    /// Root of the pipeline inside the container
    #[arg(long, env = "SLUICE_GUEST_ROOT", default_value = "/pipeline")]
    pub guest_root: String,

    /// Whether this run builds or deploys
    #[arg(long, env = "SLUICE_KIND", value_enum, default_value_t = KindArg::Build)]
    pub kind: KindArg,

    /// Build id, generated when absent
    #[arg(long, env = "SLUICE_BUILD_ID")]
    pub build_id: Option<String>,

    /// Deploy id, generated when absent
    #[arg(long, env = "SLUICE_DEPLOY_ID")]
    pub deploy_id: Option<String>,

    #[arg(long, env = "SLUICE_APPLICATION_ID", default_value = "local")]
    pub application_id: String,

    /// Reported as WERCKER_STARTED_BY
    #[arg(long, env = "SLUICE_STARTED_BY", default_value = "sluice")]
    pub started_by: String,

    /// Minutes a command may go without output
    #[arg(long, env = "SLUICE_NO_RESPONSE_TIMEOUT", default_value_t = 5)]
    pub no_response_timeout: u64,

    /// Minutes a command may run
    #[arg(long, env = "SLUICE_COMMAND_TIMEOUT", default_value_t = 25)]
    pub command_timeout: u64,

    /// Upper bound on the extracted size of an artifact
    #[arg(long, env = "SLUICE_ARTIFACT_MAX_BYTES", default_value_t = DEFAULT_MAX_ARTIFACT_BYTES)]
    pub artifact_max_bytes: u64,

    /// Content store base URL; artifacts stay local when absent
    #[arg(long, env = "SLUICE_STORE_URL")]
    pub store_url: Option<String>,

    #[arg(long, env = "SLUICE_STORE_MAX_TRIES", default_value_t = 3)]
    pub store_max_tries: u32,

    /// Step registry base URL
    #[arg(long, env = "SLUICE_REGISTRY_URL", default_value = "http://localhost:8080/steps")]
    pub registry_url: String,

    /// Container engine binary
    #[arg(long, env = "SLUICE_ENGINE", default_value = "podman")]
    pub engine: String,

    /// Keep the containers after the run
    #[arg(long, env = "SLUICE_KEEP_CONTAINER")]
    pub keep_container: bool,

    /// Commit the box to an image and export it with the output
    #[arg(long, env = "SLUICE_SHOULD_COMMIT")]
    pub should_commit: bool,

    /// Show hidden commands and output
    #[arg(long, env = "SLUICE_DEBUG")]
    pub debug: bool,

    /// Cache shared between runs
    #[arg(long, env = "SLUICE_CACHE_DIR", default_value = ".sluice/cache")]
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn pipeline_kind(&self) -> PipelineKind {
        self.kind.into()
    }

    /// Id of this run: the build or deploy id matching the kind
    pub fn run_id(&self) -> Option<&str> {
        match self.kind {
            KindArg::Build => self.build_id.as_deref(),
            KindArg::Deploy => self.deploy_id.as_deref(),
        }
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            no_output: Duration::from_secs(self.no_response_timeout * 60),
            command: Duration::from_secs(self.command_timeout * 60),
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.guest_root.is_empty() || !self.guest_root.starts_with('/') {
            anyhow::bail!("guest_root must be an absolute path");
        }

        if self.application_id.is_empty() {
            anyhow::bail!("application_id cannot be empty");
        }

        if self.run_id().is_some_and(str::is_empty) {
            anyhow::bail!("{} id cannot be empty", self.pipeline_kind());
        }

        if self.no_response_timeout == 0 {
            anyhow::bail!("no_response_timeout must be greater than 0");
        }

        if self.command_timeout == 0 {
            anyhow::bail!("command_timeout must be greater than 0");
        }

        if self.artifact_max_bytes == 0 {
            anyhow::bail!("artifact_max_bytes must be greater than 0");
        }

        if self.store_max_tries == 0 {
            anyhow::bail!("store_max_tries must be greater than 0");
        }

        if let Some(url) = &self.store_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("store_url must start with http:// or https://");
            }
        }

        if !self.registry_url.starts_with("http://") && !self.registry_url.starts_with("https://") {
            anyhow::bail!("registry_url must start with http:// or https://");
        }

        if self.engine.is_empty() {
            anyhow::bail!("engine cannot be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("sluice").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = parse(&[]);
        assert_eq!(config.pipeline_kind(), PipelineKind::Build);
        assert_eq!(config.guest_root, "/pipeline");
        assert_eq!(config.store_max_tries, 3);
        assert_eq!(config.session_timeouts().no_output, Duration::from_secs(300));
        assert_eq!(config.session_timeouts().command, Duration::from_secs(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_id_follows_kind() {
        let config = parse(&["--kind", "deploy", "--build-id", "b1", "--deploy-id", "d1"]);
        assert_eq!(config.pipeline_kind(), PipelineKind::Deploy);
        assert_eq!(config.run_id(), Some("d1"));

        let config = parse(&["--build-id", "b1"]);
        assert_eq!(config.run_id(), Some("b1"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = parse(&[]);

        config.guest_root = "pipeline".to_string();
        assert!(config.validate().is_err());
        config.guest_root = "/pipeline".to_string();

        config.command_timeout = 0;
        assert!(config.validate().is_err());
        config.command_timeout = 25;

        config.store_url = Some("not-a-url".to_string());
        assert!(config.validate().is_err());

        config.store_url = Some("https://store.example.com".to_string());
        assert!(config.validate().is_ok());
    }
}
