//! Pipeline steps
//!
//! A step moves through `unfetched -> fetched -> env-initialized ->
//! executing -> succeeded | failed`. The kinds form a closed set:
//! - [`ShellStep`]: scripts, registry steps and local steps, all of which
//!   end up as a directory with a `run.sh` sourced inside the guest
//! - [`StoreStep`]: the synthetic step exporting the pipeline output
//!
//! Shared data lives in [`StepMetadata`]; kind-specific behavior is reached
//! through the capability traits below.

mod fetch;
mod registry;
mod shell;
mod store;

use async_trait::async_trait;
use sluice_client::{ClientError, RegistryClient};
use sluice_core::Environment;
use sluice_core::event::StepRef;
use sluice_core::step::{DefinitionError, StepConfig};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactError, Artificer, FileCollector};
use crate::container::platform::{ContainerPlatform, PlatformError};
use crate::layout::Layout;
use crate::session::{CommandFailure, INCOMPLETE_EXIT_CODE, Session};

pub(crate) use fetch::copy_dir;
pub use registry::{STORE_STEP_ID, StepRegistry};
pub use shell::{ShellSource, ShellStep};
pub use store::StoreStep;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("Unknown step kind '{0}'")]
    UnknownKind(String),

    #[error("Script step '{0}' has no code")]
    MissingCode(String),

    #[error("Local step directory '{0}' does not exist")]
    LocalNotFound(PathBuf),

    #[error("No step registry configured to fetch '{0}'")]
    NoRegistry(String),

    #[error("Failed to download step '{step}': {source}")]
    Download {
        step: String,
        #[source]
        source: ClientError,
    },

    #[error("Step '{0}' was not fetched")]
    NotFetched(String),

    #[error(transparent)]
    Command(#[from] CommandFailure),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StepError {
    /// Exit code reported for a step that did not run to completion
    pub fn exit_code(&self) -> i32 {
        INCOMPLETE_EXIT_CODE
    }
}

/// Data every step carries regardless of its kind
#[derive(Debug, Clone)]
pub struct StepMetadata {
    /// Id as written in the pipeline definition
    pub id: String,
    pub owner: String,
    pub name: String,
    pub version: Option<String>,
    /// Unique per instance, used for on-disk directories
    pub safe_id: String,
    pub display_name: String,
    pub cwd: Option<String>,
    /// Step-local variables, filled by `init_env`
    pub env: Environment,
    pub data: BTreeMap<String, String>,
    pub order: usize,
}

impl StepMetadata {
    pub fn new(
        config: &StepConfig,
        owner: impl Into<String>,
        name: impl Into<String>,
        version: Option<String>,
        order: usize,
    ) -> Self {
        let name = name.into();
        Self {
            id: config.id.clone(),
            owner: owner.into(),
            safe_id: format!("{}-{}", path_safe(&name), Uuid::new_v4()),
            display_name: config.name.clone().unwrap_or_else(|| name.clone()),
            name,
            version,
            cwd: config.cwd.clone(),
            env: Environment::default(),
            data: config.data.clone(),
            order,
        }
    }

    pub fn step_ref(&self) -> StepRef {
        StepRef {
            safe_id: self.safe_id.clone(),
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            order: self.order,
        }
    }
}

fn path_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// What fetching needs
pub struct FetchContext<'a> {
    pub layout: &'a Layout,
    pub registry: Option<&'a RegistryClient>,
}

/// What executing a step needs
pub struct StepContext<'a> {
    pub session: &'a Session,
    pub layout: &'a Layout,
    pub artificer: &'a Artificer,
    pub collector: &'a dyn FileCollector,
    pub platform: &'a dyn ContainerPlatform,
}

/// Materializes the step implementation on the host
#[async_trait]
pub trait Fetchable {
    async fn fetch(&mut self, ctx: &FetchContext<'_>) -> Result<(), StepError>;
}

pub trait EnvironmentInitializer {
    /// Builds the step environment from the pipeline environment
    fn init_env(&mut self, env: &Environment, layout: &Layout) -> Result<(), StepError>;

    /// Whether the step environment is exported into the guest shell
    fn should_sync_env(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait Executable {
    /// Runs the step and returns the shell exit code
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<i32, StepError>;
}

#[async_trait]
pub trait ArtifactCollector {
    /// Collects what the step left in its artifacts directory
    async fn collect_artifacts(&self, ctx: &StepContext<'_>) -> Result<Option<Artifact>, StepError>;
}

pub enum Step {
    Shell(ShellStep),
    Store(StoreStep),
}

impl Step {
    pub fn metadata(&self) -> &StepMetadata {
        match self {
            Step::Shell(step) => step.metadata(),
            Step::Store(step) => step.metadata(),
        }
    }

    pub async fn fetch(&mut self, ctx: &FetchContext<'_>) -> Result<(), StepError> {
        match self {
            Step::Shell(step) => step.fetch(ctx).await,
            Step::Store(_) => Ok(()),
        }
    }

    pub fn init_env(&mut self, env: &Environment, layout: &Layout) -> Result<(), StepError> {
        match self {
            Step::Shell(step) => step.init_env(env, layout),
            Step::Store(step) => step.init_env(env, layout),
        }
    }

    pub async fn execute(&self, ctx: &StepContext<'_>) -> Result<i32, StepError> {
        match self {
            Step::Shell(step) => step.execute(ctx).await,
            Step::Store(step) => step.execute(ctx).await,
        }
    }

    pub async fn collect_artifacts(&self, ctx: &StepContext<'_>) -> Result<Option<Artifact>, StepError> {
        match self {
            Step::Shell(step) => step.collect_artifacts(ctx).await,
            Step::Store(_) => Ok(None),
        }
    }

    /// Failure message the step wrote to its report file, if any
    pub async fn report_message(&self, ctx: &StepContext<'_>) -> Option<String> {
        match self {
            Step::Shell(step) => step.report_message(ctx).await,
            Step::Store(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults() {
        let config = StepConfig {
            id: "acme/go build@2.0".to_string(),
            ..Default::default()
        };
        let metadata = StepMetadata::new(&config, "acme", "go build", Some("2.0".to_string()), 3);

        assert_eq!(metadata.display_name, "go build");
        assert!(metadata.safe_id.starts_with("go-build-"));
        assert_eq!(metadata.step_ref().order, 3);
    }

    #[test]
    fn test_safe_ids_are_unique() {
        let config = StepConfig::script("test", "make test");
        let a = StepMetadata::new(&config, "sluice", "script", None, 0);
        let b = StepMetadata::new(&config, "sluice", "script", None, 1);

        assert_eq!(a.display_name, "test");
        assert_ne!(a.safe_id, b.safe_id);
    }
}
