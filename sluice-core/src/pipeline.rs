//! Pipeline domain types
//!
//! The definition a runner is handed (box, services, steps, after-steps)
//! and the result it reports back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::step::{DefinitionError, StepConfig};

/// Whether the pipeline builds or deploys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    #[default]
    Build,
    Deploy,
}

impl PipelineKind {
    /// Variable carrying the run id inside the guest
    pub fn id_env_key(&self) -> &'static str {
        match self {
            PipelineKind::Build => "WERCKER_BUILD_ID",
            PipelineKind::Deploy => "WERCKER_DEPLOY_ID",
        }
    }

    /// Flag variable set to `true` inside the guest
    pub fn flag_env_key(&self) -> &'static str {
        match self {
            PipelineKind::Build => "BUILD",
            PipelineKind::Deploy => "DEPLOY",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Build => write!(f, "build"),
            PipelineKind::Deploy => write!(f, "deploy"),
        }
    }
}

/// Primary container configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxConfig {
    pub image: String,
    /// Shell used to drive the container
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Auxiliary container started and linked before the primary box
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Link alias, derived from the image when absent
    #[serde(default)]
    pub name: Option<String>,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Command overriding the image default
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

impl ServiceConfig {
    /// Link alias for the service, e.g. `postgres` for `docker.io/library/postgres:16`
    pub fn alias(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let last = self.image.rsplit('/').next().unwrap_or(&self.image);
        last.split([':', '@']).next().unwrap_or(last).to_string()
    }
}

/// Pipeline definition handed to the runner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(rename = "box")]
    pub box_config: BoxConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub after_steps: Vec<StepConfig>,
    /// Extra variables layered on top of the base environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl PipelineDefinition {
    pub fn from_json(source: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

/// The step that caused a pipeline to fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub name: String,
    pub display_name: String,
    pub message: String,
}

/// Outcome of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub safe_id: String,
    pub display_name: String,
    pub success: bool,
    pub exit_code: i32,
    pub message: Option<String>,
    pub duration: Duration,
}

/// Outcome of the whole pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub failed_step: Option<FailedStep>,
    pub steps: Vec<StepResult>,
    pub after_steps: Vec<StepResult>,
}

impl PipelineResult {
    /// Variables describing the result, exported to after-steps
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![(
            "WERCKER_RESULT".to_string(),
            if self.success { "passed" } else { "failed" }.to_string(),
        )];

        if let Some(failed) = &self.failed_step {
            pairs.push((
                "WERCKER_FAILED_STEP_DISPLAY_NAME".to_string(),
                failed.display_name.clone(),
            ));
            pairs.push(("WERCKER_FAILED_STEP_MESSAGE".to_string(), failed.message.clone()));
        }

        pairs
    }
}
