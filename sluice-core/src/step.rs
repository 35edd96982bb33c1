//! Step definition types
//!
//! A step is referenced from a pipeline definition by an id string and
//! optionally carries raw key/value configuration. Fetched steps describe
//! themselves through a `step.json` descriptor that declares the
//! properties they understand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::environment::Environment;

/// Owner assumed for registry steps referenced without one
pub const DEFAULT_STEP_OWNER: &str = "sluice";

/// Name of the descriptor file inside a fetched step directory
pub const STEP_DESCRIPTOR_FILE: &str = "step.json";

/// Errors raised while reading step or pipeline definitions
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Invalid step id '{0}'")]
    InvalidStepId(String),

    #[error("Step '{step}' is missing required property '{property}'")]
    MissingRequiredProperty { step: String, property: String },

    #[error("Failed to parse definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read definition: {0}")]
    Io(#[from] std::io::Error),
}

/// A step as written in the pipeline definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// `script`, `owner/name[@version]`, `path:<dir>` or `internal/<kind>`
    pub id: String,

    /// Display name, defaults to the step name
    #[serde(default)]
    pub name: Option<String>,

    /// Working directory inside the guest
    #[serde(default)]
    pub cwd: Option<String>,

    /// Raw configuration passed to the step
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl StepConfig {
    pub fn script(name: impl Into<String>, code: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert("code".to_string(), code.into());
        Self {
            id: "script".to_string(),
            name: Some(name.into()),
            cwd: None,
            data,
        }
    }
}

/// Identity of a step: `{owner, name, version}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId {
    pub owner: String,
    pub name: String,
    pub version: Option<String>,
}

impl StepId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            version,
        }
    }

    /// Parses `name`, `owner/name` or either of those with an `@version` suffix
    pub fn parse(id: &str) -> Result<Self, DefinitionError> {
        let (path, version) = match id.split_once('@') {
            Some((path, version)) if !version.is_empty() => (path, Some(version.to_string())),
            Some(_) => return Err(DefinitionError::InvalidStepId(id.to_string())),
            None => (id, None),
        };

        let (owner, name) = match path.split_once('/') {
            Some((owner, name)) => (owner, name),
            None => (DEFAULT_STEP_OWNER, path),
        };

        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(owner) || !valid(name) {
            return Err(DefinitionError::InvalidStepId(id.to_string()));
        }

        Ok(Self::new(owner, name, version))
    }

    /// On-disk cache key, `owner-name[@version]`
    pub fn cache_key(&self) -> String {
        match &self.version {
            Some(version) => format!("{}-{}@{}", self.owner, self.name, version),
            None => format!("{}-{}", self.owner, self.name),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)?;
        if let Some(version) = &self.version {
            write!(f, "@{}", version)?;
        }
        Ok(())
    }
}

/// Property declared by a step descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type")]
    pub property_type: Option<String>,
}

/// Contents of a step's `step.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDescriptor>,
}

impl StepDescriptor {
    /// Reads the descriptor from a fetched step directory, if one exists
    pub fn load(step_dir: &Path) -> Result<Option<Self>, DefinitionError> {
        let path = step_dir.join(STEP_DESCRIPTOR_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Resolves the configured data against the declared properties
    ///
    /// Given values are interpolated against `env`. Declared properties the
    /// user omitted fall back to their default; a required property without
    /// value or default is an error. Returns `(key, value)` pairs, user
    /// data first.
    pub fn resolve(
        &self,
        step_name: &str,
        data: &BTreeMap<String, String>,
        env: &Environment,
    ) -> Result<Vec<(String, String)>, DefinitionError> {
        let mut resolved: Vec<(String, String)> = data
            .iter()
            .map(|(key, value)| (key.clone(), env.interpolate(value)))
            .collect();

        for (key, property) in &self.properties {
            if data.contains_key(key) {
                continue;
            }
            match &property.default {
                Some(default) => resolved.push((key.clone(), env.interpolate(default))),
                None if property.required => {
                    return Err(DefinitionError::MissingRequiredProperty {
                        step: step_name.to_string(),
                        property: key.clone(),
                    });
                }
                None => {}
            }
        }

        Ok(resolved)
    }
}

/// Environment variable name for a step property
///
/// `WERCKER_<STEPNAME>_<KEY>`, uppercased with hyphens turned into underscores.
pub fn step_env_key(step_name: &str, key: &str) -> String {
    let normalize = |s: &str| s.to_uppercase().replace(['-', '.'], "_");
    format!("WERCKER_{}_{}", normalize(step_name), normalize(key))
}
