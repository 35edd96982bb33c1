//! Step kinds and their constructors
//!
//! The kind of a step is decided once, from its id, when the pipeline is
//! built. Each kind maps to a constructor producing the matching [`Step`].

use sluice_core::step::{DEFAULT_STEP_OWNER, StepConfig, StepId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ShellSource, ShellStep, Step, StepError, StepMetadata, StoreStep};

/// Id of the synthetic step storing the pipeline output
pub const STORE_STEP_ID: &str = "internal/store";

const LOCAL_PREFIX: &str = "path:";
const INTERNAL_PREFIX: &str = "internal/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Inline code from the `code` property
    Script,
    /// Directory on the host
    Local(PathBuf),
    /// Tarball from the step registry
    Registry(StepId),
    /// Built into the runner, e.g. `internal/store`
    Internal(String),
}

impl StepKind {
    /// Classifies a step id; relative local paths are resolved against `base_dir`
    pub fn parse(id: &str, base_dir: &Path) -> Result<Self, StepError> {
        if id == "script" {
            return Ok(StepKind::Script);
        }
        if let Some(path) = id.strip_prefix(LOCAL_PREFIX) {
            let path = Path::new(path.trim());
            return Ok(StepKind::Local(base_dir.join(path)));
        }
        if let Some(name) = id.strip_prefix(INTERNAL_PREFIX) {
            return Ok(StepKind::Internal(name.to_string()));
        }
        Ok(StepKind::Registry(StepId::parse(id)?))
    }

    /// Key the constructor for this kind is registered under
    fn key(&self) -> String {
        match self {
            StepKind::Script => "script".to_string(),
            StepKind::Local(_) => "local".to_string(),
            StepKind::Registry(_) => "registry".to_string(),
            StepKind::Internal(name) => format!("{}{}", INTERNAL_PREFIX, name),
        }
    }
}

pub type StepConstructor = fn(&StepConfig, StepKind, usize) -> Result<Step, StepError>;

pub struct StepRegistry {
    constructors: HashMap<String, StepConstructor>,
    base_dir: PathBuf,
}

impl StepRegistry {
    /// Registry with every built-in kind
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
            base_dir: base_dir.into(),
        };
        registry.register("script", build_script);
        registry.register("local", build_local);
        registry.register("registry", build_registry);
        registry.register(STORE_STEP_ID, build_store);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: StepConstructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn build(&self, config: &StepConfig, order: usize) -> Result<Step, StepError> {
        let kind = StepKind::parse(&config.id, &self.base_dir)?;
        let constructor = self
            .constructors
            .get(&kind.key())
            .ok_or_else(|| StepError::UnknownKind(config.id.clone()))?;

        debug!("Building step '{}' as {:?}", config.id, kind);
        constructor(config, kind, order)
    }

    /// Builds steps in order, numbering them from `first_order`
    pub fn build_all(&self, configs: &[StepConfig], first_order: usize) -> Result<Vec<Step>, StepError> {
        configs
            .iter()
            .enumerate()
            .map(|(i, config)| self.build(config, first_order + i))
            .collect()
    }
}

fn build_script(config: &StepConfig, _kind: StepKind, order: usize) -> Result<Step, StepError> {
    let metadata = StepMetadata::new(config, DEFAULT_STEP_OWNER, "script", None, order);
    let code = config
        .data
        .get("code")
        .cloned()
        .ok_or_else(|| StepError::MissingCode(metadata.display_name.clone()))?;
    Ok(Step::Shell(ShellStep::new(metadata, ShellSource::Script { code })))
}

fn build_local(config: &StepConfig, kind: StepKind, order: usize) -> Result<Step, StepError> {
    let StepKind::Local(path) = kind else {
        return Err(StepError::UnknownKind(config.id.clone()));
    };
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "local".to_string());
    let metadata = StepMetadata::new(config, "local", name, None, order);
    Ok(Step::Shell(ShellStep::new(metadata, ShellSource::Local(path))))
}

fn build_registry(config: &StepConfig, kind: StepKind, order: usize) -> Result<Step, StepError> {
    let StepKind::Registry(id) = kind else {
        return Err(StepError::UnknownKind(config.id.clone()));
    };
    let metadata = StepMetadata::new(config, id.owner.clone(), id.name.clone(), id.version.clone(), order);
    Ok(Step::Shell(ShellStep::new(metadata, ShellSource::Registry(id))))
}

fn build_store(config: &StepConfig, _kind: StepKind, order: usize) -> Result<Step, StepError> {
    let mut config = config.clone();
    config.name.get_or_insert_with(|| "store".to_string());
    let metadata = StepMetadata::new(&config, "internal", "store", None, order);
    Ok(Step::Store(StoreStep::new(metadata)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> StepConfig {
        StepConfig {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_kinds() {
        let base = Path::new("/src");
        assert_eq!(StepKind::parse("script", base).unwrap(), StepKind::Script);
        assert_eq!(
            StepKind::parse("path:steps/lint", base).unwrap(),
            StepKind::Local(PathBuf::from("/src/steps/lint"))
        );
        assert_eq!(
            StepKind::parse("path:/opt/steps/lint", base).unwrap(),
            StepKind::Local(PathBuf::from("/opt/steps/lint"))
        );
        assert_eq!(
            StepKind::parse("internal/store", base).unwrap(),
            StepKind::Internal("store".to_string())
        );
        assert!(matches!(
            StepKind::parse("acme/lint@1.0", base).unwrap(),
            StepKind::Registry(id) if id.cache_key() == "acme-lint@1.0"
        ));
    }

    #[test]
    fn test_build_all_orders_steps() {
        let registry = StepRegistry::new("/src");
        let steps = registry
            .build_all(
                &[StepConfig::script("unit", "make test"), config("path:tools/lint"), config("acme/deploy")],
                0,
            )
            .unwrap();

        assert!(matches!(&steps[0], Step::Shell(_)));
        assert_eq!(steps[0].metadata().name, "script");
        assert_eq!(steps[0].metadata().display_name, "unit");
        assert_eq!(steps[1].metadata().name, "lint");
        assert_eq!(steps[2].metadata().owner, "acme");
        assert_eq!(steps[2].metadata().order, 2);
    }

    #[test]
    fn test_build_store_step() {
        let registry = StepRegistry::new("/src");
        let step = registry.build(&config(STORE_STEP_ID), 5).unwrap();

        assert!(matches!(step, Step::Store(_)));
        assert_eq!(step.metadata().display_name, "store");
    }

    #[test]
    fn test_unknown_internal_step() {
        let registry = StepRegistry::new("/src");
        let err = registry.build(&config("internal/watch"), 0).err().unwrap();
        assert!(matches!(err, StepError::UnknownKind(id) if id == "internal/watch"));
    }

    #[test]
    fn test_script_without_code() {
        let registry = StepRegistry::new("/src");
        let err = registry.build(&config("script"), 0).err().unwrap();
        assert!(matches!(err, StepError::MissingCode(_)));
    }
}
