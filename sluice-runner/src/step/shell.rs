//! Steps backed by a directory holding `run.sh`

use async_trait::async_trait;
use sluice_core::Environment;
use sluice_core::environment::shell_quote;
use sluice_core::step::{StepDescriptor, StepId, step_env_key};
use std::path::PathBuf;
use tracing::{debug, warn};

use super::fetch::{self, INIT_SCRIPT, RUN_SCRIPT};
use super::{
    ArtifactCollector, EnvironmentInitializer, Executable, FetchContext, Fetchable, StepContext,
    StepError, StepMetadata,
};
use crate::artifact::Artifact;
use crate::layout::Layout;

/// Where the step implementation comes from
#[derive(Debug, Clone)]
pub enum ShellSource {
    Script { code: String },
    Registry(StepId),
    Local(PathBuf),
}

#[derive(Debug)]
pub struct ShellStep {
    metadata: StepMetadata,
    source: ShellSource,
    descriptor: Option<StepDescriptor>,
    host_dir: Option<PathBuf>,
}

impl ShellStep {
    pub fn new(metadata: StepMetadata, source: ShellSource) -> Self {
        Self {
            metadata,
            source,
            descriptor: None,
            host_dir: None,
        }
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    fn report_dir(&self, layout: &Layout) -> String {
        layout.guest_step_report_dir(&self.metadata.safe_id)
    }

    /// Reads the message the step left in its report directory
    pub async fn report_message(&self, ctx: &StepContext<'_>) -> Option<String> {
        let path = format!("{}/message.txt", self.report_dir(ctx.layout));
        match ctx.artificer.collect_bytes(ctx.collector, &path).await {
            Ok(bytes) => {
                let message = String::from_utf8_lossy(&bytes).trim().to_string();
                (!message.is_empty()).then_some(message)
            }
            Err(e) => {
                if !e.is_empty() {
                    debug!("Could not read {}: {}", path, e);
                }
                None
            }
        }
    }
}

#[async_trait]
impl Fetchable for ShellStep {
    async fn fetch(&mut self, ctx: &FetchContext<'_>) -> Result<(), StepError> {
        let dest = ctx.layout.host_step_dir(&self.metadata.safe_id);

        match &self.source {
            ShellSource::Script { code } => fetch::write_script(&dest, code).await?,
            ShellSource::Local(path) => {
                if !path.is_dir() {
                    return Err(StepError::LocalNotFound(path.clone()));
                }
                fetch::copy_dir(path, &dest).await?;
            }
            ShellSource::Registry(id) => {
                let cached = fetch::fetch_registry_step(id, ctx.layout, ctx.registry).await?;
                fetch::copy_dir(&cached, &dest).await?;
            }
        }

        self.descriptor = StepDescriptor::load(&dest)?;
        debug!("Fetched step {} into {}", self.metadata.display_name, dest.display());
        self.host_dir = Some(dest);
        Ok(())
    }
}

impl EnvironmentInitializer for ShellStep {
    fn init_env(&mut self, env: &Environment, layout: &Layout) -> Result<(), StepError> {
        let metadata = &self.metadata;
        let report = self.report_dir(layout);

        let mut step_env = Environment::default();
        step_env.update([
            ("WERCKER_STEP_ROOT", layout.guest_step_dir(&metadata.safe_id)),
            ("WERCKER_STEP_ID", metadata.safe_id.clone()),
            ("WERCKER_STEP_OWNER", metadata.owner.clone()),
            ("WERCKER_STEP_NAME", metadata.name.clone()),
            ("WERCKER_REPORT_NUMBERS_FILE", format!("{}/numbers.ini", report)),
            ("WERCKER_REPORT_MESSAGE_FILE", format!("{}/message.txt", report)),
            ("WERCKER_REPORT_ARTIFACTS_DIR", format!("{}/artifacts", report)),
        ]);

        let properties = match &self.descriptor {
            Some(descriptor) => descriptor.resolve(&metadata.name, &metadata.data, env)?,
            None => metadata
                .data
                .iter()
                .map(|(key, value)| (key.clone(), env.interpolate(value)))
                .collect(),
        };

        let is_script = matches!(self.source, ShellSource::Script { .. });
        for (key, value) in properties {
            if is_script && key == "code" {
                continue;
            }
            step_env.add(step_env_key(&metadata.name, &key), value);
        }

        self.metadata.env = step_env;
        Ok(())
    }
}

#[async_trait]
impl Executable for ShellStep {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<i32, StepError> {
        let metadata = &self.metadata;
        let host_dir = self
            .host_dir
            .as_ref()
            .ok_or_else(|| StepError::NotFetched(metadata.display_name.clone()))?;

        let layout = ctx.layout;
        let guest_dir = layout.guest_step_dir(&metadata.safe_id);
        let cwd = match &metadata.cwd {
            Some(cwd) if cwd.starts_with('/') => cwd.clone(),
            Some(cwd) => format!("{}/{}", layout.guest_source_dir(), cwd),
            None => layout.guest_source_dir(),
        };

        let mut setup = Vec::new();
        if self.should_sync_env() {
            setup.extend(metadata.env.export());
        }
        setup.push(format!(
            "mkdir -p {} {}",
            shell_quote(&format!("{}/artifacts", self.report_dir(layout))),
            shell_quote(&layout.guest_steps_dir())
        ));
        setup.push(format!(
            "rm -rf {guest} && cp -r {} {guest}",
            shell_quote(&layout.mnt_step_dir(&metadata.safe_id)),
            guest = shell_quote(&guest_dir)
        ));
        setup.push(format!("cd {}", shell_quote(&cwd)));

        ctx.session.hide_logs();
        let prepared = ctx.session.send_checked(&setup).await;
        ctx.session.show_logs();
        let prepared = prepared?;
        if !prepared.success() {
            warn!("Preparing step {} failed with exit code {}", metadata.display_name, prepared.exit_code);
            return Ok(prepared.exit_code);
        }

        if host_dir.join(INIT_SCRIPT).exists() {
            let init = ctx
                .session
                .send_checked(&[format!(". {}", shell_quote(&format!("{}/{}", guest_dir, INIT_SCRIPT)))])
                .await?;
            if !init.success() {
                return Ok(init.exit_code);
            }
        }

        let run = ctx
            .session
            .send_checked(&[format!(
                "( set -e; . {} ) < /dev/null",
                shell_quote(&format!("{}/{}", guest_dir, RUN_SCRIPT))
            )])
            .await?;
        Ok(run.exit_code)
    }
}

#[async_trait]
impl ArtifactCollector for ShellStep {
    async fn collect_artifacts(&self, ctx: &StepContext<'_>) -> Result<Option<Artifact>, StepError> {
        let safe_id = &self.metadata.safe_id;
        let artifact = ctx.layout.artifact(
            ctx.collector.container_id(),
            &format!("{}/artifacts", self.report_dir(ctx.layout)),
            ctx.layout.host_artifacts_dir().join(safe_id),
            &format!("{}.tar", safe_id),
            safe_id,
        );

        match ctx.artificer.collect(ctx.collector, &artifact).await {
            Ok(_) => {}
            Err(e) if e.is_empty() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        ctx.artificer.upload(&artifact).await?;
        Ok(Some(artifact))
    }
}
