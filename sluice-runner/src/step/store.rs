//! Synthetic step storing the pipeline output
//!
//! Runs after the main steps whatever their outcome. It exports the
//! committed image when one is set, then collects the output directory,
//! falling back to the whole source directory for builds that produced no
//! output, and uploads the result.

use async_trait::async_trait;
use sluice_core::Environment;
use sluice_core::pipeline::PipelineKind;
use tracing::info;

use super::{EnvironmentInitializer, Executable, StepContext, StepError, StepMetadata};
use crate::layout::Layout;

#[derive(Debug)]
pub struct StoreStep {
    metadata: StepMetadata,
    image: Option<String>,
}

impl StoreStep {
    pub fn new(metadata: StepMetadata) -> Self {
        Self {
            metadata,
            image: None,
        }
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    /// Image exported alongside the output
    pub fn set_image(&mut self, image: Option<String>) {
        self.image = image;
    }
}

impl EnvironmentInitializer for StoreStep {
    fn init_env(&mut self, _env: &Environment, _layout: &Layout) -> Result<(), StepError> {
        Ok(())
    }

    fn should_sync_env(&self) -> bool {
        false
    }
}

#[async_trait]
impl Executable for StoreStep {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<i32, StepError> {
        let layout = ctx.layout;
        let container_id = ctx.collector.container_id();
        let safe_id = &self.metadata.safe_id;

        if let Some(image) = &self.image {
            let dest = layout.host_root().join("image.tar");
            ctx.platform.export_image(image, &dest).await?;
            info!("Exported image {} to {}", image, dest.display());

            let artifact = layout.artifact(container_id, image, layout.host_root().join("image"), "image.tar", safe_id);
            ctx.artificer.upload(&artifact).await?;
        }

        let mut candidates = vec![layout.artifact(
            container_id,
            &layout.guest_output_dir(),
            layout.host_output_dir(),
            "output.tar",
            safe_id,
        )];
        if layout.kind() == PipelineKind::Build {
            candidates.push(layout.artifact(
                container_id,
                &layout.guest_source_dir(),
                layout.host_output_dir(),
                "build.tar",
                safe_id,
            ));
        }

        match ctx.artificer.collect_first(ctx.collector, &candidates).await? {
            Some(artifact) => {
                info!("Storing {} as {}", artifact.guest_path, artifact.file_name());
                ctx.artificer.upload(&artifact).await?;
            }
            None => info!("Pipeline produced no output to store"),
        }

        Ok(0)
    }
}
