//! Sluice Runner
//!
//! Runs a single CI pipeline inside a container on the local engine.
//!
//! Architecture:
//! - Configuration: flags and `SLUICE_*` environment variables
//! - Container: podman CLI client, pipeline box and service containers
//! - Session: sentinel-framed command channel into the box
//! - Artifacts: streaming tar collection and upload to the content store
//! - Steps: fetching, environment and execution of each step kind
//! - Pipeline: orchestration of the whole run
//!
//! Step output goes to the event bus and is rendered by a terminal printer;
//! runner diagnostics go through `tracing`.

mod artifact;
mod cleanup;
mod config;
mod container;
mod events;
mod layout;
mod pipeline;
mod session;
mod step;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use sluice_client::{ContentStore, HttpContentStore, RegistryClient};
use sluice_core::Environment;
use sluice_core::pipeline::PipelineDefinition;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::artifact::Artificer;
use crate::cleanup::{CleanupRegistry, install_signal_handler};
use crate::config::Config;
use crate::container::podman::{PodmanClient, check_engine_available};
use crate::events::{EventBus, spawn_printer};
use crate::layout::Layout;
use crate::pipeline::{Runner, RunnerOptions};

const PRINTER_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    config.validate()?;
    if config.debug {
        debug!("Options: {:#?}", config);
    }

    let definition = PipelineDefinition::load(&config.pipeline)
        .with_context(|| format!("Failed to load {}", config.pipeline.display()))?;
    info!(
        "Loaded pipeline: {} step(s), {} after-step(s), {} service(s)",
        definition.steps.len(),
        definition.after_steps.len(),
        definition.services.len()
    );

    check_engine_available(&config.engine)
        .await
        .with_context(|| format!("Container engine '{}' is not usable", config.engine))?;

    let bus = EventBus::new();
    let printer = spawn_printer(&bus, config.debug);

    let cleanup = Arc::new(CleanupRegistry::new());
    let cancel = CancellationToken::new();
    install_signal_handler(Arc::clone(&cleanup), cancel.clone());

    let store: Option<Arc<dyn ContentStore>> = config
        .store_url
        .as_ref()
        .map(|url| Arc::new(HttpContentStore::new(url.clone())) as Arc<dyn ContentStore>);
    let artificer = Artificer::new(store, config.artifact_max_bytes, config.store_max_tries);
    if !artificer.has_store() {
        info!("No content store configured, artifacts stay local");
    }

    let run_id = config
        .run_id()
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let layout = Layout::new(
        &config.working_dir,
        config.pipeline_kind(),
        run_id,
        config.application_id.clone(),
        config.guest_root.clone(),
        config.cache_dir.clone(),
    );

    let options = RunnerOptions {
        source_dir: config.source_dir.clone(),
        started_by: config.started_by.clone(),
        should_commit: config.should_commit,
        keep_container: config.keep_container,
        timeouts: config.session_timeouts(),
    };

    let runner = Runner::new(
        Arc::new(PodmanClient::new(config.engine.clone())),
        bus.clone(),
        cleanup,
        artificer,
        layout,
        options,
    )
    .with_registry(RegistryClient::new(config.registry_url.clone()))
    .with_operator_env(Environment::from_process())
    .with_cancel(cancel);

    let outcome = runner.run(&definition).await;
    info!("Run directory: {}", runner.layout().host_root().display());

    // Let the printer drain; service watchers may still hold the bus
    drop(runner);
    drop(bus);
    match tokio::time::timeout(PRINTER_DRAIN, printer).await {
        Ok(Err(e)) => error!("Printer task failed: {}", e),
        Ok(Ok(())) => {}
        Err(_) => debug!("Printer still running, exiting anyway"),
    }

    match outcome {
        Ok(result) if result.success => Ok(()),
        Ok(_) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
