//! Pipeline orchestration
//!
//! The runner drives a single pipeline from start to finish:
//! 1. Stage the source and cache into the host run directory
//! 2. Start services on a private network, then the box linked to them
//! 3. Attach a session and export the pipeline environment
//! 4. Run the main steps until the first failure
//! 5. Optionally commit the box, then run the store step
//! 6. Restart the box and run the after-steps with the result exported
//! 7. Collect the guest cache
//!
//! Every container and network is released through the cleanup registry,
//! whatever path the run took.

mod environment;

pub use environment::{base_environment, pipeline_environment};

use anyhow::{Context, Result};
use chrono::Utc;
use sluice_client::RegistryClient;
use sluice_core::Environment;
use sluice_core::environment::shell_quote;
use sluice_core::event::{Event, StepRef};
use sluice_core::pipeline::{FailedStep, PipelineDefinition, PipelineResult, ServiceConfig, StepResult};
use sluice_core::step::StepConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{Artificer, ContainerCollector, FileCollector};
use crate::cleanup::CleanupRegistry;
use crate::container::platform::ContainerPlatform;
use crate::container::{PipelineBox, ServiceBox, release};
use crate::events::EventBus;
use crate::layout::{GUEST_CACHE_DIR, Layout};
use crate::session::{CommandFailure, CommandOutput, ContainerTransport, Session, SessionTimeouts};
use crate::step::{FetchContext, STORE_STEP_ID, Step, StepContext, StepRegistry, copy_dir};

/// Knobs that do not come from the pipeline definition
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Project directory staged into the box; relative local steps resolve against it
    pub source_dir: PathBuf,
    pub started_by: String,
    /// Commit the box after the main steps and store the image
    pub should_commit: bool,
    /// Stop containers at the end of the run but do not remove them
    pub keep_container: bool,
    pub timeouts: SessionTimeouts,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            started_by: "sluice".to_string(),
            should_commit: false,
            keep_container: false,
            timeouts: SessionTimeouts::default(),
        }
    }
}

pub struct Runner {
    platform: Arc<dyn ContainerPlatform>,
    events: EventBus,
    cleanup: Arc<CleanupRegistry>,
    artificer: Artificer,
    steps: StepRegistry,
    registry: Option<RegistryClient>,
    layout: Layout,
    options: RunnerOptions,
    operator_env: Environment,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(
        platform: Arc<dyn ContainerPlatform>,
        events: EventBus,
        cleanup: Arc<CleanupRegistry>,
        artificer: Artificer,
        layout: Layout,
        options: RunnerOptions,
    ) -> Self {
        Self {
            platform,
            events,
            cleanup,
            artificer,
            steps: StepRegistry::new(options.source_dir.clone()),
            registry: None,
            layout,
            options,
            operator_env: Environment::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Registry client used to fetch `owner/name` steps
    pub fn with_registry(mut self, registry: RegistryClient) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Environment pass-through variables are taken from
    pub fn with_operator_env(mut self, env: Environment) -> Self {
        self.operator_env = env;
        self
    }

    /// Token cancelling the run, usually tripped by the interrupt handler
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Runs the pipeline and releases everything it acquired
    ///
    /// An error means the pipeline could not be set up; step failures are
    /// reported in the returned result.
    pub async fn run(&self, definition: &PipelineDefinition) -> Result<PipelineResult> {
        let started = Instant::now();
        info!(
            "Running {} {} in {}",
            self.layout.kind(),
            self.layout.run_id(),
            self.layout.host_root().display()
        );

        let outcome = self.execute(definition).await;
        if !self.cleanup.is_empty() {
            debug!("Releasing {} resource(s)", self.cleanup.len());
        }
        self.cleanup.run_all().await;

        let success = matches!(&outcome, Ok(result) if result.success);
        match &outcome {
            Ok(result) if result.success => info!("Pipeline passed"),
            Ok(result) => match &result.failed_step {
                Some(failed) => warn!("Pipeline failed at {}: {}", failed.display_name, failed.message),
                None => warn!("Pipeline failed"),
            },
            Err(e) => warn!("Pipeline could not run: {:#}", e),
        }

        self.events.emit(Event::FullPipelineFinished {
            success,
            duration: started.elapsed(),
        });
        outcome
    }

    async fn execute(&self, definition: &PipelineDefinition) -> Result<PipelineResult> {
        self.prepare_workspace().await?;

        let mut steps = self
            .steps
            .build_all(&definition.steps, 0)
            .context("Invalid pipeline steps")?;
        let store_config = StepConfig {
            id: STORE_STEP_ID.to_string(),
            ..Default::default()
        };
        let mut store = self.steps.build(&store_config, steps.len())?;
        let mut after_steps = self
            .steps
            .build_all(&definition.after_steps, steps.len() + 1)
            .context("Invalid after-steps")?;

        let fetch = FetchContext {
            layout: &self.layout,
            registry: self.registry.as_ref(),
        };
        for step in steps.iter_mut().chain(after_steps.iter_mut()) {
            let name = step.metadata().display_name.clone();
            step.fetch(&fetch)
                .await
                .with_context(|| format!("Failed to fetch step {}", name))?;
        }

        let mut main_refs: Vec<StepRef> = steps.iter().map(|step| step.metadata().step_ref()).collect();
        main_refs.push(store.metadata().step_ref());
        self.events.emit(Event::BuildStepsAdded {
            steps: main_refs,
            after_steps: after_steps.iter().map(|step| step.metadata().step_ref()).collect(),
        });

        let base = base_environment(&self.layout, &self.options.started_by, Utc::now());
        let env = pipeline_environment(base, &definition.env, &self.operator_env);

        let name = format!("sluice-{}-{}", self.layout.kind(), self.layout.run_id());
        let (network, links) = self.start_services(&definition.services, &name).await?;

        let mut pipeline_box = PipelineBox::new(Arc::clone(&self.platform), definition.box_config.clone(), &name);
        let box_id = pipeline_box
            .create(links, self.layout.host_root(), network.as_deref())
            .await
            .context("Failed to create the box")?;
        self.register_release("box", &box_id, None);
        pipeline_box.start().await.context("Failed to start the box")?;

        let transport = ContainerTransport::new(Arc::clone(&self.platform), box_id.clone(), pipeline_box.shell());
        let session = Session::new(Arc::new(transport), self.events.clone(), self.options.timeouts);
        let mut attachment = session
            .attach(&self.cancel)
            .await
            .context("Failed to attach to the box")?;

        self.export_environment(&session, &env).await?;
        self.copy_workspace(&session).await?;

        let collector = ContainerCollector::new(Arc::clone(&self.platform), box_id.clone());
        let ctx = StepContext {
            session: &session,
            layout: &self.layout,
            artificer: &self.artificer,
            collector: &collector,
            platform: self.platform.as_ref(),
        };

        let mut result = PipelineResult {
            success: true,
            ..Default::default()
        };

        for step in steps.iter_mut() {
            if self.cancel.is_cancelled() {
                fail(&mut result, step.metadata().name.clone(), step.metadata().display_name.clone(), "Pipeline was cancelled");
                break;
            }
            let outcome = self.run_step(step, &env, &ctx).await;
            let passed = outcome.success;
            if !passed {
                let message = outcome.message.clone().unwrap_or_default();
                fail(&mut result, step.metadata().name.clone(), outcome.display_name.clone(), message);
            }
            result.steps.push(outcome);
            if !passed {
                break;
            }
        }

        if self.options.should_commit {
            match pipeline_box.commit(&name).await {
                Ok(_) => {
                    if let Step::Store(store_step) = &mut store {
                        store_step.set_image(Some(name.clone()));
                    }
                }
                Err(e) => fail(&mut result, "commit", "commit", e.to_string()),
            }
        }

        let outcome = self.run_step(&mut store, &env, &ctx).await;
        if !outcome.success {
            let message = outcome.message.clone().unwrap_or_default();
            fail(&mut result, store.metadata().name.clone(), outcome.display_name.clone(), message);
        }
        result.steps.push(outcome);

        self.events.emit(Event::BuildFinished {
            success: result.success,
            message: result
                .failed_step
                .as_ref()
                .map(|failed| format!("{}: {}", failed.display_name, failed.message)),
        });

        if !after_steps.is_empty() && !self.cancel.is_cancelled() {
            let mut after_env = env.clone();
            after_env.update(result.env_pairs());

            match self.reopen(&pipeline_box, &session, &after_env).await {
                Ok(token) => {
                    attachment = token;
                    for step in after_steps.iter_mut() {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let outcome = self.run_step(step, &after_env, &ctx).await;
                        let passed = outcome.success;
                        if !passed {
                            warn!(
                                "After-step {} failed: {}",
                                outcome.display_name,
                                outcome.message.as_deref().unwrap_or("unknown error")
                            );
                        }
                        result.after_steps.push(outcome);
                        if !passed {
                            break;
                        }
                    }
                }
                Err(e) => warn!("Skipping after-steps: {:#}", e),
            }
        }

        self.collect_cache(&collector).await;

        attachment.cancel();
        Ok(result)
    }

    /// Creates the host run directory and stages the source and cache in it
    async fn prepare_workspace(&self) -> Result<()> {
        let source = &self.options.source_dir;
        if !source.is_dir() {
            anyhow::bail!("Source directory {} does not exist", source.display());
        }

        let host_root = self.layout.host_root();
        tokio::fs::create_dir_all(host_root)
            .await
            .with_context(|| format!("Failed to create {}", host_root.display()))?;

        copy_dir(source, &self.layout.host_source_dir())
            .await
            .context("Failed to stage the source directory")?;

        let cache = self.layout.guest_cache_store();
        if cache.is_dir() {
            copy_dir(&cache, &self.layout.host_cache_stage())
                .await
                .context("Failed to stage the cache")?;
        }

        debug!("Workspace ready in {}", host_root.display());
        Ok(())
    }

    /// Starts services in order, each linked to the ones before it
    ///
    /// Returns the network they share and the link variables for the box.
    async fn start_services(
        &self,
        services: &[ServiceConfig],
        prefix: &str,
    ) -> Result<(Option<String>, Vec<(String, String)>)> {
        if services.is_empty() {
            return Ok((None, Vec::new()));
        }

        let network = prefix.to_string();
        self.platform
            .create_network(&network)
            .await
            .with_context(|| format!("Failed to create network {}", network))?;
        {
            let platform = Arc::clone(&self.platform);
            let network = network.clone();
            self.cleanup.register(format!("network {}", network), move || async move {
                if let Err(e) = platform.remove_network(&network).await {
                    warn!("Failed to remove network {}: {}", network, e);
                }
                true
            });
        }

        let mut links = Vec::new();
        for config in services {
            let service = ServiceBox::new(config.clone());
            let alias = service.alias();
            let id = service
                .create(self.platform.as_ref(), format!("{}-{}", prefix, alias), &network, &links)
                .await
                .with_context(|| format!("Failed to create service {}", alias))?;
            let watch = self.cancel.child_token();
            self.register_release("service", &id, Some(watch.clone()));
            service
                .start(&self.platform, &id, &self.events, watch)
                .await
                .with_context(|| format!("Failed to start service {}", alias))?;
            links.extend(service.link_env());
        }

        Ok((Some(network), links))
    }

    /// Releases the container at cleanup, after cancelling its exit watcher
    fn register_release(&self, what: &str, id: &str, watch: Option<CancellationToken>) {
        let platform = Arc::clone(&self.platform);
        let keep = self.options.keep_container;
        let id = id.to_string();
        self.cleanup.register(format!("{} {}", what, id), move || async move {
            if let Some(watch) = watch {
                watch.cancel();
            }
            if !release(platform.as_ref(), &id, keep).await {
                warn!("Container {} was not fully released", id);
            }
            true
        });
    }

    /// Exports the environment, hidden variables with logs hidden
    async fn export_environment(&self, session: &Session, env: &Environment) -> Result<()> {
        let exported = session.send_checked(&env.export()).await;
        check(exported, "export the environment")?;

        let hidden = env.get_hidden_passthru().export();
        if !hidden.is_empty() {
            session.hide_logs();
            let exported = session.send_checked(&hidden).await;
            session.show_logs();
            check(exported, "export hidden variables")?;
        }
        Ok(())
    }

    /// Copies the staged source and cache from the mount into the guest root
    async fn copy_workspace(&self, session: &Session) -> Result<()> {
        let layout = &self.layout;
        let source = shell_quote(&layout.guest_source_dir());
        let mnt_cache = shell_quote(&layout.mnt_cache_dir());
        let commands = [
            format!(
                "mkdir -p {} {} {}",
                shell_quote(layout.guest_root()),
                shell_quote(&layout.guest_output_dir()),
                shell_quote(&layout.guest_report_dir())
            ),
            format!(
                "rm -rf {source} && cp -r {} {source}",
                shell_quote(&layout.mnt_source_dir())
            ),
            format!(
                "mkdir -p {cache} && if [ -d {mnt} ]; then cp -r {mnt}/. {cache}; fi",
                cache = GUEST_CACHE_DIR,
                mnt = mnt_cache
            ),
            format!("cd {}", source),
        ];

        session.hide_logs();
        let copied = session.send_checked(&commands).await;
        session.show_logs();
        check(copied, "copy the workspace into the box")
    }

    /// Restarts the box and prepares a fresh shell for the after-steps
    async fn reopen(&self, pipeline_box: &PipelineBox, session: &Session, env: &Environment) -> Result<CancellationToken> {
        pipeline_box.restart().await.context("Failed to restart the box")?;
        let token = session
            .attach(&self.cancel)
            .await
            .context("Failed to reattach to the box")?;
        self.export_environment(session, env).await?;
        let entered = session
            .send_checked(&[format!("cd {}", shell_quote(&self.layout.guest_source_dir()))])
            .await;
        check(entered, "enter the source directory")?;
        Ok(token)
    }

    /// Runs one step and reports it
    ///
    /// A step whose environment cannot be initialized fails without running.
    /// Artifacts are collected whenever the step ran, failed or not.
    async fn run_step(&self, step: &mut Step, env: &Environment, ctx: &StepContext<'_>) -> StepResult {
        let step_ref = step.metadata().step_ref();
        let started = Instant::now();
        self.events.emit(Event::BuildStepStarted { step: step_ref.clone() });
        ctx.session.set_step(Some(step_ref.clone()));
        info!("Running step {}", step_ref.display_name);

        let (exit_code, mut message, executed) = match step.init_env(env, &self.layout) {
            Err(e) => (e.exit_code(), Some(e.to_string()), false),
            Ok(()) => match step.execute(ctx).await {
                Ok(0) => (0, None, true),
                Ok(code) => (code, Some(format!("Step failed with exit code {}", code)), true),
                Err(e) => (e.exit_code(), Some(e.to_string()), true),
            },
        };
        let success = exit_code == 0 && message.is_none();

        if executed {
            match step.collect_artifacts(ctx).await {
                Ok(Some(artifact)) => debug!("Stored artifacts of {} as {}", step_ref.display_name, artifact.file_name()),
                Ok(None) => {}
                Err(e) => warn!("Failed to collect artifacts of {}: {}", step_ref.display_name, e),
            }
            if !success {
                if let Some(reported) = step.report_message(ctx).await {
                    message = Some(reported);
                }
            }
        }

        ctx.session.set_step(None);
        let duration = started.elapsed();
        self.events.emit(Event::BuildStepFinished {
            step: step_ref.clone(),
            success,
            message: message.clone(),
            duration,
        });

        StepResult {
            safe_id: step_ref.safe_id,
            display_name: step_ref.display_name,
            success,
            exit_code,
            message,
            duration,
        }
    }

    /// Moves the guest cache into the host cache directory
    ///
    /// Failures are only logged; they never change the result.
    async fn collect_cache(&self, collector: &ContainerCollector) {
        let collected = self.layout.host_root().join("cache-collected");
        let artifact = self.layout.artifact(
            collector.container_id(),
            GUEST_CACHE_DIR,
            collected.clone(),
            "cache.tar",
            "cache",
        );

        match self.artificer.collect(collector, &artifact).await {
            Ok(extracted) => match replace_dir(&collected, &self.layout.guest_cache_store()).await {
                Ok(()) => info!("Cached {} file(s)", extracted.files),
                Err(e) => warn!("Failed to store the cache: {:#}", e),
            },
            Err(e) if e.is_empty() => debug!("Guest cache is empty"),
            Err(e) => warn!("Failed to collect the cache: {}", e),
        }
    }
}

fn fail(result: &mut PipelineResult, name: impl Into<String>, display_name: impl Into<String>, message: impl Into<String>) {
    result.success = false;
    result.failed_step.get_or_insert_with(|| FailedStep {
        name: name.into(),
        display_name: display_name.into(),
        message: message.into(),
    });
}

/// Maps a checked send to an error unless the commands succeeded
fn check(outcome: Result<CommandOutput, CommandFailure>, what: &str) -> Result<()> {
    let output = outcome.with_context(|| format!("Failed to {}", what))?;
    if !output.success() {
        anyhow::bail!("Failed to {} (exit code {})", what, output.exit_code);
    }
    Ok(())
}

async fn replace_dir(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(to).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to clear {}", to.display())),
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        copy_dir(from, to).await?;
        tokio::fs::remove_dir_all(from).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlatform, FakeShell};
    use sluice_core::pipeline::{BoxConfig, PipelineKind};
    use std::fs;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        _dir: tempfile::TempDir,
        source: PathBuf,
        platform: FakePlatform,
        runner: Runner,
        events: broadcast::Receiver<Event>,
    }

    fn harness(shell: FakeShell, should_commit: bool) -> Harness {
        harness_on(FakePlatform::new(shell), should_commit)
    }

    fn harness_on(platform: FakePlatform, should_commit: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("project");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("main.go"), "package main").unwrap();

        let layout = Layout::new(
            &dir.path().join("work"),
            PipelineKind::Build,
            "7",
            "app",
            "/pipeline",
            dir.path().join("cache"),
        );
        let bus = EventBus::new();
        let events = bus.subscribe();
        let options = RunnerOptions {
            source_dir: source.clone(),
            should_commit,
            ..Default::default()
        };
        let runner = Runner::new(
            Arc::new(platform.clone()),
            bus,
            Arc::new(CleanupRegistry::new()),
            Artificer::new(None, 1024 * 1024, 1).with_grace(Duration::from_millis(10)),
            layout,
            options,
        );

        Harness {
            _dir: dir,
            source,
            platform,
            runner,
            events,
        }
    }

    fn local_step(source: &Path, name: &str, descriptor: Option<&str>) -> StepConfig {
        let dir = source.join("steps").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("run.sh"), format!("echo {}", name)).unwrap();
        if let Some(descriptor) = descriptor {
            fs::write(dir.join("step.json"), descriptor).unwrap();
        }
        StepConfig {
            id: format!("path:steps/{}", name),
            ..Default::default()
        }
    }

    fn definition(steps: Vec<StepConfig>, after_steps: Vec<StepConfig>) -> PipelineDefinition {
        PipelineDefinition {
            box_config: BoxConfig {
                image: "alpine".to_string(),
                shell: "/bin/sh".to_string(),
                ..Default::default()
            },
            steps,
            after_steps,
            ..Default::default()
        }
    }

    fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn started(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::BuildStepStarted { step } => Some(step.display_name.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_failure_skips_remaining_steps() {
        let mut h = harness(FakeShell::new().rule("fail-step-", 1, &["boom\n"]), false);
        h.platform.add_dir("/pipeline/output", &[]);
        h.platform.add_dir("/pipeline/source", &[("main.go", "package main")]);
        let steps = vec![
            local_step(&h.source, "fail-step", None),
            local_step(&h.source, "ok-step", None),
        ];
        let after = vec![StepConfig::script("notify", "echo $WERCKER_RESULT")];

        let result = h.runner.run(&definition(steps, after)).await.unwrap();

        assert!(!result.success);
        let failed = result.failed_step.unwrap();
        assert_eq!(failed.display_name, "fail-step");
        assert_eq!(failed.message, "Step failed with exit code 1");
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].exit_code, 1);
        assert!(result.steps[1].success);
        assert_eq!(result.after_steps.len(), 1);

        let events = drain(&mut h.events);
        assert_eq!(started(&events), vec!["fail-step", "store", "notify"]);
        assert!(matches!(
            events.last(),
            Some(Event::FullPipelineFinished { success: false, .. })
        ));

        let commands = h.platform.shell().commands();
        assert!(commands.contains(&"export WERCKER_RESULT=\"failed\"".to_string()));
        assert!(commands.contains(&"export WERCKER_FAILED_STEP_DISPLAY_NAME=\"fail-step\"".to_string()));
        assert!(!commands.iter().any(|c| c.contains("ok-step-")));

        let calls = h.platform.calls();
        assert!(calls.contains(&"restart ctr-1".to_string()));
        assert_eq!(calls[calls.len() - 2..], ["stop ctr-1".to_string(), "remove ctr-1".to_string()]);
        assert!(h.runner.layout().host_root().join("build.tar").exists());
        assert!(h.runner.layout().host_source_dir().join("steps/ok-step/run.sh").exists());
    }

    #[tokio::test]
    async fn test_services_commit_and_cleanup_order() {
        let h = harness(FakeShell::new(), true);
        h.platform.add_dir("/pipeline/output", &[("app", "binary")]);
        h.platform.add_dir("/cache", &[("deps.lock", "v1")]);
        let mut definition = definition(vec![StepConfig::script("build", "make")], Vec::new());
        definition.services = vec![ServiceConfig {
            image: "postgres:16".to_string(),
            ..Default::default()
        }];

        let result = h.runner.run(&definition).await.unwrap();
        assert!(result.success);

        let calls = h.platform.calls();
        assert!(calls.contains(&"network create sluice-build-7".to_string()));
        assert!(calls.contains(&"create ctr-2 sluice-build-7 alpine [POSTGRES_HOST=postgres]".to_string()));
        assert!(calls.contains(&"commit ctr-2 sluice-build-7".to_string()));
        assert!(calls.contains(&"export sluice-build-7".to_string()));

        let teardown: Vec<&String> = calls
            .iter()
            .filter(|c| c.starts_with("stop") || c.starts_with("remove") || c.starts_with("network rm"))
            .collect();
        assert_eq!(
            teardown,
            vec!["stop ctr-2", "remove ctr-2", "stop ctr-1", "remove ctr-1", "network rm sluice-build-7"]
        );

        let cache = h.runner.layout().guest_cache_store();
        assert_eq!(fs::read_to_string(cache.join("deps.lock")).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_env_failure_prevents_execution() {
        let mut h = harness(FakeShell::new(), false);
        let steps = vec![local_step(
            &h.source,
            "deploy",
            Some(r#"{"name": "deploy", "properties": {"token": {"required": true}}}"#),
        )];

        let result = h.runner.run(&definition(steps, Vec::new())).await.unwrap();

        assert!(!result.success);
        let failed = result.failed_step.unwrap();
        assert_eq!(failed.display_name, "deploy");
        assert!(failed.message.contains("token"));
        assert!(!h.platform.shell().commands().iter().any(|c| c.contains("run.sh")));

        let events = drain(&mut h.events);
        assert!(events.iter().any(|event| matches!(
            event,
            Event::BuildStepFinished { step, success: false, .. } if step.display_name == "deploy"
        )));
    }

    #[tokio::test]
    async fn test_missing_source_fails_setup() {
        let mut h = harness(FakeShell::new(), false);
        fs::remove_dir_all(&h.source).unwrap();

        let err = h.runner.run(&definition(Vec::new(), Vec::new())).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(h.platform.calls().is_empty());

        let events = drain(&mut h.events);
        assert!(matches!(
            events.as_slice(),
            [Event::FullPipelineFinished { success: false, .. }]
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_steps() {
        let h = harness(FakeShell::new(), false);
        let cancel = CancellationToken::new();
        let runner = h.runner.with_cancel(cancel.clone());
        cancel.cancel();

        let err = runner
            .run(&definition(vec![StepConfig::script("build", "make")], Vec::new()))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("export the environment"));
        assert!(h.platform.calls().ends_with(&["stop ctr-1".to_string(), "remove ctr-1".to_string()]));
    }

    #[tokio::test]
    async fn test_box_that_fails_to_start_is_released() {
        let h = harness_on(FakePlatform::new(FakeShell::new()).with_failing_start(), false);

        let err = h
            .runner
            .run(&definition(vec![StepConfig::script("build", "make")], Vec::new()))
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to start the box"));
        assert_eq!(
            h.platform.calls()[1..],
            ["start ctr-1".to_string(), "stop ctr-1".to_string(), "remove ctr-1".to_string()]
        );
    }
}
