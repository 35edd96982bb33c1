//! In-memory stand-ins for the container engine used by unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::container::platform::{ContainerPlatform, ContainerSpec, CopyStream, PlatformError};
use crate::session::transport::{ShellStreams, Transport};
use crate::session::SessionError;

#[derive(Clone)]
struct Rule {
    contains: String,
    exit_code: i32,
    output: Vec<String>,
}

/// Scripted shell
///
/// Answers `echo <sentinel> $?` with the exit code of the previous command.
/// Commands matching a rule (by substring) produce its output and exit code,
/// anything else succeeds silently. `exit` closes the output stream.
#[derive(Clone, Default)]
pub struct FakeShell {
    rules: Vec<Rule>,
    mute_sentinels: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, contains: &str, exit_code: i32, output: &[&str]) -> Self {
        self.rules.push(Rule {
            contains: contains.to_string(),
            exit_code,
            output: output.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Never answers sentinel checks, as a hung command would
    pub fn mute_sentinels(mut self) -> Self {
        self.mute_sentinels = true;
        self
    }

    /// Every line written to any shell spawned from this one
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn spawn(&self, cancel: CancellationToken) -> ShellStreams {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(1024);
        let rules = self.rules.clone();
        let mute = self.mute_sentinels;
        let log = Arc::clone(&self.log);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server).lines();
            let mut output = Some(tx);
            let mut last_exit = 0;

            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let Ok(Some(line)) = line else { break };
                log.lock().unwrap().push(line.clone());

                if line.trim() == "exit" {
                    output = None;
                    continue;
                }
                let Some(sender) = output.as_ref() else {
                    continue;
                };

                if let Some(sentinel) = line.strip_prefix("echo ").and_then(|r| r.strip_suffix(" $?")) {
                    if !mute {
                        let _ = sender.send(format!("{} {}\n", sentinel, last_exit)).await;
                    }
                    continue;
                }

                last_exit = 0;
                if let Some(rule) = rules.iter().find(|r| line.contains(&r.contains)) {
                    last_exit = rule.exit_code;
                    for out in &rule.output {
                        let _ = sender.send(out.clone()).await;
                    }
                }
            }
        });

        ShellStreams {
            stdin: Box::new(client),
            output: rx,
        }
    }
}

#[async_trait]
impl Transport for FakeShell {
    async fn attach(&self, cancel: CancellationToken) -> Result<ShellStreams, SessionError> {
        Ok(self.spawn(cancel))
    }
}

enum FakeEntry {
    Dir(Vec<(String, Vec<u8>)>),
    File(Vec<u8>),
}

/// Container platform keeping everything in memory
///
/// Records every call, serves `copy_from_container` from registered guest
/// paths and drives shells with a [`FakeShell`].
#[derive(Clone)]
pub struct FakePlatform {
    shell: FakeShell,
    calls: Arc<Mutex<Vec<String>>>,
    paths: Arc<Mutex<HashMap<String, FakeEntry>>>,
    next_id: Arc<AtomicUsize>,
    service_exit_code: i32,
    fail_start: bool,
}

impl FakePlatform {
    pub fn new(shell: FakeShell) -> Self {
        Self {
            shell,
            calls: Arc::new(Mutex::new(Vec::new())),
            paths: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicUsize::new(1)),
            service_exit_code: 0,
            fail_start: false,
        }
    }

    /// Makes every `start_container` fail after it is recorded
    pub fn with_failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Exit code reported when waiting on any container
    pub fn with_service_exit_code(mut self, code: i32) -> Self {
        self.service_exit_code = code;
        self
    }

    /// Registers a guest directory holding `files` (relative path, contents)
    pub fn add_dir(&self, path: &str, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(name, contents)| (name.to_string(), contents.as_bytes().to_vec()))
            .collect();
        self.paths
            .lock()
            .unwrap()
            .insert(path.to_string(), FakeEntry::Dir(files));
    }

    pub fn add_file(&self, path: &str, contents: &str) {
        self.paths
            .lock()
            .unwrap()
            .insert(path.to_string(), FakeEntry::File(contents.as_bytes().to_vec()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn shell(&self) -> &FakeShell {
        &self.shell
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn build_tar(path: &str, entry: &FakeEntry) -> Vec<u8> {
        let base = path.trim_end_matches('/').rsplit('/').next().unwrap_or("root");
        let mut builder = tar::Builder::new(Vec::new());

        let mut append = |name: String, data: &[u8], entry_type: tar::EntryType| {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_size(data.len() as u64);
            header.set_mode(if entry_type == tar::EntryType::Directory { 0o755 } else { 0o644 });
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        };

        match entry {
            FakeEntry::Dir(files) => {
                append(format!("{}/", base), &[], tar::EntryType::Directory);
                for (name, data) in files {
                    append(format!("{}/{}", base, name), data, tar::EntryType::Regular);
                }
            }
            FakeEntry::File(data) => append(base.to_string(), data, tar::EntryType::Regular),
        }

        builder.into_inner().unwrap()
    }
}

#[async_trait]
impl ContainerPlatform for FakePlatform {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, PlatformError> {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        self.record(format!("create {} {} {} [{}]", id, spec.name, spec.image, env.join(",")));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), PlatformError> {
        self.record(format!("start {}", id));
        if self.fail_start {
            return Err(PlatformError::CommandFailed {
                command: format!("start {}", id),
                exit_code: 125,
                stderr: "image entrypoint not found".to_string(),
            });
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), PlatformError> {
        self.record(format!("stop {}", id));
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), PlatformError> {
        self.record(format!("restart {}", id));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), PlatformError> {
        self.record(format!("remove {}", id));
        Ok(())
    }

    async fn commit_container(&self, id: &str, image: &str) -> Result<String, PlatformError> {
        self.record(format!("commit {} {}", id, image));
        Ok(format!("sha256:{}", image))
    }

    async fn export_image(&self, image: &str, dest: &Path) -> Result<(), PlatformError> {
        self.record(format!("export {}", image));
        std::fs::write(dest, image.as_bytes())?;
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<CopyStream, PlatformError> {
        self.record(format!("cp {}:{}", id, path));
        let (error_tx, error_rx) = oneshot::channel();

        let bytes = match self.paths.lock().unwrap().get(path) {
            Some(entry) => Self::build_tar(path, entry),
            None => {
                let _ = error_tx.send(PlatformError::NotFound(format!(
                    "{}: no such file or directory",
                    path
                )));
                Vec::new()
            }
        };

        Ok(CopyStream {
            reader: Box::new(std::io::Cursor::new(bytes)),
            errors: error_rx,
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i32, PlatformError> {
        self.record(format!("wait {}", id));
        Ok(self.service_exit_code)
    }

    async fn container_logs(&self, id: &str) -> Result<String, PlatformError> {
        Ok(format!("logs of {}\n", id))
    }

    async fn create_network(&self, name: &str) -> Result<(), PlatformError> {
        self.record(format!("network create {}", name));
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), PlatformError> {
        self.record(format!("network rm {}", name));
        Ok(())
    }

    async fn attach_shell(
        &self,
        id: &str,
        _shell: &str,
        cancel: CancellationToken,
    ) -> Result<ShellStreams, PlatformError> {
        self.record(format!("attach {}", id));
        Ok(self.shell.spawn(cancel))
    }
}
