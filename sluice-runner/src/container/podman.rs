//! Podman container management
//!
//! Drives the container engine through its CLI:
//! - Checking the engine is available
//! - Container lifecycle (create, start, stop, restart, commit, remove)
//! - Streaming files out of a container as tar
//! - Attaching an interactive shell for the session

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::platform::{ContainerPlatform, ContainerSpec, CopyStream, PlatformError};
use crate::session::transport::ShellStreams;

/// Buffered lines between the shell readers and the session
const OUTPUT_CHANNEL_SIZE: usize = 1024;

/// Checks that the engine binary is installed and working
pub async fn check_engine_available(engine: &str) -> Result<(), PlatformError> {
    let output = Command::new(engine).arg("--version").output().await?;

    if !output.status.success() {
        return Err(classify_failure(
            format!("{} --version", engine),
            output.status.code().unwrap_or(-1),
            &String::from_utf8_lossy(&output.stderr),
        ));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Container engine is available: {}", version.trim());

    Ok(())
}

/// Maps a failed engine invocation to a platform error
fn classify_failure(command: String, exit_code: i32, stderr: &str) -> PlatformError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("no such") || lowered.contains("not found") || lowered.contains("does not exist") {
        return PlatformError::NotFound(stderr.trim().to_string());
    }

    PlatformError::CommandFailed {
        command,
        exit_code,
        stderr: stderr.trim().to_string(),
    }
}

/// ContainerPlatform implemented on top of the podman CLI
///
/// Any docker-compatible CLI works as long as it accepts the same flags.
#[derive(Debug, Clone)]
pub struct PodmanClient {
    engine: String,
}

impl PodmanClient {
    /// Creates a client invoking `engine` (e.g. "podman")
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    /// Runs the engine with `args` and returns its trimmed stdout
    async fn run(&self, args: &[String]) -> Result<String, PlatformError> {
        debug!("Running {} {}", self.engine, args.join(" "));

        let output = Command::new(&self.engine).args(args).output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("{} {} stderr: {}", self.engine, args[0], stderr.trim());
        }

        if !output.status.success() {
            return Err(classify_failure(
                format!("{} {}", self.engine, args[0]),
                output.status.code().unwrap_or(-1),
                &stderr,
            ));
        }

        Ok(stdout)
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (host, guest) in &spec.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host.display(), guest));
        }
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(alias) = &spec.network_alias {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());
        args
    }
}

/// Forwards every line read from `reader` (newline included) to `sender`
async fn forward_lines<R>(reader: R, sender: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if sender.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read shell output: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl ContainerPlatform for PodmanClient {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, PlatformError> {
        info!("Creating container {} for image {}", spec.name, spec.image);
        let id = self.run(&Self::create_args(spec)).await?;
        info!("Container {} created with ID: {}", spec.name, id);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), PlatformError> {
        self.run(&["start".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), PlatformError> {
        self.run(&["stop".to_string(), "-t".to_string(), "5".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), PlatformError> {
        self.run(&["restart".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), PlatformError> {
        self.run(&["rm".to_string(), "-f".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn commit_container(&self, id: &str, image: &str) -> Result<String, PlatformError> {
        self.run(&["commit".to_string(), id.to_string(), image.to_string()])
            .await
    }

    async fn export_image(&self, image: &str, dest: &Path) -> Result<(), PlatformError> {
        self.run(&[
            "save".to_string(),
            "-o".to_string(),
            dest.display().to_string(),
            image.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<CopyStream, PlatformError> {
        debug!("Copying {}:{} out of container", id, path);

        let mut child = Command::new(&self.engine)
            .arg("cp")
            .arg(format!("{}:{}", id, path))
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("cp stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("cp stderr was not captured"))?;

        let (error_tx, error_rx) = oneshot::channel();
        let command = format!("{} cp", self.engine);

        tokio::spawn(async move {
            let mut message = String::new();
            let _ = stderr.read_to_string(&mut message).await;

            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let _ = error_tx.send(classify_failure(
                        command,
                        status.code().unwrap_or(-1),
                        &message,
                    ));
                }
                Err(e) => {
                    let _ = error_tx.send(PlatformError::Io(e));
                }
            }
        });

        Ok(CopyStream {
            reader: Box::new(stdout),
            errors: error_rx,
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i32, PlatformError> {
        let output = self.run(&["wait".to_string(), id.to_string()]).await?;
        output.lines().last().unwrap_or("").trim().parse().map_err(|_| {
            PlatformError::CommandFailed {
                command: format!("{} wait", self.engine),
                exit_code: -1,
                stderr: format!("unexpected output '{}'", output),
            }
        })
    }

    async fn container_logs(&self, id: &str) -> Result<String, PlatformError> {
        let output = Command::new(&self.engine).arg("logs").arg(id).output().await?;
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn create_network(&self, name: &str) -> Result<(), PlatformError> {
        self.run(&["network".to_string(), "create".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), PlatformError> {
        self.run(&[
            "network".to_string(),
            "rm".to_string(),
            "-f".to_string(),
            name.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn attach_shell(
        &self,
        id: &str,
        shell: &str,
        cancel: CancellationToken,
    ) -> Result<ShellStreams, PlatformError> {
        debug!("Attaching {} in container {}", shell, id);

        let mut child = Command::new(&self.engine)
            .arg("exec")
            .arg("-i")
            .arg(id)
            .arg(shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("exec stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("exec stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("exec stderr was not captured"))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        tokio::spawn(forward_lines(stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, tx));

        let container = id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!("Shell in container {} exited: {:?}", container, status);
                }
                _ = cancel.cancelled() => {
                    debug!("Killing shell in container {}", container);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill shell in container {}: {}", container, e);
                    }
                }
            }
        });

        Ok(ShellStreams {
            stdin: Box::new(stdin),
            output: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_create_args() {
        let spec = ContainerSpec {
            name: "sluice-build-1".to_string(),
            image: "docker.io/library/alpine:3.20".to_string(),
            env: vec![("CI".to_string(), "true".to_string())],
            mounts: vec![(PathBuf::from("/tmp/run"), "/mnt".to_string())],
            network: Some("sluice-net".to_string()),
            network_alias: None,
            workdir: Some("/pipeline".to_string()),
            entrypoint: Some("/bin/sh".to_string()),
            cmd: vec!["-c".to_string(), "sleep infinity".to_string()],
        };

        let args = PodmanClient::create_args(&spec);
        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "sluice-build-1",
                "-e",
                "CI=true",
                "-v",
                "/tmp/run:/mnt",
                "--network",
                "sluice-net",
                "-w",
                "/pipeline",
                "--entrypoint",
                "/bin/sh",
                "docker.io/library/alpine:3.20",
                "-c",
                "sleep infinity",
            ]
        );
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "podman cp".to_string(),
            125,
            "Error: \"/pipeline/output\" could not be found on container abc: no such file or directory",
        );
        assert!(err.is_not_found());

        let err = classify_failure("podman start".to_string(), 125, "permission denied");
        assert!(matches!(err, PlatformError::CommandFailed { exit_code: 125, .. }));
    }
}
