//! Session layer
//!
//! A session turns a shell running inside a container into a remotely
//! drivable command channel:
//! - `send` writes commands without waiting for them
//! - `send_checked` waits for completion and returns the exit code and output
//!
//! Checked sends are serialized; output lines are forwarded to the event bus
//! as they arrive.

pub mod protocol;
pub mod transport;

use sluice_core::event::{Event, LogStream, StepRef};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::container::platform::PlatformError;
use crate::events::EventBus;

pub use protocol::{CommandFailure, CommandOutput, INCOMPLETE_EXIT_CODE};
use protocol::{LineKind, SentinelMatcher, TimeoutKind};
pub use transport::{ContainerTransport, ShellStreams, Transport};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is not attached")]
    NotAttached,

    #[error("Failed to attach session: {0}")]
    Attach(#[source] PlatformError),

    #[error("Command was cancelled")]
    Cancelled,

    #[error("Command timed out after no output for {} seconds", .0.as_secs())]
    NoOutputTimeout(Duration),

    #[error("Command timed out after {} seconds", .0.as_secs())]
    CommandTimeout(Duration),

    #[error("Shell closed before the command completed")]
    TransportClosed,

    #[error("Could not read exit code from '{0}'")]
    MalformedSentinel(String),

    #[error("Failed to write to shell: {0}")]
    Io(#[from] std::io::Error),
}

/// Limits applied to every checked send
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Maximum time without receiving a line
    pub no_output: Duration,
    /// Maximum time for the whole command
    pub command: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            no_output: Duration::from_secs(5 * 60),
            command: Duration::from_secs(25 * 60),
        }
    }
}

struct Attachment {
    stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    output: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

/// Command channel into a running container
pub struct Session {
    transport: Arc<dyn Transport>,
    events: EventBus,
    timeouts: SessionTimeouts,
    attachment: Mutex<Option<Attachment>>,
    hidden: AtomicBool,
    step: StdMutex<Option<StepRef>>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, events: EventBus, timeouts: SessionTimeouts) -> Self {
        Self {
            transport,
            events,
            timeouts,
            attachment: Mutex::new(None),
            hidden: AtomicBool::new(false),
            step: StdMutex::new(None),
        }
    }

    /// Opens the transport
    ///
    /// Returns a token scoped to the attachment: it is cancelled when
    /// `parent` is, and cancelling it tears the shell down.
    pub async fn attach(&self, parent: &CancellationToken) -> Result<CancellationToken, SessionError> {
        let cancel = parent.child_token();
        let streams = self.transport.attach(cancel.clone()).await?;

        let mut attachment = self.attachment.lock().await;
        if let Some(previous) = attachment.take() {
            previous.cancel.cancel();
        }
        *attachment = Some(Attachment {
            stdin: streams.stdin,
            output: streams.output,
            cancel: cancel.clone(),
        });

        debug!("Session attached");
        Ok(cancel)
    }

    /// Tags subsequent log events as hidden
    pub fn hide_logs(&self) {
        self.hidden.store(true, Ordering::SeqCst);
    }

    pub fn show_logs(&self) {
        self.hidden.store(false, Ordering::SeqCst);
    }

    fn logs_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    /// Sets the step subsequent log events are attributed to
    pub fn set_step(&self, step: Option<StepRef>) {
        *self.step.lock().unwrap() = step;
    }

    fn emit(&self, stream: LogStream, hidden: bool, line: &str) {
        let step = self.step.lock().unwrap().clone();
        self.events.emit(Event::logs(step, stream, hidden, line));
    }

    /// Writes commands to the shell without waiting for them
    pub async fn send<S: AsRef<str>>(&self, hidden: bool, commands: &[S]) -> Result<(), SessionError> {
        let mut guard = self.attachment.lock().await;
        let attachment = guard.as_mut().ok_or(SessionError::NotAttached)?;
        self.write_commands(attachment, hidden, commands).await
    }

    async fn write_commands<S: AsRef<str>>(
        &self,
        attachment: &mut Attachment,
        hidden: bool,
        commands: &[S],
    ) -> Result<(), SessionError> {
        for command in commands {
            let command = command.as_ref();
            self.emit(LogStream::Stdin, hidden || self.logs_hidden(), command);
            attachment.stdin.write_all(command.as_bytes()).await?;
            attachment.stdin.write_all(b"\n").await?;
        }
        attachment.stdin.flush().await?;
        Ok(())
    }

    /// Sends commands and waits for them to complete
    ///
    /// Completes when the sentinel is seen, the session is cancelled, the
    /// shell closes, or either timeout elapses. In every case other than the
    /// sentinel the exit code is [`INCOMPLETE_EXIT_CODE`] and the output
    /// collected so far is returned in the error.
    pub async fn send_checked<S: AsRef<str>>(&self, commands: &[S]) -> Result<CommandOutput, CommandFailure> {
        let mut guard = self.attachment.lock().await;
        let Some(attachment) = guard.as_mut() else {
            return Err(CommandFailure::new(SessionError::NotAttached, Vec::new()));
        };

        let mut matcher = SentinelMatcher::random();

        self.write_commands(attachment, false, commands)
            .await
            .map_err(|e| CommandFailure::new(e, Vec::new()))?;
        self.write_commands(attachment, true, &[matcher.check_command()])
            .await
            .map_err(|e| CommandFailure::new(e, Vec::new()))?;

        let no_output_after = self.timeouts.no_output;
        let command_after = self.timeouts.command;
        let no_output = tokio::time::sleep(no_output_after);
        let command = tokio::time::sleep(command_after);
        tokio::pin!(no_output);
        tokio::pin!(command);

        while !matcher.is_done() {
            tokio::select! {
                biased;
                _ = attachment.cancel.cancelled() => matcher.cancel(),
                line = attachment.output.recv() => match line {
                    Some(line) => {
                        if matcher.feed(&line) == LineKind::Output {
                            self.emit(LogStream::Stdout, self.logs_hidden(), &line);
                        }
                        no_output.as_mut().reset(Instant::now() + no_output_after);
                    }
                    None => matcher.close(),
                },
                _ = &mut no_output => matcher.time_out(TimeoutKind::NoOutput(no_output_after)),
                _ = &mut command => matcher.time_out(TimeoutKind::Command(command_after)),
            }
        }

        matcher.finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.get_mut() {
            attachment.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeShell;

    fn session_with(shell: &FakeShell, timeouts: SessionTimeouts) -> (Session, EventBus) {
        let events = EventBus::new();
        let session = Session::new(Arc::new(shell.clone()), events.clone(), timeouts);
        (session, events)
    }

    #[tokio::test]
    async fn test_send_checked_returns_output_and_exit_code() {
        let shell = FakeShell::new().rule("foo", 0, &["foo\n"]);
        let (session, _events) = session_with(&shell, SessionTimeouts::default());
        session.attach(&CancellationToken::new()).await.unwrap();

        let output = session.send_checked(&["foo"]).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.lines, vec!["foo\n".to_string()]);
    }

    #[tokio::test]
    async fn test_send_checked_reports_failure_exit_code() {
        let shell = FakeShell::new().rule("make test", 2, &["FAIL\n"]);
        let (session, _events) = session_with(&shell, SessionTimeouts::default());
        session.attach(&CancellationToken::new()).await.unwrap();

        let output = session.send_checked(&["make test"]).await.unwrap();
        assert_eq!(output.exit_code, 2);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_send_before_attach_fails() {
        let shell = FakeShell::new();
        let (session, _events) = session_with(&shell, SessionTimeouts::default());

        assert!(matches!(
            session.send(false, &["ls"]).await,
            Err(SessionError::NotAttached)
        ));
        let failure = session.send_checked(&["ls"]).await.unwrap_err();
        assert!(matches!(failure.source, SessionError::NotAttached));
        assert_eq!(failure.exit_code(), -1);
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly_with_partial_output() {
        let shell = FakeShell::new().rule("long", 0, &["started\n"]).mute_sentinels();
        let (session, _events) = session_with(&shell, SessionTimeouts::default());
        let parent = CancellationToken::new();
        session.attach(&parent).await.unwrap();

        let canceller = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let failure = tokio::time::timeout(Duration::from_secs(5), session.send_checked(&["long"]))
            .await
            .expect("send_checked should not hang")
            .unwrap_err();

        assert_eq!(failure.exit_code(), -1);
        assert!(matches!(failure.source, SessionError::Cancelled));
        assert_eq!(failure.lines, vec!["started\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_output_timeout() {
        let shell = FakeShell::new().mute_sentinels();
        let timeouts = SessionTimeouts {
            no_output: Duration::from_secs(60),
            command: Duration::from_secs(600),
        };
        let (session, _events) = session_with(&shell, timeouts);
        session.attach(&CancellationToken::new()).await.unwrap();

        let failure = session.send_checked(&["sleep 1000"]).await.unwrap_err();
        assert!(matches!(failure.source, SessionError::NoOutputTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let shell = FakeShell::new().mute_sentinels();
        let timeouts = SessionTimeouts {
            no_output: Duration::from_secs(600),
            command: Duration::from_secs(60),
        };
        let (session, _events) = session_with(&shell, timeouts);
        session.attach(&CancellationToken::new()).await.unwrap();

        let failure = session.send_checked(&["sleep 1000"]).await.unwrap_err();
        assert!(matches!(failure.source, SessionError::CommandTimeout(_)));
    }

    #[tokio::test]
    async fn test_closed_shell() {
        let shell = FakeShell::new();
        let (session, _events) = session_with(&shell, SessionTimeouts::default());
        session.attach(&CancellationToken::new()).await.unwrap();

        let failure = session.send_checked(&["exit"]).await.unwrap_err();
        assert!(matches!(failure.source, SessionError::TransportClosed));
    }

    #[tokio::test]
    async fn test_log_events_follow_hidden_flag() {
        let shell = FakeShell::new().rule("env", 0, &["SECRET=1\n"]);
        let (session, events) = session_with(&shell, SessionTimeouts::default());
        let mut receiver = events.subscribe();
        session.attach(&CancellationToken::new()).await.unwrap();

        session.hide_logs();
        session.send_checked(&["env"]).await.unwrap();
        session.show_logs();
        session.send_checked(&["true"]).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let Event::Logs {
                stream,
                hidden,
                line,
                ..
            } = event
            {
                seen.push((stream, hidden, line));
            }
        }

        assert_eq!(seen[0], (LogStream::Stdin, true, "env".to_string()));
        assert_eq!(seen[1].0, LogStream::Stdin);
        assert!(seen[1].1, "sentinel command is always hidden");
        assert_eq!(seen[2], (LogStream::Stdout, true, "SECRET=1\n".to_string()));
        assert_eq!(seen[3], (LogStream::Stdin, false, "true".to_string()));
    }

    #[tokio::test]
    async fn test_commands_are_written_in_order() {
        let shell = FakeShell::new();
        let (session, _events) = session_with(&shell, SessionTimeouts::default());
        session.attach(&CancellationToken::new()).await.unwrap();

        session.send(false, &["cd /pipeline", "export A=1"]).await.unwrap();
        session.send_checked(&["true"]).await.unwrap();

        let commands = shell.commands();
        assert_eq!(&commands[..3], &["cd /pipeline", "export A=1", "true"]);
        assert!(commands[3].starts_with("echo "));
    }
}
