//! Command completion protocol
//!
//! A shell stream has no notion of "command finished". After the real
//! commands the session sends `echo <sentinel> $?` and scans output until a
//! line starts with the sentinel; the trailing token is the exit code.
//! [`SentinelMatcher`] holds the state of one such exchange, independent of
//! any I/O, so every transition can be driven directly.

use std::time::Duration;

use crate::session::SessionError;

/// Exit code reported when a command did not complete
pub const INCOMPLETE_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No line was received for the configured period
    NoOutput(Duration),
    /// The command ran longer than allowed
    Command(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckState {
    AwaitingSentinel,
    Matched(i32),
    Malformed(String),
    TimedOut(TimeoutKind),
    Cancelled,
    Closed,
}

/// How a received line was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Regular command output
    Output,
    /// The sentinel line ending the command
    Sentinel,
    /// Line received after the exchange already ended
    Ignored,
}

/// Output of a command that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A checked send that did not observe its sentinel
///
/// Output collected before the failure is kept.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct CommandFailure {
    pub lines: Vec<String>,
    #[source]
    pub source: SessionError,
}

impl CommandFailure {
    pub fn new(source: SessionError, lines: Vec<String>) -> Self {
        Self { lines, source }
    }

    pub fn exit_code(&self) -> i32 {
        INCOMPLETE_EXIT_CODE
    }
}

/// State of a single checked send
#[derive(Debug)]
pub struct SentinelMatcher {
    sentinel: String,
    lines: Vec<String>,
    state: CheckState,
}

impl SentinelMatcher {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            lines: Vec::new(),
            state: CheckState::AwaitingSentinel,
        }
    }

    /// Creates a matcher with a random sentinel
    pub fn random() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Shell command printing the sentinel and the last exit status
    pub fn check_command(&self) -> String {
        format!("echo {} $?", self.sentinel)
    }

    pub fn state(&self) -> &CheckState {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        self.state != CheckState::AwaitingSentinel
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Classifies a received line, collecting it when it is output
    pub fn feed(&mut self, line: &str) -> LineKind {
        if self.is_done() {
            return LineKind::Ignored;
        }

        let Some(rest) = line.strip_prefix(self.sentinel.as_str()) else {
            self.lines.push(line.to_string());
            return LineKind::Output;
        };

        self.state = match rest.split_whitespace().last().map(str::parse::<i32>) {
            Some(Ok(code)) => CheckState::Matched(code),
            _ => CheckState::Malformed(line.trim_end().to_string()),
        };
        LineKind::Sentinel
    }

    pub fn time_out(&mut self, kind: TimeoutKind) {
        self.transition(CheckState::TimedOut(kind));
    }

    pub fn cancel(&mut self) {
        self.transition(CheckState::Cancelled);
    }

    /// The output stream ended before the sentinel arrived
    pub fn close(&mut self) {
        self.transition(CheckState::Closed);
    }

    fn transition(&mut self, next: CheckState) {
        if !self.is_done() {
            self.state = next;
        }
    }

    /// Consumes the matcher into the result of the exchange
    pub fn finish(self) -> Result<CommandOutput, CommandFailure> {
        let error = match self.state {
            CheckState::Matched(exit_code) => {
                return Ok(CommandOutput {
                    exit_code,
                    lines: self.lines,
                });
            }
            CheckState::AwaitingSentinel | CheckState::Closed => SessionError::TransportClosed,
            CheckState::Malformed(line) => SessionError::MalformedSentinel(line),
            CheckState::TimedOut(TimeoutKind::NoOutput(after)) => SessionError::NoOutputTimeout(after),
            CheckState::TimedOut(TimeoutKind::Command(after)) => SessionError::CommandTimeout(after),
            CheckState::Cancelled => SessionError::Cancelled,
        };
        Err(CommandFailure::new(error, self.lines))
    }
}
