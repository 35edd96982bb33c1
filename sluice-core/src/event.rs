//! Lifecycle events
//!
//! Emitted by the runner in order while a pipeline executes. Consumers
//! (terminal printers, reporters) subscribe to these independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stream a log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Command written to the guest shell
    Stdin,
    /// Output read back from the guest
    Stdout,
    /// Messages produced by the runner itself
    System,
}

/// Reference to a step inside the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub safe_id: String,
    pub name: String,
    pub display_name: String,
    /// Position of the step, after-steps continue after the main steps
    pub order: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Logs {
        timestamp: DateTime<Utc>,
        step: Option<StepRef>,
        stream: LogStream,
        hidden: bool,
        line: String,
    },
    BuildStepsAdded {
        steps: Vec<StepRef>,
        after_steps: Vec<StepRef>,
    },
    BuildStepStarted {
        step: StepRef,
    },
    BuildStepFinished {
        step: StepRef,
        success: bool,
        message: Option<String>,
        duration: Duration,
    },
    BuildFinished {
        success: bool,
        message: Option<String>,
    },
    FullPipelineFinished {
        success: bool,
        duration: Duration,
    },
}

impl Event {
    pub fn logs(step: Option<StepRef>, stream: LogStream, hidden: bool, line: impl Into<String>) -> Self {
        Event::Logs {
            timestamp: Utc::now(),
            step,
            stream,
            hidden,
            line: line.into(),
        }
    }
}
