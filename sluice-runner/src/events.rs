//! Event bus
//!
//! Lifecycle and log events fan out to any number of subscribers through a
//! broadcast channel. Emitting never waits on a subscriber; a subscriber
//! that falls too far behind skips events instead of stalling the pipeline.

use colored::Colorize;
use sluice_core::event::{Event, LogStream, StepRef};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emits a runner-produced log line
    pub fn system(&self, step: Option<StepRef>, line: impl Into<String>) {
        self.emit(Event::logs(step, LogStream::System, false, line));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a task rendering events to the terminal
///
/// Hidden log lines are only printed in debug mode. The task ends when the
/// bus is dropped.
pub fn spawn_printer(bus: &EventBus, debug_mode: bool) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Some(text) = render(&event, debug_mode) {
                        print!("{}", text);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Printer fell behind, skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, printer exiting");
                    break;
                }
            }
        }
    })
}

/// Formats an event for the terminal, `None` when it should not be shown
fn render(event: &Event, debug_mode: bool) -> Option<String> {
    match event {
        Event::Logs {
            stream,
            hidden,
            line,
            ..
        } => {
            if *hidden && !debug_mode {
                return None;
            }
            let line = if line.ends_with('\n') {
                line.clone()
            } else {
                format!("{}\n", line)
            };
            let text = match (stream, debug_mode) {
                (LogStream::Stdin, true) => format!("{} {}", "$".cyan(), line),
                (LogStream::Stdin, false) => return None,
                (LogStream::System, _) => line.yellow().to_string(),
                (LogStream::Stdout, _) => line,
            };
            Some(if *hidden { text.dimmed().to_string() } else { text })
        }
        Event::BuildStepsAdded { steps, after_steps } => Some(format!(
            "{}\n",
            format!(
                "Running {} step(s), {} after-step(s)",
                steps.len(),
                after_steps.len()
            )
            .bold()
        )),
        Event::BuildStepStarted { step } => {
            Some(format!("{}\n", format!("Running step: {}", step.display_name).bold()))
        }
        Event::BuildStepFinished {
            step,
            success,
            message,
            duration,
        } => {
            let status = if *success {
                "passed".green()
            } else {
                "failed".red()
            };
            let mut text = format!(
                "{} {} ({:.1}s)\n",
                step.display_name.bold(),
                status,
                duration.as_secs_f64()
            );
            if let Some(message) = message {
                if !success {
                    text.push_str(&format!("{}\n", message.red()));
                }
            }
            Some(text)
        }
        Event::BuildFinished { success, message } => {
            let mut text = if *success {
                format!("{}\n", "Pipeline passed".green().bold())
            } else {
                format!("{}\n", "Pipeline failed".red().bold())
            };
            if let Some(message) = message {
                text.push_str(&format!("{}\n", message));
            }
            Some(text)
        }
        Event::FullPipelineFinished { duration, .. } => {
            Some(format!("Finished in {:.1}s\n", duration.as_secs_f64()))
        }
    }
}
