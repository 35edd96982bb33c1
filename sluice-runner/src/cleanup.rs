//! Cleanup registry and interrupt handling
//!
//! Handlers are registered as resources are acquired and run most recent
//! first, either when the pipeline finishes or when the operator interrupts
//! it. A handler returning false stops the remaining ones from running.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type Handler = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send>;

struct Entry {
    name: String,
    handler: Handler,
}

#[derive(Default)]
pub struct CleanupRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; it returns whether the next handler should run
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.entries.lock().unwrap().push(Entry {
            name: name.into(),
            handler: Box::new(move || Box::pin(handler())),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered handler, last registered first
    ///
    /// Handlers are taken out of the registry up front, so concurrent calls
    /// never run the same handler twice.
    pub async fn run_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        debug!("Running {} cleanup handler(s)", entries.len());

        let mut remaining = entries.into_iter().rev();
        for entry in remaining.by_ref() {
            debug!("Running cleanup handler '{}'", entry.name);
            if !(entry.handler)().await {
                warn!("Cleanup handler '{}' stopped cleanup", entry.name);
                break;
            }
        }

        let skipped: Vec<String> = remaining.map(|entry| entry.name).collect();
        if !skipped.is_empty() {
            warn!("Skipped cleanup handlers: {}", skipped.join(", "));
        }
    }
}

/// Cancels `cancel` and runs the cleanup handlers on the first interrupt
///
/// The process exits once cleanup is done, or right away on a second
/// interrupt.
pub fn install_signal_handler(
    registry: Arc<CleanupRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupts: {}", e);
            return;
        }

        warn!("Interrupted, cleaning up (interrupt again to force exit)");
        cancel.cancel();

        tokio::select! {
            _ = registry.run_all() => {
                warn!("Cleanup finished, exiting");
            }
            _ = tokio::signal::ctrl_c() => {
                error!("Interrupted again, exiting without finishing cleanup");
            }
        }

        std::process::exit(1);
    })
}
