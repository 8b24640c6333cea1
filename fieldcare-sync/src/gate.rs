//! Completion gate
//!
//! Waits until the storage collaborator has been quiet for a grace window.
//! This is a heuristic: a slow unrelated write looks the same as a write
//! still in progress, so release only means "nothing observed for a
//! window", not "every write has landed".

use crate::resource::ResourceType;
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout_at, Instant};

/// What happened while waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quiescence {
    /// Relevant writes that reset the window
    pub writes_observed: usize,
    pub waited: Duration,
}

#[derive(Clone)]
pub struct CompletionGate {
    storage: Arc<dyn Storage>,
    window: Duration,
}

impl CompletionGate {
    pub fn new(storage: Arc<dyn Storage>, window: Duration) -> Self {
        Self { storage, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Block until no write to `collections` was seen for one window.
    /// An empty slice watches every collection.
    pub async fn await_quiescence(&self, collections: &[ResourceType]) -> Quiescence {
        let mut changes = self.storage.subscribe();
        let started = Instant::now();
        let mut deadline = started + self.window;
        let mut writes_observed = 0;

        loop {
            match timeout_at(deadline, changes.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(change)) => {
                    if collections.is_empty() || collections.contains(&change.resource) {
                        writes_observed += 1;
                        deadline = Instant::now() + self.window;
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    // Missed notifications may have been relevant
                    writes_observed += usize::try_from(skipped).unwrap_or(usize::MAX);
                    deadline = Instant::now() + self.window;
                }
                Ok(Err(RecvError::Closed)) => break,
            }
        }

        let waited = started.elapsed();
        tracing::debug!(
            writes = writes_observed,
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "Storage quiescent"
        );
        Quiescence {
            writes_observed,
            waited,
        }
    }
}
