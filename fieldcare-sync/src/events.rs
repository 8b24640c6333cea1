//! Notifications published to UI and ops layers

use crate::resource::ResourceType;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    LoadingMetadata,
    LoadingDataValues,
    Finishing,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::LoadingMetadata => "loading-metadata",
            SyncPhase::LoadingDataValues => "loading-data-values",
            SyncPhase::Finishing => "finishing",
            SyncPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// An initial load began
    LoadingStarted,
    PhaseChanged { phase: SyncPhase },
    /// Human-readable progress text
    LoadingProgress { message: String },
    /// Initial metadata loading failed; answer with
    /// [`crate::SyncEngine::resolve_failure`]
    DecisionRequired {
        failed: Vec<ResourceType>,
        reason: String,
    },
    LoadingFinished { success: bool },
}

/// Fan-out channel for [`SyncEvent`]s. Publishing never blocks; slow
/// subscribers observe `Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SyncEvent) {
        tracing::trace!(event = ?event, "Publishing sync event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.publish(SyncEvent::LoadingProgress {
            message: message.into(),
        });
    }
}
