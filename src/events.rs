use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::batch::BatchStatus;
use crate::models::project::ProjectStatus;
use crate::models::schedule::RunStatus;

/// Status-change event emitted on every batch, project, and schedule-run
/// transition. Consumed by whatever push channel the deployment wires up.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    Batch {
        batch_id: Uuid,
        status: BatchStatus,
    },
    Project {
        batch_id: Uuid,
        project_id: Uuid,
        status: ProjectStatus,
    },
    ScheduleRun {
        schedule_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Broadcast fan-out for status events. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Lagging or absent subscribers never block or fail the
    /// emitting component.
    pub fn emit(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("status event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
