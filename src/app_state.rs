use std::sync::Arc;

use sqlx::SqlitePool;

use crate::events::EventBus;
use crate::services::notify::Notifier;
use crate::services::orchestrator::Orchestrator;
use crate::services::processor::Processor;
use crate::services::storage::StorageBackend;

/// Shared application state handed to every long-running component.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub storage: Arc<dyn StorageBackend>,
    pub processor: Arc<dyn Processor>,
    pub orchestrator: Orchestrator,
    pub notifier: Arc<Notifier>,
    pub events: EventBus,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        storage: Arc<dyn StorageBackend>,
        processor: Arc<dyn Processor>,
        notifier: Notifier,
    ) -> Self {
        let events = EventBus::default();
        let orchestrator = Orchestrator::new(
            db.clone(),
            Arc::clone(&storage),
            Arc::clone(&processor),
            events.clone(),
        );
        Self {
            db,
            storage,
            processor,
            orchestrator,
            notifier: Arc::new(notifier),
            events,
        }
    }
}
