use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::db::{queries, schedule_queries};
use crate::error::EngineError;
use crate::events::{EventBus, StatusEvent};
use crate::models::batch::{clamp_workers, Batch, BatchStatus, NewBatch};
use crate::models::project::{NewProject, ProjectStatus};
use crate::services::pool::{PoolExit, WorkerPool};
use crate::services::processor::Processor;
use crate::services::storage::StorageBackend;

/// Owns batch/project lifecycle: creation, execution, cancellation,
/// deletion, and restart reconciliation.
#[derive(Clone)]
pub struct Orchestrator {
    db: SqlitePool,
    storage: Arc<dyn StorageBackend>,
    processor: Arc<dyn Processor>,
    events: EventBus,
    /// Cancellation handles for batches currently running in this process.
    running: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl Orchestrator {
    pub fn new(
        db: SqlitePool,
        storage: Arc<dyn StorageBackend>,
        processor: Arc<dyn Processor>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            storage,
            processor,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Persist a batch and its member projects, all PENDING. Membership is
    /// immutable from here on.
    pub async fn create_batch(
        &self,
        mut new: NewBatch,
        projects: Vec<NewProject>,
    ) -> Result<Batch, EngineError> {
        if projects.is_empty() {
            return Err(EngineError::Validation(
                "a batch requires at least one project".to_string(),
            ));
        }
        new.parallel_workers = clamp_workers(new.parallel_workers);

        let batch = queries::create_batch(&self.db, &new, &projects).await?;
        tracing::info!(
            batch_id = %batch.id,
            name = %batch.name,
            projects = projects.len(),
            "batch created"
        );
        Ok(batch)
    }

    /// Drive a batch to a terminal status through the worker pool and return
    /// the final record.
    pub async fn run_batch(&self, batch_id: Uuid) -> Result<Batch, EngineError> {
        let batch = queries::get_batch(&self.db, batch_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("batch {batch_id}")))?;
        let projects = queries::list_projects(&self.db, batch_id).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running.lock().await.insert(batch_id, cancel_tx);

        let pool = WorkerPool::new(
            self.db.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.processor),
            self.events.clone(),
        );
        let exit = pool.run(&batch, projects, cancel_rx).await;

        self.running.lock().await.remove(&batch_id);
        let exit = exit?;

        self.finalize_batch(&batch, exit).await?;

        queries::get_batch(&self.db, batch_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("batch {batch_id}")))
    }

    /// Resolve the batch's final status after the pool has drained.
    ///
    /// A cancelled batch marks its untouched projects FAILED with a
    /// cancellation reason. A batch stopped early by continue_on_error
    /// resolves to PARTIAL (or FAILED when nothing completed) even though
    /// PENDING members remain.
    async fn finalize_batch(&self, batch: &Batch, exit: PoolExit) -> Result<(), EngineError> {
        if exit == PoolExit::Cancelled {
            let projects = queries::list_projects(&self.db, batch.id).await?;
            for project in projects.iter().filter(|p| !p.status.is_terminal()) {
                queries::mark_project_terminal(
                    &self.db,
                    project.id,
                    ProjectStatus::Failed,
                    Some("batch cancelled"),
                )
                .await?;
                self.events.emit(StatusEvent::Project {
                    batch_id: batch.id,
                    project_id: project.id,
                    status: ProjectStatus::Failed,
                });
            }
        }

        let (mut status, mut changed) = queries::recompute_batch_status(&self.db, batch.id).await?;

        if exit == PoolExit::StoppedOnError && !status.is_terminal() {
            let projects = queries::list_projects(&self.db, batch.id).await?;
            let any_completed = projects
                .iter()
                .any(|p| p.status == ProjectStatus::Completed);
            let all_failed = projects.iter().all(|p| p.status == ProjectStatus::Failed);
            let resolved = if all_failed {
                BatchStatus::Failed
            } else if any_completed || projects.iter().any(|p| p.status == ProjectStatus::Pending)
            {
                BatchStatus::Partial
            } else {
                status
            };
            if resolved != status {
                queries::set_batch_status(&self.db, batch.id, resolved).await?;
                status = resolved;
                changed = true;
            }
        }

        if changed {
            self.events.emit(StatusEvent::Batch {
                batch_id: batch.id,
                status,
            });
        }

        tracing::info!(batch_id = %batch.id, status = %status, "batch finished");
        Ok(())
    }

    /// Stop a running batch: dequeuing halts, in-flight projects finish, and
    /// the remainder is marked FAILED by `run_batch`'s finalization.
    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<(), EngineError> {
        let running = self.running.lock().await;
        match running.get(&batch_id) {
            Some(tx) => {
                let _ = tx.send(true);
                tracing::info!(batch_id = %batch_id, "batch cancellation requested");
                Ok(())
            }
            None => Err(EngineError::Conflict(format!(
                "batch {batch_id} is not running"
            ))),
        }
    }

    /// Delete a batch, its projects, and every stored artifact under each
    /// project's scope. Refused while the batch is PROCESSING.
    pub async fn delete_batch(&self, batch_id: Uuid) -> Result<(), EngineError> {
        let batch = queries::get_batch(&self.db, batch_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("batch {batch_id}")))?;

        if batch.status == BatchStatus::Processing || self.running.lock().await.contains_key(&batch_id)
        {
            return Err(EngineError::Conflict(format!(
                "batch {batch_id} is processing; wait for a terminal status or cancel it first"
            )));
        }

        let projects = queries::list_projects(&self.db, batch_id).await?;
        for project in &projects {
            for key in self.storage.list(&project.scope()).await? {
                self.storage.delete(&key).await?;
            }
        }

        queries::delete_batch_rows(&self.db, batch_id).await?;
        tracing::info!(batch_id = %batch_id, projects = projects.len(), "batch deleted");
        Ok(())
    }

    /// Terminal batches untouched for longer than `inactive_days`, paired
    /// with the bytes their projects hold in storage. Advisory only; nothing
    /// is moved or deleted here.
    pub async fn archive_candidates(
        &self,
        inactive_days: i64,
    ) -> Result<Vec<(Batch, u64)>, EngineError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(inactive_days);
        let mut candidates = Vec::new();
        for batch in queries::batches_inactive_since(&self.db, cutoff).await? {
            let mut bytes = 0u64;
            for project in queries::list_projects(&self.db, batch.id).await? {
                bytes += self.storage.size_of(&project.scope()).await?;
            }
            candidates.push((batch, bytes));
        }
        Ok(candidates)
    }

    /// Startup reconciliation: no batch stays PROCESSING forever across a
    /// restart. Orphaned PROCESSING projects return to PENDING, orphaned
    /// RUNNING schedule runs are failed, and affected aggregates recompute.
    pub async fn reconcile(&self) -> Result<(), EngineError> {
        let affected = queries::reset_orphaned_processing(&self.db).await?;
        if !affected.is_empty() {
            tracing::warn!(
                batches = affected.len(),
                "reset orphaned processing projects to pending"
            );
        }

        let failed_runs = schedule_queries::fail_orphaned_runs(&self.db).await?;
        if failed_runs > 0 {
            tracing::warn!(runs = failed_runs, "failed orphaned schedule runs");
        }

        for batch_id in queries::non_terminal_batches(&self.db).await? {
            queries::recompute_batch_status(&self.db, batch_id).await?;
        }
        Ok(())
    }
}
