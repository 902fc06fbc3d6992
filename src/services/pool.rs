use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::db::queries;
use crate::events::{EventBus, StatusEvent};
use crate::models::batch::{clamp_workers, Batch};
use crate::models::project::{Project, ProjectStatus};
use crate::services::processor::{ProcessingOptions, Processor, ProcessorError};
use crate::services::storage::{StorageBackend, StorageError};

/// Bounded-concurrency executor for the projects of one batch.
///
/// Each project is owned exclusively by the worker that picks it up; errors
/// at the worker boundary are recorded on the project and never crash the
/// pool. `run` returns only after every in-flight worker has finished.
pub struct WorkerPool {
    db: SqlitePool,
    storage: Arc<dyn StorageBackend>,
    processor: Arc<dyn Processor>,
    events: EventBus,
}

/// How a pool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolExit {
    /// Every project was dequeued and reached a terminal status.
    Drained,
    /// Dequeuing stopped after a failure (continue_on_error = false).
    StoppedOnError,
    /// Dequeuing stopped because cancellation was signalled.
    Cancelled,
}

impl WorkerPool {
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
        }
    }

    /// Process the batch's pending projects with up to `parallel_workers`
    /// concurrent workers. In-flight projects always finish, even when
    /// dequeuing stops early.
    pub async fn run(
        &self,
        batch: &Batch,
        projects: Vec<Project>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PoolExit, sqlx::Error> {
        let workers = clamp_workers(batch.parallel_workers) as usize;
        let semaphore = Arc::new(Semaphore::new(workers));
        let failed = Arc::new(AtomicBool::new(false));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut exit = PoolExit::Drained;

        for project in projects
            .into_iter()
            .filter(|p| p.status == ProjectStatus::Pending)
        {
            // A failure observed while waiting for a permit also stops
            // dequeuing when the batch is not continue-on-error.
            if *cancel.borrow_and_update() {
                exit = PoolExit::Cancelled;
                break;
            }
            if !batch.continue_on_error && failed.load(Ordering::SeqCst) {
                exit = PoolExit::StoppedOnError;
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("pool semaphore never closed");

            if *cancel.borrow_and_update() {
                exit = PoolExit::Cancelled;
                break;
            }
            if !batch.continue_on_error && failed.load(Ordering::SeqCst) {
                exit = PoolExit::StoppedOnError;
                break;
            }

            let db = self.db.clone();
            let storage = Arc::clone(&self.storage);
            let processor = Arc::clone(&self.processor);
            let events = self.events.clone();
            let failed = Arc::clone(&failed);

            join_set.spawn(async move {
                let _permit = permit;
                let project_id = project.id;
                if let Err(e) =
                    process_project(&db, storage, processor, &events, project, &failed).await
                {
                    // Database failures here leave the project row behind;
                    // reconciliation on restart picks it back up.
                    tracing::error!(project_id = %project_id, error = %e, "failed to record project outcome");
                    failed.store(true, Ordering::SeqCst);
                }
            });
        }

        // No silent abandonment: wait for every in-flight worker.
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker task panicked");
            }
        }

        Ok(exit)
    }
}

/// One worker's whole journey for one project: claim it, fetch the artifact,
/// call the external processor, persist outputs, record the outcome.
async fn process_project(
    db: &SqlitePool,
    storage: Arc<dyn StorageBackend>,
    processor: Arc<dyn Processor>,
    events: &EventBus,
    project: Project,
    failed: &AtomicBool,
) -> Result<(), sqlx::Error> {
    queries::mark_project_processing(db, project.id).await?;
    emit_transitions(db, events, &project, ProjectStatus::Processing).await?;

    tracing::info!(
        project_id = %project.id,
        batch_id = %project.batch_id,
        storage_key = %project.storage_key,
        "processing project"
    );

    let outcome = execute(&*storage, &*processor, &project).await;

    let (status, error) = match &outcome {
        Ok(artifact_count) => {
            tracing::info!(
                project_id = %project.id,
                artifacts = artifact_count,
                "project completed"
            );
            (ProjectStatus::Completed, None)
        }
        Err(e) => {
            tracing::warn!(project_id = %project.id, error = %e, "project failed");
            failed.store(true, Ordering::SeqCst);
            (ProjectStatus::Failed, Some(e.to_string()))
        }
    };

    queries::mark_project_terminal(db, project.id, status, error.as_deref()).await?;
    emit_transitions(db, events, &project, status).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Processor(#[from] ProcessorError),
}

async fn execute(
    storage: &dyn StorageBackend,
    processor: &dyn Processor,
    project: &Project,
) -> Result<usize, WorkerError> {
    let input = storage.get(&project.storage_key).await?;

    let options = ProcessingOptions {
        source_name: project.name.clone(),
    };
    let outputs = processor.process(&input, &options).await?;

    let count = outputs.len();
    for artifact in outputs {
        storage
            .save(&project.output_key(&artifact.name), &artifact.bytes)
            .await?;
    }
    Ok(count)
}

/// Emit the project event and, when the batch aggregate moved, the batch
/// event. The aggregate is recomputed after every project transition.
async fn emit_transitions(
    db: &SqlitePool,
    events: &EventBus,
    project: &Project,
    status: ProjectStatus,
) -> Result<(), sqlx::Error> {
    events.emit(StatusEvent::Project {
        batch_id: project.batch_id,
        project_id: project.id,
        status,
    });
    let (batch_status, changed) = queries::recompute_batch_status(db, project.batch_id).await?;
    if changed {
        events.emit(StatusEvent::Batch {
            batch_id: project.batch_id,
            status: batch_status,
        });
    }
    Ok(())
}
