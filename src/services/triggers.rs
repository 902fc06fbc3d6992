use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use glob::Pattern;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use sqlx::SqlitePool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::schedule_queries;
use crate::error::EngineError;
use crate::events::StatusEvent;
use crate::models::batch::{BatchStatus, NewBatch};
use crate::models::project::NewProject;
use crate::models::schedule::{RunStatus, Schedule, ScheduleRun, TriggerConfig};
use crate::services::cron::CronExpr;
use crate::services::notify::Notifier;
use crate::services::orchestrator::Orchestrator;

/// Credentials for buckets watched by s3 triggers (shared with the storage
/// backend configuration).
#[derive(Clone)]
pub struct S3WatchCredentials {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3WatchCredentials {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        Some(Self {
            endpoint: config.s3_endpoint.clone()?,
            access_key: config.s3_access_key.clone()?,
            secret_key: config.s3_secret_key.clone()?,
        })
    }
}

/// A source file discovered by a trigger scan, before ledger dedup.
struct DiscoveredFile {
    /// Stable identity of the source (absolute path or s3 URL).
    identity: String,
    /// Content fingerprint; a changed fingerprint means "new file".
    fingerprint: String,
    file_name: String,
    location: FileLocation,
}

enum FileLocation {
    Path(PathBuf),
    Object { bucket: Box<Bucket>, key: String },
}

impl FileLocation {
    async fn read(&self) -> Result<Vec<u8>, EngineError> {
        match self {
            FileLocation::Path(path) => tokio::fs::read(path)
                .await
                .map_err(|e| EngineError::Processing(format!("read {}: {e}", path.display()))),
            FileLocation::Object { bucket, key } => {
                let response = bucket
                    .get_object(key)
                    .await
                    .map_err(|e| EngineError::Processing(format!("fetch s3 {key}: {e}")))?;
                Ok(response.to_vec())
            }
        }
    }
}

struct RunOutcome {
    files_found: i64,
    files_processed: i64,
    batch_id: Option<Uuid>,
    batch_status: Option<BatchStatus>,
}

/// Single evaluation loop for all schedules. One engine instance owns every
/// schedule's state; nothing about it is global.
pub struct TriggerEngine {
    db: SqlitePool,
    orchestrator: Orchestrator,
    notifier: Arc<Notifier>,
    s3: Option<S3WatchCredentials>,
    tick_interval: Duration,
}

impl TriggerEngine {
    pub fn new(
        orchestrator: Orchestrator,
        notifier: Arc<Notifier>,
        s3: Option<S3WatchCredentials>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            db: orchestrator.db().clone(),
            orchestrator,
            notifier,
            s3,
            tick_interval,
        }
    }

    /// Poll on a fixed tick until shutdown is signalled. In-flight runs
    /// complete; shutdown only prevents future ticks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            tick_secs = self.tick_interval.as_secs(),
            "trigger engine started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "trigger tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("trigger engine stopping");
                    break;
                }
            }
        }
    }

    /// Evaluate every due schedule once. Returns how many runs executed.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        let due = schedule_queries::due_schedules(&self.db, Utc::now()).await?;
        let mut executed = 0;
        for schedule in due {
            match self.execute_schedule(&schedule).await {
                Ok(Some(_)) => executed += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(schedule_id = %schedule.id, error = %e, "schedule execution failed");
                }
            }
        }
        Ok(executed)
    }

    /// Execute exactly one run for a schedule, unless its previous run is
    /// still in flight. Every run leaves one ScheduleRun record.
    pub async fn execute_schedule(
        &self,
        schedule: &Schedule,
    ) -> Result<Option<ScheduleRun>, EngineError> {
        if schedule_queries::has_running_run(&self.db, schedule.id).await? {
            tracing::debug!(schedule_id = %schedule.id, "previous run still in flight, skipping");
            return Ok(None);
        }

        let run = schedule_queries::insert_run(&self.db, schedule.id).await?;
        self.orchestrator.events().emit(StatusEvent::ScheduleRun {
            schedule_id: schedule.id,
            run_id: run.id,
            status: RunStatus::Running,
        });
        let started = Instant::now();

        tracing::info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            run_id = %run.id,
            "schedule run started"
        );

        let (status, outcome, error) = match self.perform(schedule).await {
            Ok(outcome) => {
                let status = match outcome.batch_status {
                    None => RunStatus::Success,
                    Some(BatchStatus::Completed) => RunStatus::Success,
                    Some(BatchStatus::Partial) => RunStatus::Partial,
                    Some(_) => RunStatus::Failed,
                };
                (status, outcome, None)
            }
            Err(e) => (
                RunStatus::Failed,
                RunOutcome {
                    files_found: 0,
                    files_processed: 0,
                    batch_id: None,
                    batch_status: None,
                },
                Some(e.to_string()),
            ),
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        schedule_queries::finalize_run(
            &self.db,
            run.id,
            status,
            outcome.batch_id,
            duration_ms,
            outcome.files_found,
            outcome.files_processed,
            error.as_deref(),
        )
        .await?;
        self.orchestrator.events().emit(StatusEvent::ScheduleRun {
            schedule_id: schedule.id,
            run_id: run.id,
            status,
        });

        let now = Utc::now();
        let next_run_time = self.next_run_time(schedule, now);
        schedule_queries::update_schedule_after_run(&self.db, schedule.id, next_run_time, now, status)
            .await?;

        let finalized = schedule_queries::get_run(&self.db, run.id)
            .await?
            .unwrap_or(run);

        tracing::info!(
            schedule_id = %schedule.id,
            run_id = %finalized.id,
            status = %status,
            files_found = finalized.files_found,
            files_processed = finalized.files_processed,
            duration_ms,
            "schedule run finished"
        );

        self.notifier.dispatch(schedule, &finalized).await;
        Ok(Some(finalized))
    }

    fn next_run_time(
        &self,
        schedule: &Schedule,
        now: chrono::DateTime<Utc>,
    ) -> Option<chrono::DateTime<Utc>> {
        match schedule.trigger_config.poll_interval_secs() {
            Some(secs) => Some(now + chrono::Duration::seconds(secs as i64)),
            None => schedule
                .cron_expression
                .as_deref()
                .and_then(|expr| CronExpr::parse(expr).ok())
                .and_then(|expr| expr.next_after(now)),
        }
    }

    /// Scan the schedule's source, claim unseen files, and run one batch
    /// over the claims.
    async fn perform(&self, schedule: &Schedule) -> Result<RunOutcome, EngineError> {
        let discovered = match &schedule.trigger_config {
            TriggerConfig::Cron {
                directory: None, ..
            } => Vec::new(),
            TriggerConfig::Cron {
                directory: Some(directory),
                recursive,
                pattern,
            } => scan_directory(Path::new(directory), *recursive, pattern).await?,
            TriggerConfig::Directory {
                directory,
                recursive,
                pattern,
                ..
            } => scan_directory(Path::new(directory), *recursive, pattern).await?,
            TriggerConfig::S3 {
                bucket,
                prefix,
                pattern,
                ..
            } => self.scan_object_store(bucket, prefix, pattern).await?,
        };

        let files_found = discovered.len() as i64;

        // Claim before processing so an overlapping tick cannot enqueue the
        // same file twice.
        let mut claimed = Vec::new();
        for file in discovered {
            if schedule_queries::claim_file(&self.db, schedule.id, &file.identity, &file.fingerprint)
                .await?
            {
                claimed.push(file);
            }
        }

        if claimed.is_empty() {
            return Ok(RunOutcome {
                files_found,
                files_processed: 0,
                batch_id: None,
                batch_status: None,
            });
        }

        let mut projects = Vec::with_capacity(claimed.len());
        for file in &claimed {
            let project = NewProject::new(file.file_name.clone());
            let bytes = file.location.read().await?;
            self.orchestrator
                .storage()
                .save(&project.storage_key, &bytes)
                .await?;
            projects.push(project);
        }

        let files_processed = projects.len() as i64;
        let new_batch = NewBatch {
            name: format!("{} {}", schedule.name, Utc::now().format("%Y-%m-%d %H:%M")),
            tags: vec!["scheduled".to_string(), schedule.name.clone()],
            continue_on_error: schedule.continue_on_error,
            parallel_workers: schedule.parallel_workers,
        };
        let batch = self.orchestrator.create_batch(new_batch, projects).await?;
        let finished = self.orchestrator.run_batch(batch.id).await?;

        Ok(RunOutcome {
            files_found,
            files_processed,
            batch_id: Some(finished.id),
            batch_status: Some(finished.status),
        })
    }

    async fn scan_object_store(
        &self,
        bucket_name: &str,
        prefix: &str,
        pattern: &str,
    ) -> Result<Vec<DiscoveredFile>, EngineError> {
        let creds = self.s3.as_ref().ok_or_else(|| {
            EngineError::Validation("s3 trigger requires object store credentials".to_string())
        })?;

        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: creds.endpoint.clone(),
        };
        let credentials = Credentials::new(
            Some(&creds.access_key),
            Some(&creds.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| EngineError::Validation(e.to_string()))?;
        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let matcher = Pattern::new(pattern)
            .map_err(|e| EngineError::Validation(format!("bad pattern `{pattern}`: {e}")))?;

        let pages = bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| EngineError::Processing(format!("list s3 {bucket_name}/{prefix}: {e}")))?;

        let mut discovered = Vec::new();
        for object in pages.into_iter().flat_map(|page| page.contents) {
            let file_name = object
                .key
                .rsplit('/')
                .next()
                .unwrap_or(&object.key)
                .to_string();
            if file_name.is_empty() || !matcher.matches(&file_name) {
                continue;
            }
            // Dedup on (key, etag): overwritten objects reprocess, untouched
            // ones do not.
            let fingerprint = object
                .e_tag
                .as_deref()
                .map(|tag| tag.trim_matches('"').to_string())
                .unwrap_or_else(|| object.size.to_string());
            discovered.push(DiscoveredFile {
                identity: format!("s3://{}/{}", bucket_name, object.key),
                fingerprint,
                file_name,
                location: FileLocation::Object {
                    bucket: bucket.clone(),
                    key: object.key,
                },
            });
        }
        Ok(discovered)
    }
}

/// List files under a directory matching a glob pattern on the file name.
async fn scan_directory(
    directory: &Path,
    recursive: bool,
    pattern: &str,
) -> Result<Vec<DiscoveredFile>, EngineError> {
    let matcher = Pattern::new(pattern)
        .map_err(|e| EngineError::Validation(format!("bad pattern `{pattern}`: {e}")))?;

    if !directory.is_dir() {
        return Err(EngineError::Processing(format!(
            "watch directory {} is unreachable",
            directory.display()
        )));
    }

    let mut discovered = Vec::new();
    let mut pending = vec![directory.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .map_err(|e| EngineError::Processing(format!("read {}: {e}", current.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::Processing(e.to_string()))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| EngineError::Processing(e.to_string()))?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(path);
                }
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !matcher.matches(&file_name) {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| EngineError::Processing(e.to_string()))?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let identity = tokio::fs::canonicalize(&path)
                .await
                .unwrap_or_else(|_| path.clone())
                .to_string_lossy()
                .to_string();
            discovered.push(DiscoveredFile {
                identity,
                fingerprint: format!("{}:{}", meta.len(), mtime),
                file_name,
                location: FileLocation::Path(path),
            });
        }
    }
    Ok(discovered)
}
