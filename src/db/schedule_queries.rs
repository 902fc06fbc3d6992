use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::schedule::{
    NewSchedule, NotificationConfig, RunStatus, Schedule, ScheduleRun, TriggerConfig, TriggerType,
};

fn parse_uuid(text: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(text).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let trigger_type: String = row.try_get("trigger_type")?;
    let trigger_config_json: String = row.try_get("trigger_config")?;
    let notification_config_json: String = row.try_get("notification_config")?;
    let last_run_status: Option<String> = row.try_get("last_run_status")?;

    let trigger_config: TriggerConfig = serde_json::from_str(&trigger_config_json)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Schedule {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        trigger_type: TriggerType::from_str(&trigger_type).unwrap_or(TriggerType::Cron),
        cron_expression: row.try_get("cron_expression")?,
        trigger_config,
        notification_config: serde_json::from_str(&notification_config_json)
            .unwrap_or_else(|_| NotificationConfig::default()),
        enabled: row.try_get("enabled")?,
        next_run_time: row.try_get("next_run_time")?,
        last_run_time: row.try_get("last_run_time")?,
        last_run_status: last_run_status.and_then(|s| RunStatus::from_str(&s).ok()),
        execution_count: row.try_get("execution_count")?,
        parallel_workers: row.try_get::<i64, _>("parallel_workers")? as u32,
        continue_on_error: row.try_get("continue_on_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<ScheduleRun, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let schedule_id: String = row.try_get("schedule_id")?;
    let status: String = row.try_get("status")?;
    let batch_id: Option<String> = row.try_get("batch_id")?;
    Ok(ScheduleRun {
        id: parse_uuid(&id)?,
        schedule_id: parse_uuid(&schedule_id)?,
        executed_at: row.try_get("executed_at")?,
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Running),
        batch_id: batch_id.as_deref().map(parse_uuid).transpose()?,
        duration_ms: row.try_get("duration_ms")?,
        files_found: row.try_get("files_found")?,
        files_processed: row.try_get("files_processed")?,
        error: row.try_get("error")?,
    })
}

/// Validate and persist a schedule. The initial next_run_time is the cron
/// expression's next match, or "now" for poll-driven triggers.
pub async fn create_schedule(
    pool: &SqlitePool,
    new: &NewSchedule,
) -> Result<Schedule, EngineError> {
    new.validate()?;

    let id = Uuid::new_v4();
    let now = Utc::now();
    let next_run_time = match new.cron_expression.as_deref() {
        Some(expr) => {
            // Parse already validated; re-parse to compute the first fire time.
            crate::services::cron::CronExpr::parse(expr)
                .map_err(|e| EngineError::Validation(e.to_string()))?
                .next_after(now)
        }
        None => Some(now),
    };

    let trigger_config_json = serde_json::to_string(&new.trigger_config)
        .map_err(|e| EngineError::Validation(e.to_string()))?;
    let notification_config_json = serde_json::to_string(&new.notification_config)
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO schedules (id, name, trigger_type, cron_expression, trigger_config,
                               notification_config, enabled, next_run_time, execution_count,
                               parallel_workers, continue_on_error, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(&new.name)
    .bind(new.trigger_config.trigger_type().to_string())
    .bind(&new.cron_expression)
    .bind(&trigger_config_json)
    .bind(&notification_config_json)
    .bind(new.enabled)
    .bind(next_run_time)
    .bind(new.parallel_workers as i64)
    .bind(new.continue_on_error)
    .bind(now)
    .execute(pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Schedule {
        id,
        name: new.name.clone(),
        trigger_type: new.trigger_config.trigger_type(),
        cron_expression: new.cron_expression.clone(),
        trigger_config: new.trigger_config.clone(),
        notification_config: new.notification_config.clone(),
        enabled: new.enabled,
        next_run_time,
        last_run_time: None,
        last_run_status: None,
        execution_count: 0,
        parallel_workers: new.parallel_workers,
        continue_on_error: new.continue_on_error,
        created_at: now,
    })
}

pub async fn get_schedule(pool: &SqlitePool, id: Uuid) -> Result<Option<Schedule>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(schedule_from_row).transpose()
}

/// Enabled schedules whose next_run_time has elapsed.
pub async fn due_schedules(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Vec<Schedule>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM schedules WHERE enabled = 1 AND next_run_time IS NOT NULL AND next_run_time <= ?",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(schedule_from_row).collect()
}

pub async fn set_schedule_enabled(
    pool: &SqlitePool,
    id: Uuid,
    enabled: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE schedules SET enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a schedule and its run history. Refused while a run is in flight.
pub async fn delete_schedule(pool: &SqlitePool, id: Uuid) -> Result<(), EngineError> {
    if has_running_run(pool, id).await? {
        return Err(EngineError::Conflict(format!(
            "schedule {id} has a run in flight"
        )));
    }
    let mut tx = pool.begin().await.map_err(EngineError::Database)?;
    sqlx::query("DELETE FROM schedule_runs WHERE schedule_id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(EngineError::Database)?;
    sqlx::query("DELETE FROM processed_files WHERE schedule_id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(EngineError::Database)?;
    sqlx::query("DELETE FROM schedules WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(EngineError::Database)?;
    tx.commit().await.map_err(EngineError::Database)?;
    Ok(())
}

/// Bookkeeping after a run: next fire time, last-run fields, counter.
pub async fn update_schedule_after_run(
    pool: &SqlitePool,
    id: Uuid,
    next_run_time: Option<DateTime<Utc>>,
    last_run_time: DateTime<Utc>,
    last_run_status: RunStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE schedules
        SET next_run_time = ?, last_run_time = ?, last_run_status = ?,
            execution_count = execution_count + 1
        WHERE id = ?
        "#,
    )
    .bind(next_run_time)
    .bind(last_run_time)
    .bind(last_run_status.to_string())
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Open a RUNNING audit record for one schedule execution.
pub async fn insert_run(
    pool: &SqlitePool,
    schedule_id: Uuid,
) -> Result<ScheduleRun, sqlx::Error> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO schedule_runs (id, schedule_id, executed_at, status, files_found, files_processed)
        VALUES (?, ?, ?, 'running', 0, 0)
        "#,
    )
    .bind(id.to_string())
    .bind(schedule_id.to_string())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(ScheduleRun {
        id,
        schedule_id,
        executed_at: now,
        status: RunStatus::Running,
        batch_id: None,
        duration_ms: None,
        files_found: 0,
        files_processed: 0,
        error: None,
    })
}

/// Finalize a run. The WHERE clause keeps terminal runs immutable: a second
/// finalization is a no-op.
pub async fn finalize_run(
    pool: &SqlitePool,
    run_id: Uuid,
    status: RunStatus,
    batch_id: Option<Uuid>,
    duration_ms: i64,
    files_found: i64,
    files_processed: i64,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE schedule_runs
        SET status = ?, batch_id = ?, duration_ms = ?, files_found = ?, files_processed = ?, error = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(status.to_string())
    .bind(batch_id.map(|id| id.to_string()))
    .bind(duration_ms)
    .bind(files_found)
    .bind(files_processed)
    .bind(error)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_run(pool: &SqlitePool, id: Uuid) -> Result<Option<ScheduleRun>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM schedule_runs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

/// Whether a schedule has a run that has not reached a terminal status.
/// Runs for one schedule never overlap.
pub async fn has_running_run(pool: &SqlitePool, schedule_id: Uuid) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM schedule_runs WHERE schedule_id = ? AND status = 'running'",
    )
    .bind(schedule_id.to_string())
    .fetch_one(pool)
    .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n > 0)
}

/// Restart recovery: runs stuck RUNNING belong to a dead process.
pub async fn fail_orphaned_runs(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE schedule_runs SET status = 'failed', error = 'interrupted by restart' WHERE status = 'running'",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Atomically claim a source file for a schedule. Returns false when the
/// (identity, fingerprint) pair was already claimed; the ledger is
/// append-only and marks "claimed", not "succeeded".
pub async fn claim_file(
    pool: &SqlitePool,
    schedule_id: Uuid,
    source_identity: &str,
    fingerprint: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO processed_files (schedule_id, source_identity, fingerprint, claimed_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(schedule_id.to_string())
    .bind(source_identity)
    .bind(fingerprint)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}
