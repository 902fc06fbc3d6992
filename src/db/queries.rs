use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::batch::{aggregate_status, Batch, BatchStatus, NewBatch};
use crate::models::project::{NewProject, Project, ProjectStatus};

fn parse_uuid(text: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(text).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let tags_json: String = row.try_get("tags")?;
    let status_text: String = row.try_get("status")?;
    Ok(Batch {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        status: BatchStatus::from_str(&status_text).unwrap_or(BatchStatus::Pending),
        created_at: row.try_get("created_at")?,
        total: row.try_get("total")?,
        succeeded: row.try_get("succeeded")?,
        failed: row.try_get("failed")?,
        continue_on_error: row.try_get("continue_on_error")?,
        parallel_workers: row.try_get::<i64, _>("parallel_workers")? as u32,
    })
}

fn project_from_row(row: &SqliteRow) -> Result<Project, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let batch_id: String = row.try_get("batch_id")?;
    let status_text: String = row.try_get("status")?;
    Ok(Project {
        id: parse_uuid(&id)?,
        batch_id: parse_uuid(&batch_id)?,
        name: row.try_get("name")?,
        storage_key: row.try_get("storage_key")?,
        status: ProjectStatus::from_str(&status_text).unwrap_or(ProjectStatus::Pending),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

/// Insert a batch and its member projects, all PENDING. Membership is fixed
/// here; nothing later adds or removes projects.
pub async fn create_batch(
    pool: &SqlitePool,
    new: &NewBatch,
    projects: &[NewProject],
) -> Result<Batch, sqlx::Error> {
    let batch_id = Uuid::new_v4();
    let now = Utc::now();
    let tags_json = serde_json::to_string(&new.tags).unwrap_or_else(|_| "[]".to_string());

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO batches (id, name, tags, status, created_at, total, succeeded, failed,
                             continue_on_error, parallel_workers)
        VALUES (?, ?, ?, 'pending', ?, ?, 0, 0, ?, ?)
        "#,
    )
    .bind(batch_id.to_string())
    .bind(&new.name)
    .bind(&tags_json)
    .bind(now)
    .bind(projects.len() as i64)
    .bind(new.continue_on_error)
    .bind(new.parallel_workers as i64)
    .execute(&mut *tx)
    .await?;

    for project in projects {
        sqlx::query(
            r#"
            INSERT INTO projects (id, batch_id, name, storage_key, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(project.id.to_string())
        .bind(batch_id.to_string())
        .bind(&project.name)
        .bind(&project.storage_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(Batch {
        id: batch_id,
        name: new.name.clone(),
        tags: new.tags.clone(),
        status: BatchStatus::Pending,
        created_at: now,
        total: projects.len() as i64,
        succeeded: 0,
        failed: 0,
        continue_on_error: new.continue_on_error,
        parallel_workers: new.parallel_workers,
    })
}

pub async fn get_batch(pool: &SqlitePool, id: Uuid) -> Result<Option<Batch>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(batch_from_row).transpose()
}

pub async fn list_projects(
    pool: &SqlitePool,
    batch_id: Uuid,
) -> Result<Vec<Project>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM projects WHERE batch_id = ? ORDER BY created_at, id")
        .bind(batch_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.iter().map(project_from_row).collect()
}

pub async fn get_project(pool: &SqlitePool, id: Uuid) -> Result<Option<Project>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(project_from_row).transpose()
}

/// Claim a project for its worker: PENDING -> PROCESSING with a start time.
pub async fn mark_project_processing(
    pool: &SqlitePool,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE projects SET status = 'processing', started_at = ?, error = NULL WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a project's terminal outcome.
pub async fn mark_project_terminal(
    pool: &SqlitePool,
    id: Uuid,
    status: ProjectStatus,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE projects SET status = ?, completed_at = ?, error = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(error)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Recompute a batch's aggregate status and counts from its member projects.
/// Returns the new status and whether it changed.
pub async fn recompute_batch_status(
    pool: &SqlitePool,
    batch_id: Uuid,
) -> Result<(BatchStatus, bool), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let status_rows = sqlx::query("SELECT status FROM projects WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

    let statuses: Vec<ProjectStatus> = status_rows
        .iter()
        .map(|row| {
            let text: String = row.try_get("status")?;
            Ok(ProjectStatus::from_str(&text).unwrap_or(ProjectStatus::Pending))
        })
        .collect::<Result<_, sqlx::Error>>()?;

    let old_text: String = sqlx::query("SELECT status FROM batches WHERE id = ?")
        .bind(batch_id.to_string())
        .fetch_one(&mut *tx)
        .await?
        .try_get("status")?;
    let old = BatchStatus::from_str(&old_text).unwrap_or(BatchStatus::Pending);

    let new = aggregate_status(&statuses);
    let succeeded = statuses
        .iter()
        .filter(|&&s| s == ProjectStatus::Completed)
        .count() as i64;
    let failed = statuses
        .iter()
        .filter(|&&s| s == ProjectStatus::Failed)
        .count() as i64;

    sqlx::query("UPDATE batches SET status = ?, succeeded = ?, failed = ? WHERE id = ?")
        .bind(new.to_string())
        .bind(succeeded)
        .bind(failed)
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok((new, old != new))
}

/// Force a batch's aggregate status. Used when an early-stopped batch
/// resolves to PARTIAL/FAILED despite leftover PENDING members.
pub async fn set_batch_status(
    pool: &SqlitePool,
    batch_id: Uuid,
    status: BatchStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE batches SET status = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(batch_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a batch and its projects. Storage artifacts are the caller's
/// responsibility; row deletion cascades via the foreign key.
pub async fn delete_batch_rows(pool: &SqlitePool, batch_id: Uuid) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM projects WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM batches WHERE id = ?")
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Restart recovery: every PROCESSING project belongs to a worker that no
/// longer exists, so put it back in line. Returns the affected batch ids.
pub async fn reset_orphaned_processing(pool: &SqlitePool) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT DISTINCT batch_id FROM projects WHERE status = 'processing'",
    )
    .fetch_all(pool)
    .await?;

    let batch_ids: Vec<Uuid> = rows
        .iter()
        .map(|row| {
            let text: String = row.try_get("batch_id")?;
            parse_uuid(&text)
        })
        .collect::<Result<_, sqlx::Error>>()?;

    sqlx::query(
        "UPDATE projects SET status = 'pending', started_at = NULL WHERE status = 'processing'",
    )
    .execute(pool)
    .await?;

    Ok(batch_ids)
}

/// Terminal batches whose latest project activity predates `cutoff`. Feeds
/// the archival-eligibility report; never mutates anything.
pub async fn batches_inactive_since(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Batch>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT b.* FROM batches b
        WHERE b.status IN ('completed', 'partial', 'failed')
          AND COALESCE(
                (SELECT MAX(COALESCE(p.completed_at, p.created_at))
                 FROM projects p WHERE p.batch_id = b.id),
                b.created_at
              ) < ?
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}

/// Batches whose aggregate status is not yet terminal, for reconciliation.
pub async fn non_terminal_batches(pool: &SqlitePool) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query("SELECT id FROM batches WHERE status IN ('pending', 'processing')")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            let text: String = row.try_get("id")?;
            parse_uuid(&text)
        })
        .collect()
}
