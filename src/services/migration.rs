use uuid::Uuid;

use crate::models::project::project_scope;
use crate::services::storage::{StorageBackend, StorageError};

/// Which keys a migration covers.
#[derive(Debug, Clone)]
pub enum MigrationScope {
    All,
    Project(Uuid),
}

impl MigrationScope {
    fn prefix(&self) -> String {
        match self {
            MigrationScope::All => String::new(),
            MigrationScope::Project(id) => project_scope(*id),
        }
    }
}

/// Outcome of a migration pass.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub copied: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
    pub bytes: u64,
}

/// Copy every key in scope from `source` to `dest`.
///
/// Copies are idempotent and never diffed; re-running recopies. Per-key
/// failures are collected, not raised, unless `fail_fast` is set. Dry-run
/// performs the full enumeration and size calculation without writing.
pub async fn migrate(
    source: &dyn StorageBackend,
    dest: &dyn StorageBackend,
    scope: &MigrationScope,
    dry_run: bool,
    fail_fast: bool,
) -> Result<MigrationReport, StorageError> {
    let prefix = scope.prefix();
    // Failure to enumerate the source is fatal; everything past this point
    // is collected per key.
    let keys = source.list(&prefix).await?;
    let mut report = MigrationReport::default();

    if dry_run {
        report.bytes = source.size_of(&prefix).await?;
        report.skipped = keys.len();
        tracing::info!(
            keys = report.skipped,
            bytes = report.bytes,
            "dry run: nothing written"
        );
        return Ok(report);
    }

    for key in keys {
        match copy_key(source, dest, &key).await {
            Ok(len) => {
                report.copied += 1;
                report.bytes += len;
                tracing::debug!(key = %key, bytes = len, "copied");
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "copy failed");
                report.failed.push((key, e.to_string()));
                if fail_fast {
                    break;
                }
            }
        }
    }

    tracing::info!(
        copied = report.copied,
        failed = report.failed.len(),
        bytes = report.bytes,
        "migration finished"
    );
    Ok(report)
}

async fn copy_key(
    source: &dyn StorageBackend,
    dest: &dyn StorageBackend,
    key: &str,
) -> Result<u64, StorageError> {
    let data = source.get(key).await?;
    let len = data.len() as u64;
    dest.save(key, &data).await?;
    Ok(len)
}
