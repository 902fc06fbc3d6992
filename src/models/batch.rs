use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::project::ProjectStatus;

/// Bounds on per-batch worker concurrency.
pub const MIN_WORKERS: u32 = 1;
pub const MAX_WORKERS: u32 = 8;

/// Aggregate status of a batch, derived from its member project statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed
        )
    }
}

/// A named group of projects created together. Membership is immutable after
/// creation; deleting a batch cascades to its projects and their artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub tags: Vec<String>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub continue_on_error: bool,
    pub parallel_workers: u32,
}

/// Parameters for creating a batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub name: String,
    pub tags: Vec<String>,
    pub continue_on_error: bool,
    pub parallel_workers: u32,
}

impl NewBatch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            continue_on_error: true,
            parallel_workers: 4,
        }
    }
}

/// Clamp a requested worker count into the allowed 1..=8 range.
pub fn clamp_workers(requested: u32) -> u32 {
    requested.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Aggregate status function over member project statuses.
///
/// Rules, evaluated in order:
/// - any project PROCESSING -> PROCESSING
/// - all projects COMPLETED -> COMPLETED
/// - all projects FAILED -> FAILED
/// - only COMPLETED and FAILED remain -> PARTIAL
/// - otherwise (some PENDING, none PROCESSING) -> PENDING
pub fn aggregate_status(statuses: &[ProjectStatus]) -> BatchStatus {
    let any = |s: ProjectStatus| statuses.iter().any(|&p| p == s);
    let all = |s: ProjectStatus| statuses.iter().all(|&p| p == s);

    if any(ProjectStatus::Processing) {
        BatchStatus::Processing
    } else if !statuses.is_empty() && all(ProjectStatus::Completed) {
        BatchStatus::Completed
    } else if !statuses.is_empty() && all(ProjectStatus::Failed) {
        BatchStatus::Failed
    } else if statuses.iter().all(|p| p.is_terminal()) && !statuses.is_empty() {
        BatchStatus::Partial
    } else {
        BatchStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProjectStatus::*;

    #[test]
    fn test_any_processing_wins() {
        assert_eq!(
            aggregate_status(&[Completed, Processing, Failed]),
            BatchStatus::Processing
        );
        assert_eq!(aggregate_status(&[Processing]), BatchStatus::Processing);
        assert_eq!(
            aggregate_status(&[Pending, Processing]),
            BatchStatus::Processing
        );
    }

    #[test]
    fn test_all_completed() {
        assert_eq!(aggregate_status(&[Completed]), BatchStatus::Completed);
        assert_eq!(
            aggregate_status(&[Completed, Completed, Completed]),
            BatchStatus::Completed
        );
    }

    #[test]
    fn test_all_failed() {
        assert_eq!(aggregate_status(&[Failed]), BatchStatus::Failed);
        assert_eq!(aggregate_status(&[Failed, Failed]), BatchStatus::Failed);
    }

    #[test]
    fn test_mixed_terminal_is_partial() {
        assert_eq!(
            aggregate_status(&[Completed, Failed]),
            BatchStatus::Partial
        );
        assert_eq!(
            aggregate_status(&[Failed, Completed, Completed]),
            BatchStatus::Partial
        );
    }

    #[test]
    fn test_pending_remainder() {
        assert_eq!(aggregate_status(&[Pending]), BatchStatus::Pending);
        assert_eq!(
            aggregate_status(&[Completed, Pending]),
            BatchStatus::Pending
        );
        assert_eq!(aggregate_status(&[Failed, Pending]), BatchStatus::Pending);
    }

    /// Exhaustive check over every terminal-status multiset for batch sizes
    /// 1 through 5: the aggregate must be COMPLETED when everything
    /// completed, FAILED when everything failed, PARTIAL for any mix.
    #[test]
    fn test_terminal_multisets_sizes_1_to_5() {
        for size in 1usize..=5 {
            // Each project is either Completed or Failed; iterate bitmasks.
            for mask in 0u32..(1 << size) {
                let statuses: Vec<ProjectStatus> = (0..size)
                    .map(|i| {
                        if mask & (1 << i) != 0 {
                            Failed
                        } else {
                            Completed
                        }
                    })
                    .collect();
                let failed = statuses.iter().filter(|&&s| s == Failed).count();
                let expected = if failed == 0 {
                    BatchStatus::Completed
                } else if failed == size {
                    BatchStatus::Failed
                } else {
                    BatchStatus::Partial
                };
                assert_eq!(
                    aggregate_status(&statuses),
                    expected,
                    "size={} mask={:b}",
                    size,
                    mask
                );
            }
        }
    }

    #[test]
    fn test_clamp_workers() {
        assert_eq!(clamp_workers(0), 1);
        assert_eq!(clamp_workers(1), 1);
        assert_eq!(clamp_workers(5), 5);
        assert_eq!(clamp_workers(8), 8);
        assert_eq!(clamp_workers(64), 8);
    }
}
