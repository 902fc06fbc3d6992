use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::batch::{MAX_WORKERS, MIN_WORKERS};
use crate::services::cron::CronExpr;

/// What causes a schedule to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Cron,
    Directory,
    S3,
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

/// Trigger-type-specific configuration, persisted as JSON on the schedule.
///
/// A cron schedule fires on its expression and scans its configured source at
/// that moment; directory and s3 schedules fire on a poll interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Cron {
        #[serde(default)]
        directory: Option<String>,
        #[serde(default)]
        recursive: bool,
        #[serde(default = "default_pattern")]
        pattern: String,
    },
    Directory {
        directory: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default = "default_poll_interval")]
        poll_interval_secs: u64,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default = "default_poll_interval")]
        poll_interval_secs: u64,
    },
}

impl TriggerConfig {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerConfig::Cron { .. } => TriggerType::Cron,
            TriggerConfig::Directory { .. } => TriggerType::Directory,
            TriggerConfig::S3 { .. } => TriggerType::S3,
        }
    }

    /// Seconds until the next evaluation for interval-driven triggers.
    /// Cron schedules compute their next run from the expression instead.
    pub fn poll_interval_secs(&self) -> Option<u64> {
        match self {
            TriggerConfig::Cron { .. } => None,
            TriggerConfig::Directory {
                poll_interval_secs, ..
            }
            | TriggerConfig::S3 {
                poll_interval_secs, ..
            } => Some(*poll_interval_secs),
        }
    }
}

/// Per-schedule notification settings. Flags select which terminal run
/// statuses produce a report; channels are all optional and independent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default)]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub notify_on_partial: bool,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub chat_webhook_url: Option<String>,
}

impl NotificationConfig {
    /// Whether the given final run status should be announced at all.
    pub fn wants(&self, status: RunStatus) -> bool {
        match status {
            RunStatus::Success => self.notify_on_success,
            RunStatus::Failed => self.notify_on_failure,
            RunStatus::Partial => self.notify_on_partial,
            RunStatus::Running => false,
        }
    }
}

/// Outcome of one schedule execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// A persisted automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub trigger_type: TriggerType,
    pub cron_expression: Option<String>,
    pub trigger_config: TriggerConfig,
    pub notification_config: NotificationConfig,
    pub enabled: bool,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub execution_count: i64,
    /// Worker concurrency for batches this schedule materializes (1-8).
    pub parallel_workers: u32,
    pub continue_on_error: bool,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit record of one schedule execution. Never mutated after the
/// run transitions out of RUNNING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: RunStatus,
    pub batch_id: Option<Uuid>,
    pub duration_ms: Option<i64>,
    pub files_found: i64,
    pub files_processed: i64,
    pub error: Option<String>,
}

/// Parameters for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expression: Option<String>,
    pub trigger_config: TriggerConfig,
    pub notification_config: NotificationConfig,
    pub enabled: bool,
    pub parallel_workers: u32,
    pub continue_on_error: bool,
}

impl NewSchedule {
    /// Reject malformed schedules synchronously at creation time.
    ///
    /// - CRON schedules require a valid 5-field expression; other trigger
    ///   types must not carry one.
    /// - parallel_workers must fall within 1..=8.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.trigger_config.trigger_type() {
            TriggerType::Cron => {
                let expr = self.cron_expression.as_deref().ok_or_else(|| {
                    EngineError::Validation(
                        "cron schedules require a cron expression".to_string(),
                    )
                })?;
                CronExpr::parse(expr)
                    .map_err(|e| EngineError::Validation(e.to_string()))?;
            }
            TriggerType::Directory | TriggerType::S3 => {
                if self.cron_expression.is_some() {
                    return Err(EngineError::Validation(
                        "cron expression is only valid for cron schedules".to_string(),
                    ));
                }
            }
        }

        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.parallel_workers) {
            return Err(EngineError::Validation(format!(
                "parallel_workers must be between {} and {}, got {}",
                MIN_WORKERS, MAX_WORKERS, self.parallel_workers
            )));
        }

        if let TriggerConfig::Directory { directory, .. } = &self.trigger_config {
            if directory.is_empty() {
                return Err(EngineError::Validation(
                    "directory trigger requires a directory path".to_string(),
                ));
            }
        }

        Ok(())
    }
}
