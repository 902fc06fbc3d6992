use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle status of a single project within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }
}

/// One input artifact and its processing outcome. Membership in a batch is
/// fixed at creation; only the worker that owns the project mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub name: String,
    pub storage_key: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Project {
    /// Storage prefix under which all of this project's artifacts live.
    pub fn scope(&self) -> String {
        project_scope(self.id)
    }

    /// Storage key for a named output artifact of this project.
    pub fn output_key(&self, artifact_name: &str) -> String {
        format!("{}output/{}", self.scope(), artifact_name)
    }
}

/// Storage prefix for a project id (trailing slash included).
pub fn project_scope(id: Uuid) -> String {
    format!("projects/{}/", id)
}

/// Storage key for a project's input artifact.
pub fn input_key(id: Uuid, file_name: &str) -> String {
    format!("{}input/{}", project_scope(id), file_name)
}

/// A project to be created as part of a new batch. The id is allocated by the
/// caller so that the input artifact can be uploaded under the project scope
/// before the database row exists.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: Uuid,
    pub name: String,
    pub storage_key: String,
}

impl NewProject {
    pub fn new(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let name = name.into();
        let storage_key = input_key(id, &name);
        Self { id, name, storage_key }
    }
}
