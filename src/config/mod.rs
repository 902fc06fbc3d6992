use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// SQLite connection string for engine state (batches, schedules, ledger).
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Active storage backend: "local" or "s3".
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Root directory for the local storage backend.
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    /// Object store bucket name (S3 backend and migration tool).
    pub s3_bucket: Option<String>,

    /// Object store endpoint URL (S3-compatible).
    pub s3_endpoint: Option<String>,

    /// Object store access key ID.
    pub s3_access_key: Option<String>,

    /// Object store secret access key.
    pub s3_secret_key: Option<String>,

    /// Base URL of the external extraction service.
    #[serde(default = "default_extractor_url")]
    pub extractor_url: String,

    /// Bearer token for the extraction service, if it requires one.
    pub extractor_api_token: Option<String>,

    /// Default worker concurrency for batches that do not specify one (1-8).
    #[serde(default = "default_parallel_workers")]
    pub default_parallel_workers: u32,

    /// Trigger engine tick interval in seconds.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Days of inactivity before a project is eligible for archival.
    #[serde(default = "default_archive_inactivity_days")]
    pub archive_inactivity_days: i64,

    /// Email gateway endpoint for notification delivery (HTTP API).
    pub email_api_url: Option<String>,

    /// Bearer token for the email gateway.
    pub email_api_token: Option<String>,
}

fn default_database_url() -> String {
    "sqlite://docbatch.db?mode=rwc".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data".to_string()
}

fn default_extractor_url() -> String {
    "http://localhost:8600".to_string()
}

fn default_parallel_workers() -> u32 {
    4
}

fn default_tick_interval_secs() -> u64 {
    15
}

fn default_archive_inactivity_days() -> i64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
