//! Shared harness for integration tests: a temp-dir database and local
//! storage backend plus a scripted stand-in for the extraction service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use docbatch::app_state::AppState;
use docbatch::db;
use docbatch::events::EventBus;
use docbatch::models::batch::{Batch, NewBatch};
use docbatch::models::project::NewProject;
use docbatch::services::notify::Notifier;
use docbatch::services::orchestrator::Orchestrator;
use docbatch::services::processor::{
    OutputArtifact, ProcessingOptions, Processor, ProcessorError,
};
use docbatch::services::storage::{LocalBackend, StorageBackend};

/// Extraction service stand-in. Fails for configured source names, can
/// delay to keep batches in PROCESSING, and counts invocations.
#[derive(Default)]
pub struct MockProcessor {
    pub fail_names: HashSet<String>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl MockProcessor {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            fail_names: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for MockProcessor {
    async fn process(
        &self,
        input: &[u8],
        options: &ProcessingOptions,
    ) -> Result<Vec<OutputArtifact>, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_names.contains(&options.source_name) {
            return Err(ProcessorError::Service(format!(
                "extraction rejected {}",
                options.source_name
            )));
        }
        Ok(vec![
            OutputArtifact {
                name: "report.json".to_string(),
                bytes: format!("{{\"source\":\"{}\"}}", options.source_name).into_bytes(),
            },
            OutputArtifact {
                name: "summary.txt".to_string(),
                bytes: format!("{} bytes processed", input.len()).into_bytes(),
            },
        ])
    }
}

pub struct TestEnv {
    pub tmp: TempDir,
    pub db: SqlitePool,
    pub storage: Arc<dyn StorageBackend>,
    pub processor: Arc<MockProcessor>,
    pub orchestrator: Orchestrator,
    pub events: EventBus,
}

/// Build a complete engine against a fresh temp directory.
pub async fn test_env_with(processor: MockProcessor) -> TestEnv {
    let tmp = TempDir::new().expect("tempdir");
    let db_path = tmp.path().join("engine.db");
    let db = db::init_pool(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await
        .expect("open database");
    db::run_migrations(&db).await.expect("run migrations");

    let storage: Arc<dyn StorageBackend> =
        Arc::new(LocalBackend::new(tmp.path().join("storage")));
    let processor = Arc::new(processor);

    let state = AppState::new(
        db.clone(),
        Arc::clone(&storage),
        processor.clone() as Arc<dyn Processor>,
        Notifier::new(None, None),
    );

    TestEnv {
        tmp,
        db,
        storage,
        processor,
        orchestrator: state.orchestrator,
        events: state.events,
    }
}

pub async fn test_env() -> TestEnv {
    test_env_with(MockProcessor::default()).await
}

impl TestEnv {
    /// Upload inputs and create a PENDING batch over them.
    pub async fn make_batch(
        &self,
        new: NewBatch,
        files: &[(&str, &[u8])],
    ) -> (Batch, Vec<Uuid>) {
        let mut projects = Vec::new();
        for (name, bytes) in files {
            let project = NewProject::new(*name);
            self.storage
                .save(&project.storage_key, bytes)
                .await
                .expect("upload input");
            projects.push(project);
        }
        let ids = projects.iter().map(|p| p.id).collect();
        let batch = self
            .orchestrator
            .create_batch(new, projects)
            .await
            .expect("create batch");
        (batch, ids)
    }
}
