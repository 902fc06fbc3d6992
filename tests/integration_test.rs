mod fixtures;
mod helpers;

use std::time::Duration;

use docbatch::db::queries;
use docbatch::error::EngineError;
use docbatch::events::StatusEvent;
use docbatch::models::batch::{BatchStatus, NewBatch};
use docbatch::models::project::ProjectStatus;
use docbatch::services::migration::{self, MigrationScope};
use docbatch::services::storage::{LocalBackend, StorageBackend};
use helpers::MockProcessor;
use tempfile::TempDir;

#[tokio::test]
async fn test_batch_runs_to_completed() {
    let env = helpers::test_env().await;
    let payload = fixtures::binary_payload();
    let (batch, project_ids) = env
        .make_batch(
            NewBatch::new("manual upload"),
            &[
                ("alpha.zip", payload.as_slice()),
                ("beta.zip", b"beta"),
                ("gamma.zip", b""),
            ],
        )
        .await;
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.total, 3);

    let finished = env.orchestrator.run_batch(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Completed);
    assert_eq!(finished.succeeded, 3);
    assert_eq!(finished.failed, 0);
    assert_eq!(env.processor.call_count(), 3);

    // Every project persisted its outputs next to the input artifact.
    for project_id in project_ids {
        let project = queries::get_project(&env.db, project_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.status, ProjectStatus::Completed);
        assert!(project.started_at.is_some());
        assert!(project.completed_at.is_some());
        let keys = env.storage.list(&project.scope()).await.unwrap();
        assert_eq!(keys.len(), 3, "input + two outputs, got {keys:?}");
        assert!(env
            .storage
            .exists(&project.output_key("report.json"))
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn test_one_failure_resolves_partial() {
    let env = helpers::test_env_with(MockProcessor::failing(&["bad.zip"])).await;
    let (batch, _) = env
        .make_batch(
            NewBatch::new("mixed"),
            &[("good.zip", b"ok".as_slice()), ("bad.zip", b"broken")],
        )
        .await;

    let finished = env.orchestrator.run_batch(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Partial);
    assert_eq!(finished.succeeded, 1);
    assert_eq!(finished.failed, 1);

    // The failing project carries enough detail to render the failure.
    let failed = queries::list_projects(&env.db, batch.id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.status == ProjectStatus::Failed)
        .unwrap();
    assert_eq!(failed.name, "bad.zip");
    assert!(failed.error.as_deref().unwrap().contains("bad.zip"));
}

#[tokio::test]
async fn test_all_failures_resolve_failed() {
    let env = helpers::test_env_with(MockProcessor::failing(&["a.zip", "b.zip"])).await;
    let (batch, _) = env
        .make_batch(
            NewBatch::new("doomed"),
            &[("a.zip", b"x".as_slice()), ("b.zip", b"y")],
        )
        .await;
    let finished = env.orchestrator.run_batch(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Failed);
    assert_eq!(finished.failed, 2);
}

#[tokio::test]
async fn test_stop_on_error_leaves_rest_pending() {
    let env = helpers::test_env_with(MockProcessor::failing(&["a.zip"])).await;
    let mut new = NewBatch::new("fail fast");
    new.continue_on_error = false;
    new.parallel_workers = 1;
    let (batch, _) = env
        .make_batch(
            new,
            &[
                ("a.zip", b"x".as_slice()),
                ("b.zip", b"y"),
                ("c.zip", b"z"),
            ],
        )
        .await;

    let finished = env.orchestrator.run_batch(batch.id).await.unwrap();

    let projects = queries::list_projects(&env.db, batch.id).await.unwrap();
    let pending: Vec<_> = projects
        .iter()
        .filter(|p| p.status == ProjectStatus::Pending)
        .map(|p| p.name.as_str())
        .collect();
    assert_eq!(pending, vec!["b.zip", "c.zip"]);
    assert_eq!(finished.status, BatchStatus::Partial);
    assert_eq!(env.processor.call_count(), 1);
}

#[tokio::test]
async fn test_delete_while_processing_is_conflict() {
    let env = helpers::test_env_with(MockProcessor::slow(Duration::from_millis(400))).await;
    let (batch, _) = env
        .make_batch(NewBatch::new("busy"), &[("slow.zip", b"x".as_slice())])
        .await;

    let orchestrator = env.orchestrator.clone();
    let batch_id = batch.id;
    let handle = tokio::spawn(async move { orchestrator.run_batch(batch_id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    match env.orchestrator.delete_batch(batch.id).await {
        Err(EngineError::Conflict(_)) => {}
        other => panic!("expected Conflict, got {other:?}"),
    }

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Completed);

    // Terminal batch deletes cleanly, artifacts included.
    env.orchestrator.delete_batch(batch.id).await.unwrap();
    assert!(queries::get_batch(&env.db, batch.id).await.unwrap().is_none());
    assert!(env.storage.list("projects/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_lets_inflight_finish() {
    let env = helpers::test_env_with(MockProcessor::slow(Duration::from_millis(300))).await;
    let mut new = NewBatch::new("cancelled");
    new.parallel_workers = 1;
    let (batch, _) = env
        .make_batch(
            new,
            &[
                ("first.zip", b"1".as_slice()),
                ("second.zip", b"2"),
                ("third.zip", b"3"),
            ],
        )
        .await;

    let orchestrator = env.orchestrator.clone();
    let batch_id = batch.id;
    let handle = tokio::spawn(async move { orchestrator.run_batch(batch_id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    env.orchestrator.cancel_batch(batch.id).await.unwrap();

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Partial);
    assert_eq!(finished.succeeded, 1);
    assert_eq!(finished.failed, 2);

    let cancelled: Vec<_> = queries::list_projects(&env.db, batch.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.error.as_deref() == Some("batch cancelled"))
        .collect();
    assert_eq!(cancelled.len(), 2);

    // Nothing to cancel once the batch is terminal.
    assert!(matches!(
        env.orchestrator.cancel_batch(batch.id).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_concurrent_batches_run_independently() {
    let env = helpers::test_env().await;
    let mut batch_ids = Vec::new();
    for i in 0..3 {
        let name = format!("wave-{i}.zip");
        let (batch, _) = env
            .make_batch(NewBatch::new(format!("wave {i}")), &[(name.as_str(), b"x".as_slice())])
            .await;
        batch_ids.push(batch.id);
    }

    let runs = batch_ids.iter().map(|id| env.orchestrator.run_batch(*id));
    for finished in futures::future::join_all(runs).await {
        let finished = finished.unwrap();
        assert_eq!(finished.status, BatchStatus::Completed);
        assert_eq!(finished.succeeded, 1);
    }
    assert_eq!(env.processor.call_count(), 3);
}

#[tokio::test]
async fn test_archive_candidates_by_inactivity() {
    let env = helpers::test_env().await;
    let (batch, _) = env
        .make_batch(NewBatch::new("old news"), &[("a.zip", b"payload".as_slice())])
        .await;
    env.orchestrator.run_batch(batch.id).await.unwrap();

    // Still pending: never eligible regardless of threshold.
    let (idle, _) = env
        .make_batch(NewBatch::new("not started"), &[("b.zip", b"y".as_slice())])
        .await;

    // Finished moments ago: eligible only at a zero-day threshold.
    let eligible = env.orchestrator.archive_candidates(0).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].0.id, batch.id);
    assert!(eligible[0].1 > 0, "footprint includes stored artifacts");
    assert!(eligible.iter().all(|(b, _)| b.id != idle.id));

    assert!(env.orchestrator.archive_candidates(30).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_batch_rejected() {
    let env = helpers::test_env().await;
    let result = env
        .orchestrator
        .create_batch(NewBatch::new("empty"), Vec::new())
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn test_reconcile_recovers_orphans() {
    let env = helpers::test_env().await;
    let (batch, project_ids) = env
        .make_batch(NewBatch::new("orphaned"), &[("a.zip", b"x".as_slice())])
        .await;

    // Simulate a crash mid-processing.
    sqlx::query("UPDATE projects SET status = 'processing' WHERE id = ?")
        .bind(project_ids[0].to_string())
        .execute(&env.db)
        .await
        .unwrap();
    sqlx::query("UPDATE batches SET status = 'processing' WHERE id = ?")
        .bind(batch.id.to_string())
        .execute(&env.db)
        .await
        .unwrap();

    env.orchestrator.reconcile().await.unwrap();

    let project = queries::get_project(&env.db, project_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(project.status, ProjectStatus::Pending);
    let batch = queries::get_batch(&env.db, batch.id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);

    // The recovered batch is runnable again.
    let finished = env.orchestrator.run_batch(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_status_events_emitted() {
    let env = helpers::test_env().await;
    let mut rx = env.events.subscribe();
    let (batch, _) = env
        .make_batch(NewBatch::new("observed"), &[("a.zip", b"x".as_slice())])
        .await;
    env.orchestrator.run_batch(batch.id).await.unwrap();

    let mut saw_processing = false;
    let mut saw_completed = false;
    while let Ok(event) = rx.try_recv() {
        if let StatusEvent::Batch { batch_id, status } = event {
            assert_eq!(batch_id, batch.id);
            match status {
                BatchStatus::Processing => saw_processing = true,
                BatchStatus::Completed => saw_completed = true,
                _ => {}
            }
        }
    }
    assert!(saw_processing && saw_completed);
}

#[tokio::test]
async fn test_migration_round_trip_preserves_bytes() {
    let source_dir = TempDir::new().unwrap();
    let dest_dir = TempDir::new().unwrap();
    let source = LocalBackend::new(source_dir.path());
    let dest = LocalBackend::new(dest_dir.path());

    let binary = fixtures::binary_payload();
    source
        .save("projects/p1/input/archive.bin", &binary)
        .await
        .unwrap();
    source.save("projects/p1/input/empty", b"").await.unwrap();
    for name in fixtures::sample_file_names() {
        source
            .save(&format!("projects/p1/input/{name}"), name.as_bytes())
            .await
            .unwrap();
    }

    // Dry run enumerates without writing.
    let dry = migration::migrate(&source, &dest, &MigrationScope::All, true, false)
        .await
        .unwrap();
    assert_eq!(dry.skipped, 5);
    assert_eq!(dry.copied, 0);
    assert!(dest.list("").await.unwrap().is_empty());

    let report = migration::migrate(&source, &dest, &MigrationScope::All, false, false)
        .await
        .unwrap();
    assert_eq!(report.copied, 5);
    assert!(report.failed.is_empty());

    // Byte-identical content and identical file count, both directions.
    assert_eq!(dest.list("").await.unwrap().len(), 5);
    assert_eq!(
        dest.get("projects/p1/input/archive.bin").await.unwrap(),
        binary
    );
    assert_eq!(dest.get("projects/p1/input/empty").await.unwrap(), b"");
    for name in fixtures::sample_file_names() {
        assert_eq!(
            dest.get(&format!("projects/p1/input/{name}")).await.unwrap(),
            name.as_bytes()
        );
    }

    // Re-running is idempotent.
    let again = migration::migrate(&source, &dest, &MigrationScope::All, false, false)
        .await
        .unwrap();
    assert_eq!(again.copied, 5);
}

/// Full local -> object store -> local round trip. Needs live credentials
/// via S3_* environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_migration_through_object_store() {
    let config = docbatch::config::AppConfig::from_env().expect("config");
    let object_store =
        docbatch::services::storage::object_store_from_config(&config).expect("object store");

    let source_dir = TempDir::new().unwrap();
    let back_dir = TempDir::new().unwrap();
    let source = LocalBackend::new(source_dir.path());
    let back = LocalBackend::new(back_dir.path());

    let binary = fixtures::binary_payload();
    source
        .save("projects/mig/input/archive.bin", &binary)
        .await
        .unwrap();
    source.save("projects/mig/input/empty", b"").await.unwrap();

    migration::migrate(&source, &object_store, &MigrationScope::All, false, false)
        .await
        .unwrap();
    migration::migrate(&object_store, &back, &MigrationScope::All, false, false)
        .await
        .unwrap();

    assert_eq!(
        back.get("projects/mig/input/archive.bin").await.unwrap(),
        binary
    );
    assert_eq!(back.get("projects/mig/input/empty").await.unwrap(), b"");

    for key in object_store.list("projects/mig/").await.unwrap() {
        object_store.delete(&key).await.unwrap();
    }
}
