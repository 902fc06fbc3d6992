//! Storage migration tool: copy artifacts between the local and object-store
//! backends, in either direction.

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use docbatch::config::AppConfig;
use docbatch::services::migration::{self, MigrationScope};
use docbatch::services::storage::{self, LocalBackend, StorageBackend};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Direction {
    /// Copy from the local backend to the object store.
    LocalToS3,
    /// Copy from the object store to the local backend.
    S3ToLocal,
}

#[derive(Parser, Debug)]
#[command(name = "migrate", about = "Copy stored artifacts between storage backends")]
struct Args {
    /// Migration direction.
    #[arg(value_enum)]
    direction: Direction,

    /// Restrict the migration to a single project id.
    #[arg(long)]
    project: Option<Uuid>,

    /// Enumerate and size without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Stop at the first per-key failure instead of collecting failures.
    #[arg(long)]
    fail_fast: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env().expect("Failed to load configuration");

    let local = LocalBackend::new(&config.storage_root);
    let object_store =
        storage::object_store_from_config(&config).expect("Failed to initialize object store");

    let (source, dest): (&dyn StorageBackend, &dyn StorageBackend) = match args.direction {
        Direction::LocalToS3 => (&local, &object_store),
        Direction::S3ToLocal => (&object_store, &local),
    };

    let scope = match args.project {
        Some(id) => MigrationScope::Project(id),
        None => MigrationScope::All,
    };

    let report = migration::migrate(source, dest, &scope, args.dry_run, args.fail_fast)
        .await
        .expect("Migration failed to enumerate the source");

    println!(
        "copied: {}  skipped: {}  failed: {}  bytes: {}",
        report.copied,
        report.skipped,
        report.failed.len(),
        report.bytes
    );
    for (key, error) in &report.failed {
        eprintln!("FAILED {key}: {error}");
    }

    if !report.failed.is_empty() {
        std::process::exit(1);
    }
}
