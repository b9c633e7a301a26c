use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use koinonia::cache::{CacheValue, Fetcher, PartitionKey};
use koinonia::clock::SystemClock;
use koinonia::config::Config;
use koinonia::identity::SessionIdentity;
use koinonia::reconcile::SessionRecord;
use koinonia::storage::{DurableStore, KeyValueStore, SqliteStore};
use koinonia::{SyncEngine, SyncError, SyncResult};

#[derive(Parser, Debug)]
#[command(name = "koinonia")]
#[command(about = "Inspect and maintain the community client's offline cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/koinonia/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List the persisted partitions of an identity
  Inspect {
    /// Signed-in user; omit for the anonymous scope
    #[arg(short, long)]
    identity: Option<String>,
  },
  /// Run startup reconciliation against the on-disk cache
  Reconcile {
    #[arg(short, long)]
    identity: Option<String>,
  },
  /// Delete persisted snapshots
  Purge {
    /// Only this identity's snapshot; everything when omitted
    #[arg(short, long)]
    identity: Option<String>,
  },
}

/// The operator tool never talks to the server.
struct Offline;

impl Fetcher for Offline {
  fn fetch(&self, key: &PartitionKey, _page: u32) -> BoxFuture<'static, SyncResult<CacheValue>> {
    let err = SyncError::network(format!("offline, not fetching {}", key));
    Box::pin(async move { Err(err) })
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.storage_path()?;
  let kv: Arc<dyn KeyValueStore> =
    Arc::new(SqliteStore::open(&db_path)?.with_quota(config.storage.quota_bytes));
  let _guard = init_logging(&db_path)?;
  let options = config.engine_options()?;
  let clock = Arc::new(SystemClock);

  match args.command {
    Command::Inspect { identity } => {
      let durable = DurableStore::new(kv.clone(), clock, options.ttl);
      inspect(&durable, kv.as_ref(), identity.as_deref())?;
    }
    Command::Reconcile { identity } => {
      let engine = SyncEngine::start(
        Arc::new(Offline),
        kv,
        Arc::new(SessionIdentity::new(identity.as_deref())),
        clock,
        config.collections()?,
        options,
      );
      engine.flush();
      println!("{:?}", engine.startup());
    }
    Command::Purge { identity } => {
      let durable = DurableStore::new(kv, clock, options.ttl);
      match identity {
        Some(identity) => {
          durable
            .clear(Some(&identity))
            .map_err(|e| eyre!("Failed to clear snapshot for {}: {}", identity, e))?;
          println!("cleared snapshot for {}", identity);
        }
        None => {
          let count = durable
            .snapshot_keys()
            .map_err(|e| eyre!("Failed to list snapshots: {}", e))?
            .len();
          durable
            .clear_all()
            .map_err(|e| eyre!("Failed to clear snapshots: {}", e))?;
          println!("cleared {} snapshot(s)", count);
        }
      }
    }
  }

  Ok(())
}

fn inspect(durable: &DurableStore, kv: &dyn KeyValueStore, identity: Option<&str>) -> Result<()> {
  let record = SessionRecord::load(kv);
  println!(
    "recorded identity: {}",
    record.stored_identity().unwrap_or("-")
  );
  if let Some(last_open) = record.last_open {
    println!("last opened:       {}", last_open.to_rfc3339());
  }

  let keys = durable
    .snapshot_keys()
    .map_err(|e| eyre!("Failed to list snapshots: {}", e))?;
  println!("snapshots:         {}", keys.join(", "));

  let Some(snapshot) = durable.load(identity) else {
    println!("no usable snapshot for {}", identity.unwrap_or("-"));
    return Ok(());
  };
  println!(
    "snapshot saved {} with {} partition(s)",
    snapshot.timestamp.to_rfc3339(),
    snapshot.partitions.len()
  );
  for partition in &snapshot.partitions {
    let fetched = partition
      .entry
      .fetched_at
      .map(|at| at.to_rfc3339())
      .unwrap_or_else(|| "-".to_string());
    println!(
      "  {:<48} {:?} {} entities, fetched {}",
      partition.key.canonical(),
      partition.entry.status,
      partition.entry.value.entities().count(),
      fetched
    );
  }
  Ok(())
}

/// Log to a daily file next to the cache database, filtered by RUST_LOG.
fn init_logging(db_path: &Path) -> Result<WorkerGuard> {
  let log_dir = db_path
    .parent()
    .ok_or_else(|| eyre!("Cache path has no parent directory: {}", db_path.display()))?;
  let appender = tracing_appender::rolling::daily(log_dir, "koinonia.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("koinonia=info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  info!(db = %db_path.display(), "koinonia starting");
  Ok(guard)
}
