use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trackcache::cache::{DataCache, EntityKind, OwnerScope};
use trackcache::config::Config;
use trackcache::store::{Document, DocumentStore, SqliteStore};
use trackcache::tracker::TrackerData;

#[derive(Parser, Debug)]
#[command(name = "trackcache")]
#[command(about = "Exercise the tracker data cache against a local document store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/trackcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// SQLite document database (overrides store.path from the config)
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load documents from a JSON file shaped `{"<collection>": [{"id": ..}, ..]}`
  Seed { file: PathBuf },

  /// Print an owner's documents of one entity type, newest first
  List { owner: String, kind: EntityKind },

  /// Page through an owner's documents; Ctrl-C stops between pages
  Stream {
    owner: String,
    kind: EntityKind,
    #[arg(long)]
    page_size: Option<usize>,
  },

  /// Preload everything for an owner and print cache statistics
  Stats { owner: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(db) = args.db {
    config.store.path = Some(db);
  }

  let _guard = init_logging(config.log_file.as_deref())?;

  let store = Arc::new(SqliteStore::open(&config.store_path()?)?);
  let cache = DataCache::new(&config.cache);
  let shutdown = CancellationToken::new();
  let cleanup = cache.spawn_cleanup(config.cache.cleanup_interval(), shutdown.clone());

  let result = run(args.command, store, cache, &config).await;

  shutdown.cancel();
  if let Err(e) = cleanup.await {
    warn!(error = %e, "cleanup task ended abnormally");
  }
  result
}

async fn run(command: Command, store: Arc<SqliteStore>, cache: DataCache, config: &Config) -> Result<()> {
  match command {
    Command::Seed { file } => {
      let count = seed(store.as_ref(), &file).await?;
      println!("seeded {} documents from {}", count, file.display());
    }
    Command::List { owner, kind } => {
      let data = TrackerData::new(store, cache, config.paging.page_size);
      let docs = data.list(&OwnerScope::user(owner), kind).await?;
      for doc in docs.iter() {
        println!("{}", render(doc)?);
      }
    }
    Command::Stream {
      owner,
      kind,
      page_size,
    } => {
      let data = TrackerData::new(store, cache, config.paging.page_size);
      let query = data.page_query(&OwnerScope::user(owner), kind, page_size);

      let cancel = CancellationToken::new();
      let on_interrupt = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          on_interrupt.cancel();
        }
      });

      let mut stream = data.stream(query, cancel);
      let mut number = 0;
      while let Some(page) = stream.next().await {
        let page = page?;
        number += 1;
        println!(
          "# page {} ({} items, has_more: {})",
          number,
          page.items.len(),
          page.has_more
        );
        for doc in &page.items {
          println!("{}", render(doc)?);
        }
      }
      let query = stream.query();
      info!(
        owner = %query.owner,
        kind = %query.kind,
        pages = number,
        state = ?stream.state(),
        "stream ended"
      );
    }
    Command::Stats { owner } => {
      let data = TrackerData::new(store, cache, config.paging.page_size);
      let report = data.preload(&OwnerScope::user(owner)).await;
      for (kind, count) in &report.loaded {
        println!("{:<14} {}", kind, count);
      }
      for (kind, err) in &report.failed {
        let hint = if err.is_retryable() { " (retryable)" } else { "" };
        println!("{:<14} failed{}: {}", kind, hint, err);
      }

      let stats = data.cache().stats();
      println!("total_entries       {}", stats.total_entries);
      println!("valid_entries       {}", stats.valid_entries);
      println!("expired_entries     {}", stats.expired_entries);
      println!("pending_requests    {}", stats.pending_requests);
      println!("approx_memory_bytes {}", stats.approx_memory_bytes);
    }
  }
  Ok(())
}

/// Write every document of a `{"<collection>": [..]}` file into the store.
async fn seed(store: &dyn DocumentStore, file: &Path) -> Result<usize> {
  let contents = std::fs::read_to_string(file)
    .map_err(|e| eyre!("Failed to read seed file {}: {}", file.display(), e))?;
  let root: Value = serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse seed file {}: {}", file.display(), e))?;
  let Value::Object(collections) = root else {
    return Err(eyre!("Seed file must be a JSON object of collections"));
  };

  let mut count = 0;
  for (collection, docs) in collections {
    let Value::Array(docs) = docs else {
      return Err(eyre!("Collection {} must be an array", collection));
    };
    for doc in docs {
      let Value::Object(mut fields) = doc else {
        return Err(eyre!("Documents in {} must be objects", collection));
      };
      let id = match fields.remove("id") {
        Some(Value::String(id)) => id,
        _ => return Err(eyre!("Every document in {} needs a string id", collection)),
      };
      store.put(&collection, Document::new(id, fields)).await?;
      count += 1;
    }
  }
  Ok(count)
}

fn render(doc: &Document) -> Result<String> {
  let mut fields = doc.data.clone();
  fields.insert("id".to_string(), Value::from(doc.id.clone()));
  serde_json::to_string(&fields).map_err(|e| eyre!("Failed to render document {}: {}", doc.id, e))
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// level. The returned guard flushes file output on drop.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}
