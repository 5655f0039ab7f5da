mod demo;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use qcache::cache::gc::spawn_sweeper;
use qcache::config::Config;
use qcache::market::{InMemoryBackend, MarketClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "qcache")]
#[command(about = "Optimistic query cache, demonstrated on an in-memory marketplace")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/qcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Viewer id (overrides QCACHE_USER_ID and the config file)
  #[arg(short, long, global = true)]
  user: Option<String>,

  /// Simulated backend latency
  #[arg(long, global = true)]
  latency_ms: Option<u64>,

  /// Reject the next N backend writes
  #[arg(long, global = true, default_value_t = 0)]
  fail_writes: u32,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Show all listings
  List {
    /// Print as JSON
    #[arg(long)]
    json: bool,
  },
  /// Toggle a like on a product
  Like { id: String },
  /// Edit a product as its seller
  Edit {
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    price: Option<f64>,
    /// Mark the product sold
    #[arg(long)]
    sold: bool,
  },
  /// List a new product for sale
  Create {
    title: String,
    price: f64,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    condition: Option<String>,
    #[arg(long)]
    location: Option<String>,
  },
  /// Delete a product as its seller
  Delete { id: String },
  /// Show the categories a product can be listed under
  Categories,
  /// Walk through optimistic updates, rollback and reconciliation
  Scenario,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(latency) = args.latency_ms {
    config.market.latency_ms = latency;
  }
  let viewer = args.user.or_else(|| config.user_id());

  let _log_guard = logging::init(&config.log)?;

  let backend = InMemoryBackend::new(config.market.products.clone())
    .with_latency(Duration::from_millis(config.market.latency_ms));
  backend.fail_next_writes(args.fail_writes);
  let client = MarketClient::new(
    Arc::new(backend.clone()),
    viewer,
    config.cache.store_config()?,
  );

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let sweepers = [
    spawn_sweeper(client.listings().clone(), config.cache.gc_interval(), shutdown_rx.clone()),
    spawn_sweeper(client.details().clone(), config.cache.gc_interval(), shutdown_rx.clone()),
    spawn_sweeper(client.category_store().clone(), config.cache.gc_interval(), shutdown_rx),
  ];

  let result = demo::run(args.command.unwrap_or(Command::Scenario), &client, &backend).await;

  let _ = shutdown_tx.send(true);
  for sweeper in sweepers {
    let evicted = sweeper.await?;
    debug!(evicted, "sweeper stopped");
  }

  result
}
