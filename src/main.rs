use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pos_sync::api::ApiClient;
use pos_sync::cache::{prune, CacheStorage, SqliteStorage};
use pos_sync::config::Config;
use pos_sync::db::Database;
use pos_sync::manager::{CacheManager, InstallOutcome};
use pos_sync::outbox::OutboxStore;
use pos_sync::sync::{Connectivity, FlushOutcome, SyncCoordinator};
use pos_sync::upstream::Upstream;
use pos_sync::{logging, server};

#[derive(Parser, Debug)]
#[command(name = "pos-sync")]
#[command(about = "Offline-first caching proxy and outbox for the POS backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./pos-sync.yaml, then $XDG_CONFIG_HOME/pos-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin of the POS backend
  #[arg(long, global = true)]
  upstream: Option<String>,

  /// Address the proxy listens on
  #[arg(long, global = true)]
  listen: Option<String>,

  /// Directory holding state.db
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the proxy and the background sync loop
  Serve,
  /// Install this build's cache generation
  Install,
  /// Activate the waiting cache generation
  Activate,
  /// Replay the outbox once
  Flush,
  /// Evict the oldest entries of the active cache
  Prune {
    #[arg(long)]
    max_entries: Option<usize>,
  },
  /// Fetch URLs into the active cache
  Prefetch {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Show cache generations and outbox depth
  Status,
  /// List operations dropped by the outbox caps
  DeadLetters,
}

/// Everything the commands are built from.
struct Services {
  config: Config,
  storage: Arc<SqliteStorage>,
  outbox: OutboxStore,
  upstream: Upstream,
  connectivity: Connectivity,
  manager: Arc<CacheManager>,
  coordinator: Arc<SyncCoordinator>,
}

impl Services {
  fn build(config: Config) -> Result<Self> {
    let db_path = Database::default_path(config.data_dir.as_deref())?;
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Opened state database");

    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let outbox = OutboxStore::new(db);
    let upstream = Upstream::new(config.upstream.origin()?, config.upstream.timeout())?;
    let connectivity = Connectivity::new(true);

    let coordinator = SyncCoordinator::new(outbox.clone(), upstream.clone(), &config.sync)?
      .with_fallback_token(Config::get_api_token());
    let api = ApiClient::new(
      upstream.clone(),
      outbox.clone(),
      connectivity.clone(),
      &config.sync.forwarded_headers,
    )
    .with_flush_trigger(coordinator.flush_trigger());
    let manager = CacheManager::new(
      storage.clone(),
      upstream.clone(),
      api,
      connectivity.clone(),
      config.cache.clone(),
      &config.proxy,
    )?;

    Ok(Self {
      config,
      storage,
      outbox,
      upstream,
      connectivity,
      manager: Arc::new(manager),
      coordinator: Arc::new(coordinator),
    })
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init("info", args.log_dir.as_deref())?;

  // Load configuration, then apply command line overrides
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(upstream) = args.upstream {
    config.upstream.url = upstream;
  }
  if let Some(listen) = args.listen {
    config.proxy.listen = listen;
  }
  if let Some(data_dir) = args.data_dir {
    config.data_dir = Some(data_dir);
  }

  let services = Services::build(config)?;

  match args.command {
    Command::Serve => serve(services).await,
    Command::Install => {
      match services.manager.install().await? {
        InstallOutcome::Activated => println!("Installed and activated {}", services.config.cache.namespace()),
        InstallOutcome::Waiting => println!(
          "Installed {}; run `pos-sync activate` to switch over",
          services.config.cache.namespace()
        ),
        InstallOutcome::AlreadyInstalled(state) => {
          println!("{} is already installed ({})", services.config.cache.namespace(), state)
        }
      }
      Ok(())
    }
    Command::Activate => {
      match services.manager.skip_waiting()? {
        Some(outcome) => println!(
          "Activated {} (removed {} old generation(s))",
          outcome.namespace,
          outcome.removed.len()
        ),
        None => println!("No generation is waiting"),
      }
      Ok(())
    }
    Command::Flush => {
      match services.coordinator.flush().await? {
        FlushOutcome::Empty => println!("Outbox is empty"),
        FlushOutcome::AlreadyRunning => println!("A flush is already running"),
        FlushOutcome::Synced(report) => println!(
          "Synced {} operation(s) in {} batch(es): {} confirmed, {} rejected, {} dead-lettered",
          report.submitted, report.batches, report.removed, report.rejected, report.dead_lettered
        ),
        FlushOutcome::Failed { report, error } => {
          return Err(eyre!(
            "Flush failed after {} confirmed operation(s): {}",
            report.removed,
            error
          ))
        }
      }
      Ok(())
    }
    Command::Prune { max_entries } => {
      let namespace = services
        .manager
        .active_namespace()?
        .ok_or_else(|| eyre!("No active cache generation"))?;
      let max_entries = max_entries.unwrap_or(services.config.cache.api_max_entries);
      let report = prune(services.storage.as_ref(), &namespace, max_entries)?;
      println!(
        "Removed {} of {} entries from {} ({} failed)",
        report.removed, report.before, namespace, report.failed
      );
      Ok(())
    }
    Command::Prefetch { urls } => {
      let summary = services.manager.prefetch(&urls).await?;
      println!(
        "Cached {} of {} URL(s), {} failed",
        summary.done, summary.total, summary.failed
      );
      Ok(())
    }
    Command::Status => status(&services),
    Command::DeadLetters => {
      let letters = services.outbox.dead_letters()?;
      if letters.is_empty() {
        println!("No dead letters");
      }
      for letter in letters {
        println!(
          "#{} {} {} ({} attempt(s), dead since {}): {}",
          letter.item.id,
          letter.item.method,
          letter.item.url,
          letter.item.attempts,
          letter.dead_at.to_rfc3339(),
          letter.reason
        );
      }
      Ok(())
    }
  }
}

async fn serve(services: Services) -> Result<()> {
  let Services {
    config,
    upstream,
    connectivity,
    manager,
    coordinator,
    ..
  } = services;

  if let Some(probe_path) = &config.connectivity.probe_path {
    connectivity.spawn_probe(
      upstream.clone(),
      probe_path,
      Duration::from_secs(config.connectivity.probe_interval_secs.max(1)),
    )?;
  }
  tokio::spawn(coordinator.run(connectivity.clone(), config.sync.retry.policy()));

  // A failed install leaves the previous generation serving
  if let Err(e) = manager.install().await {
    warn!(error = %e, "Cache install failed; continuing with the current generation");
  }

  let listener = server::bind(&config.proxy.listen).await?;
  server::serve(listener, manager, &config.proxy.control_prefix, async {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
  })
  .await
}

fn status(services: &Services) -> Result<()> {
  println!("Upstream: {}", services.upstream.origin());
  println!("Generation: {}", services.config.cache.namespace());

  let namespaces = services.storage.namespaces()?;
  if namespaces.is_empty() {
    println!("No cache generations installed");
  }
  for namespace in namespaces {
    println!(
      "  {} [{}] {} entries, created {}",
      namespace.name,
      namespace.state,
      services.storage.count(&namespace.name)?,
      namespace.created_at.to_rfc3339()
    );
  }

  println!("Outbox: {} pending", services.outbox.len()?);
  println!("Dead letters: {}", services.outbox.dead_letters()?.len());
  Ok(())
}
