use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mirrorsync::{
    Collection, ConnectivityMonitor, DurabilityMode, HttpRemoteAuthority, InMemoryRemoteAuthority,
    LocalStore, MirrorStore, OfflineSync, OutboxLog, ReconcileOutcome, SyncConfig, web,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_DATA_DIR: &str = ".mirrorsync";

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "Inspect and drain an offline mirror and its outbox")]
struct Cli {
    /// Directory holding the journal and snapshot
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// JSON sync configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record counts, pending entries and dead letters
    Status,
    /// List pending outbox entries in sequence order
    Outbox,
    DeadLetters,
    /// Put a dead-lettered entry back in the outbox
    Requeue { sequence: u64 },
    /// Drop a dead-lettered entry for good
    Discard { sequence: u64 },
    /// Run one reconciliation pass against a remote
    Sync {
        #[arg(long)]
        remote: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Pull-and-merge one collection, or all of them
    Refresh {
        #[arg(long)]
        remote: String,
        #[arg(long)]
        token: Option<String>,
        collection: Option<String>,
    },
    /// Serve an in-memory Remote Authority over HTTP
    ServeMock {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let Cli {
        data_dir,
        config,
        command,
    } = Cli::parse();
    let load = || load_config(config.as_ref(), data_dir.as_ref());

    match command {
        Command::Status => status(&load()?),
        Command::Outbox => list_outbox(&load()?),
        Command::DeadLetters => list_dead_letters(&load()?),
        Command::Requeue { sequence } => requeue(&load()?, sequence),
        Command::Discard { sequence } => discard(&load()?, sequence),
        Command::Sync { remote, token } => sync_once(load()?, &remote, token.as_deref()).await,
        Command::Refresh {
            remote,
            token,
            collection,
        } => refresh(load()?, &remote, token.as_deref(), collection.as_deref()).await,
        Command::ServeMock { addr } => serve_mock(addr).await,
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mirrorsync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>, data_dir: Option<&PathBuf>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => SyncConfig::new(DEFAULT_DATA_DIR),
    };
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir.clone());
    }
    if config.data_dir.is_none() {
        config.data_dir = Some(PathBuf::from(DEFAULT_DATA_DIR));
    }
    if config.durability == DurabilityMode::None {
        config.durability = DurabilityMode::Async;
    }
    config.validate().context("Invalid sync configuration")?;
    Ok(config)
}

fn open_store(config: &SyncConfig) -> Result<LocalStore> {
    let dir = config
        .data_dir
        .as_ref()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();
    LocalStore::open(config).with_context(|| format!("Failed to open local store at '{}'", dir))
}

fn open_sync(config: SyncConfig, remote: &str, token: Option<&str>) -> Result<OfflineSync> {
    let mut http = HttpRemoteAuthority::new(remote, config.request_timeout_duration())
        .with_context(|| format!("Invalid remote '{}'", remote))?;
    if let Some(token) = token {
        http = http.with_bearer_token(token);
    }
    OfflineSync::open(config, Arc::new(http), ConnectivityMonitor::new(true))
        .context("Failed to open offline sync")
}

fn status(config: &SyncConfig) -> Result<()> {
    let store = open_store(config)?;
    let mirror = MirrorStore::new(store.clone());
    let outbox = OutboxLog::new(store);

    println!("Records:");
    for collection in Collection::ALL {
        println!("  {:<12} {}", collection.as_str(), mirror.len(collection)?);
    }
    println!("Pending entries: {}", outbox.len()?);
    println!("Dead letters:    {}", outbox.dead_letters()?.len());
    Ok(())
}

fn list_outbox(config: &SyncConfig) -> Result<()> {
    let outbox = OutboxLog::new(open_store(config)?);
    let entries = outbox.peek_all()?;
    if entries.is_empty() {
        println!("Outbox is empty");
        return Ok(());
    }
    for entry in entries {
        println!(
            "#{:<6} {:<7} {:<11} {:<40} {}",
            entry.sequence,
            entry.operation.to_string(),
            entry.collection.to_string(),
            entry.identity.to_string(),
            entry.enqueued_at.to_rfc3339()
        );
    }
    Ok(())
}

fn list_dead_letters(config: &SyncConfig) -> Result<()> {
    let outbox = OutboxLog::new(open_store(config)?);
    let dead_letters = outbox.dead_letters()?;
    if dead_letters.is_empty() {
        println!("No dead letters");
        return Ok(());
    }
    for dead in dead_letters {
        let status = dead
            .status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{:<6} {:<7} {:<11} {:<40} [{}] {}",
            dead.entry.sequence,
            dead.entry.operation.to_string(),
            dead.entry.collection.to_string(),
            dead.entry.identity.to_string(),
            status,
            dead.reason
        );
    }
    Ok(())
}

fn requeue(config: &SyncConfig, sequence: u64) -> Result<()> {
    let store = open_store(config)?;
    let outcome = OutboxLog::new(store.clone())
        .requeue_dead_letter(sequence)
        .with_context(|| format!("Failed to requeue dead letter #{}", sequence))?;
    store.checkpoint()?;
    match outcome.sequence() {
        Some(new_sequence) => println!("Requeued #{} as #{}", sequence, new_sequence),
        None => println!("Requeued #{}; it cancelled its unconfirmed record", sequence),
    }
    Ok(())
}

fn discard(config: &SyncConfig, sequence: u64) -> Result<()> {
    let store = open_store(config)?;
    let dead = OutboxLog::new(store.clone())
        .discard_dead_letter(sequence)
        .with_context(|| format!("Failed to discard dead letter #{}", sequence))?;
    store.checkpoint()?;
    println!(
        "Discarded #{} ({} {} {})",
        sequence, dead.entry.operation, dead.entry.collection, dead.entry.identity
    );
    Ok(())
}

async fn sync_once(config: SyncConfig, remote: &str, token: Option<&str>) -> Result<()> {
    let sync = open_sync(config, remote, token)?;
    let outcome = sync.reconcile().await.context("Reconciliation failed")?;
    match &outcome {
        ReconcileOutcome::Completed(report) => {
            println!("Attempted:    {}", report.attempted);
            println!("Reconciled:   {}", report.reconciled);
            println!("Transient:    {}", report.transient_failures);
            println!("Dead-letter:  {}", report.dead_lettered);
            println!("Retained:     {}", report.retained);
            println!("Blocked:      {}", report.blocked);
            println!("Remaining:    {}", report.remaining);
        }
        ReconcileOutcome::Skipped => println!("Another pass is running"),
        ReconcileOutcome::Offline => println!("Offline; nothing sent"),
    }
    sync.shutdown().await?;
    Ok(())
}

async fn refresh(
    config: SyncConfig,
    remote: &str,
    token: Option<&str>,
    collection: Option<&str>,
) -> Result<()> {
    let sync = open_sync(config, remote, token)?;
    match collection {
        Some(raw) => {
            let collection: Collection = raw.parse()?;
            let records = sync
                .refresh(collection)
                .await
                .with_context(|| format!("Failed to refresh {}", collection))?;
            println!("{:<12} {} records", collection.as_str(), records.len());
        }
        None => {
            for (collection, result) in sync.refresh_all().await {
                match result {
                    Ok(records) => println!("{:<12} {} records", collection.as_str(), records.len()),
                    Err(err) => println!("{:<12} failed: {}", collection.as_str(), err),
                }
            }
        }
    }
    sync.shutdown().await?;
    Ok(())
}

async fn serve_mock(addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "mock Remote Authority listening");
    axum::serve(listener, web::router(InMemoryRemoteAuthority::new()))
        .await
        .context("Mock server failed")?;
    Ok(())
}
