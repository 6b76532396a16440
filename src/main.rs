use anyhow::{Context, Result};
use chatlink::cli::{Args, ConfigDiscovery, ExecutionMode, LoadedConfig, RunConfig, StoreConfig};
use chatlink::transport::{BatchKind, MemoryTransport, PairingMode, Transport};
use chatlink::{ChatService, CredentialStore, LifecycleNotice, builtin_registry};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Chat id used for lines typed into the console session
const CONSOLE_CHAT_ID: &str = "console@s.chat";

/// How long the console transport waits before pairing a shown handshake
const CONSOLE_PAIRING_DELAY: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let default_level = if mode.verbose() {
        "chatlink=debug"
    } else {
        "chatlink=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let result = match mode {
        ExecutionMode::Run(config) => run_service(config).await,
        ExecutionMode::Backup(store) => run_backup(store).await,
        ExecutionMode::ListBackups(store) => list_backups(store).await,
        ExecutionMode::Restore { store, snapshot_id } => restore(store, &snapshot_id).await,
        ExecutionMode::Wipe(store) => wipe(store).await,
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(
    config_override: Option<&std::path::Path>,
    credentials_dir: Option<std::path::PathBuf>,
) -> Result<LoadedConfig> {
    let mut loaded = ConfigDiscovery::load(config_override).context("Failed to load configuration")?;
    if let Some(dir) = credentials_dir {
        loaded.config.credentials_dir = dir;
    }
    info!("Using configuration from {}", loaded.source);
    Ok(loaded)
}

fn open_store(store: &StoreConfig) -> Result<CredentialStore> {
    let loaded = load_config(store.config_override.as_deref(), store.credentials_dir.clone())?;
    loaded.config.open_store()
}

async fn run_service(run: RunConfig) -> Result<i32> {
    let mut loaded = load_config(run.config_override.as_deref(), run.credentials_dir)?;
    if let Some(prefix) = run.prefix {
        loaded.config.command_prefix = prefix;
    }
    let config = loaded.config;
    let prefix = config.command_prefix.clone();

    let transport = Arc::new(MemoryTransport::new().with_pairing(PairingMode::Handshake {
        auto_pair_after: Some(CONSOLE_PAIRING_DELAY),
    }));
    let mut service = ChatService::start(
        config,
        transport.clone() as Arc<dyn Transport>,
        builtin_registry(),
    )
    .await?;

    let notices = tokio::spawn(print_notices(service.controller().clone()));
    let console = tokio::spawn(run_console(transport.clone()));

    println!("Type {}help and press enter to try a command. Ctrl+C stops the service.", prefix);

    let code = tokio::select! {
        result = service.wait() => match result {
            Ok(()) => 0,
            Err(e) => {
                error!("Session manager stopped: {:#}", e);
                1
            }
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Interrupt received");
            0
        }
    };

    console.abort();
    notices.abort();
    if let Err(e) = service.shutdown().await {
        error!("Shutdown finished with an error: {:#}", e);
        return Ok(1);
    }
    Ok(code)
}

async fn print_notices(controller: chatlink::SessionController) {
    let mut notices = controller.subscribe();
    loop {
        match notices.recv().await {
            Ok(LifecycleNotice::HandshakeReady { count }) => {
                if let Some(artifact) = controller.status().handshake_artifact {
                    println!("Pair this device (handshake #{}): {}", count, artifact);
                }
            }
            Ok(LifecycleNotice::Connected { .. }) => println!("Session connected"),
            Ok(LifecycleNotice::GaveUp { reason }) => {
                println!("Reconnection abandoned: {}", reason)
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} lifecycle notices", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Feed stdin lines into the session and echo whatever the service sends back
async fn run_console(transport: Arc<MemoryTransport>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut flush = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !transport.deliver_text(CONSOLE_CHAT_ID, &line, BatchKind::Notify).await {
                        println!("(no live session, message dropped)");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    break;
                }
            },
            _ = flush.tick() => {
                for sent in transport.take_sent_messages() {
                    match sent.payload.as_text() {
                        Some(text) => println!("> {}", text),
                        None => println!("> [{:?}]", sent.payload),
                    }
                }
            }
        }
    }
}

async fn run_backup(store: StoreConfig) -> Result<i32> {
    let loaded = load_config(store.config_override.as_deref(), store.credentials_dir.clone())?;
    let retention = loaded.config.backup.retention;
    let store = loaded.config.open_store()?;

    let cycle = chatlink::credentials::run_backup_cycle(&store, retention).await?;
    match cycle.snapshot {
        Some(snapshot) => println!("Created snapshot {}", snapshot.id),
        None => println!("No credentials to back up"),
    }
    if cycle.evicted > 0 {
        println!("Removed {} old snapshot(s)", cycle.evicted);
    }
    Ok(0)
}

async fn list_backups(store: StoreConfig) -> Result<i32> {
    let store = open_store(&store)?;
    let snapshots = store.list_snapshots().await?;

    if snapshots.is_empty() {
        println!("No snapshots in {}", store.dir().display());
        return Ok(0);
    }

    println!("Snapshots in {} (oldest first):", store.dir().display());
    for snapshot in snapshots {
        let created = snapshot
            .created_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  {}  {}  {} bytes{}",
            snapshot.id,
            created,
            snapshot.size_bytes,
            if snapshot.compressed { "  (gzip)" } else { "" }
        );
    }
    Ok(0)
}

async fn restore(store: StoreConfig, snapshot_id: &str) -> Result<i32> {
    let store = open_store(&store)?;
    let credentials = store
        .restore_snapshot(snapshot_id)
        .await
        .with_context(|| format!("Failed to restore snapshot {}", snapshot_id))?;

    println!(
        "Restored {} (account: {})",
        snapshot_id,
        credentials.account_id.as_deref().unwrap_or("unpaired")
    );
    Ok(0)
}

async fn wipe(store: StoreConfig) -> Result<i32> {
    let store = open_store(&store)?;
    store.wipe().await;
    println!("Credentials wiped from {}", store.dir().display());
    Ok(0)
}
