//! scriptsync CLI: run the notifier, inspect it, or talk to it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use scriptsync_daemon::setup::load_config;
use scriptsync_daemon::{Config, Host, LogNotices};
use scriptsync_protocol::{Incoming, ListenerConnection};
use scriptsync_registry::{probe, PortMarker, PortStatus, ServiceIdentity};
use scriptsync_relay::remove_spool_file;
use scriptsync_types::{file_uri, Message, ScriptChange};
use scriptsync_watch::fs::FsChangeSource;
use tokio::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "scriptsync",
    about = "Push user script changes to connected script engines",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch scripts and broadcast changes, or relay them to the owner.
    Run {
        /// Port of the broadcast endpoint.
        #[arg(short, long)]
        port: Option<u16>,
        /// Watch only this script.
        #[arg(short, long)]
        target: Option<PathBuf>,
        /// Glob matched against paths under the root.
        #[arg(long)]
        pattern: Option<String>,
        /// Directory to watch.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Show who owns the broadcast endpoint.
    Status,

    /// Send one script to the current owner through the relay spool.
    Push {
        /// Script to send.
        file: PathBuf,
    },

    /// Connect as a listener and print every message.
    Listen {
        /// Port to connect to. Defaults to the recorded owner.
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            port,
            target,
            pattern,
            root,
        } => {
            if let Some(port) = port {
                config.service.port = port;
            }
            if target.is_some() {
                config.watch.target = target;
            }
            if let Some(pattern) = pattern {
                config.watch.pattern = pattern;
            }
            if let Some(root) = root {
                config.watch.root = root;
            }
            run(&config).await
        }
        Commands::Status => status(&config).await,
        Commands::Push { file } => push(&config, &file).await,
        Commands::Listen { port } => listen(&config, port).await,
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let mut host = Host::from_config(config, Arc::new(LogNotices));
    info!(role = %host.role(), port = config.service.port, "scriptsync running");

    let source = FsChangeSource::new(config.watch.target(), config.watch.debounce());
    host.watch(Box::new(source)).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    host.shutdown().await;
    Ok(())
}

/// The port of a live owner, if there is one.
fn live_owner(identity: &ServiceIdentity) -> anyhow::Result<Option<u16>> {
    let marker = PortMarker::new(identity.marker_path());
    match marker.read()? {
        Some(port) if probe(port)? == PortStatus::Live => Ok(Some(port)),
        _ => Ok(None),
    }
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let identity = config.service.identity();
    let marker = PortMarker::new(identity.marker_path());

    println!("Coordination dir: {}", identity.coordination_dir().display());
    match marker.read() {
        Ok(Some(port)) => match probe(port)? {
            PortStatus::Live => println!("Owner: listening on port {port}"),
            PortStatus::Free => println!("Owner: none (stale marker for port {port})"),
        },
        Ok(None) => println!("Owner: none"),
        Err(e) => println!("Owner: unknown ({e})"),
    }

    let pending = config.service.settings().spool().backlog().await?;
    println!("Pending relay messages: {}", pending.len());
    Ok(())
}

async fn push(config: &Config, file: &Path) -> anyhow::Result<()> {
    let identity = config.service.identity();
    let Some(owner) = live_owner(&identity)? else {
        bail!("no broadcast owner is running; start `scriptsync run` first");
    };

    let path = std::fs::canonicalize(file)
        .with_context(|| format!("cannot resolve {}", file.display()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let script = String::from_utf8_lossy(&bytes);
    let message = Message::on_change(&ScriptChange::new(script, file_uri(&path)));

    let spool = config.service.settings().spool();
    let spooled = spool.relay(&message).await?;

    // The owner deletes the file once it has broadcast it.
    let deadline = Instant::now() + spool.ttl();
    while tokio::fs::try_exists(&spooled).await.unwrap_or(false) {
        if Instant::now() >= deadline {
            remove_spool_file(&spooled).await?;
            bail!(
                "owner on port {owner} did not pick up the change within {:?}",
                spool.ttl()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("Delivered {} via owner on port {owner}", path.display());
    Ok(())
}

async fn listen(config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    let identity = config.service.identity();
    let port = match port {
        Some(port) => port,
        None => live_owner(&identity)?.unwrap_or(identity.port()),
    };

    let conn = ListenerConnection::connect(ServiceIdentity::loopback_addr(port))
        .await
        .with_context(|| format!("no broadcast endpoint on port {port}"))?;
    let (_sender, mut receiver) = conn.split();
    info!(port, "listening");

    loop {
        tokio::select! {
            frame = receiver.recv() => match frame? {
                Some(Incoming::Text(text)) => println!("{text}"),
                Some(Incoming::Ping | Incoming::Pong) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
