use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::Value;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::info;

use devport_core::wire::METHOD_PING;
use devport_core::{client, default_config_path, default_socket_path};

mod config_store;
mod ipc;
mod log_buffer;
mod port_alloc;
mod process;
mod supervisor;

#[derive(Debug, Parser)]
#[command(name = "devportd", version, about = "Dev-server host daemon for devport")]
struct Args {
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let socket_path = args.socket.unwrap_or_else(default_socket_path);
    let config_path = args
        .config
        .or_else(|| std::env::var_os("DEVPORT_CONFIG_PATH").map(PathBuf::from))
        .unwrap_or_else(default_config_path);

    let config = config_store::ConfigStore::load(config_path).await?;
    let supervisor = supervisor::Supervisor::new(config.clone());

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
    }
    let listener = bind_daemon_socket(&socket_path)?;
    info!("devportd listening on {}", socket_path.display());

    let shutdown = Arc::new(Notify::new());
    let handler = ipc::Handler {
        supervisor: supervisor.clone(),
        config,
        shutdown: shutdown.clone(),
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = ipc::serve(listener, handler) => {}
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = shutdown.notified() => info!("shutdown requested over IPC"),
    }

    supervisor
        .shutdown_all(supervisor::stop_grace(), supervisor::shutdown_timeout())
        .await;
    let _ = std::fs::remove_file(&socket_path);
    info!("devportd shutdown complete");
    Ok(())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("DEVPORT_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .try_init();
}

/// Bind the daemon socket, recovering from a stale file left by a previous
/// run. If another daemon actually answers on it, refuse to start.
fn bind_daemon_socket(socket_path: &Path) -> anyhow::Result<UnixListener> {
    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            if daemon_is_reachable(socket_path) {
                bail!(
                    "failed to bind socket: {} (another devportd instance is already running)",
                    socket_path.display()
                );
            }
            std::fs::remove_file(socket_path).with_context(|| {
                format!("failed to remove stale socket: {}", socket_path.display())
            })?;
            UnixListener::bind(socket_path)
                .with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
    }
}

fn daemon_is_reachable(socket_path: &Path) -> bool {
    client::request(socket_path, METHOD_PING, Value::Null)
        .map(|response| response.success)
        .unwrap_or(false)
}
