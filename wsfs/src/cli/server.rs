use crate::config::Settings;
use crate::db::MemoryStore;
use crate::fs::{FsOptions, Wsfs};
use crate::proto::server::WsfsServer;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn build_filesystem(settings: &Settings) -> Result<Arc<Wsfs>> {
    let db = Arc::new(MemoryStore::new(settings.filesystem.capacity_bytes));
    let options = FsOptions {
        chunk_size: settings.filesystem.chunk_size,
        block_size: settings.filesystem.block_size,
    };
    let fs = Wsfs::new(db, options)
        .await
        .context("Failed to initialize filesystem")?;
    Ok(Arc::new(fs))
}

fn build_servers(settings: &Settings, fs: &Arc<Wsfs>) -> Vec<WsfsServer> {
    let max_message_size = settings.server.max_message_size;
    let mut servers: Vec<WsfsServer> = settings
        .server
        .addresses
        .iter()
        .map(|addr| WsfsServer::new(Arc::clone(fs), *addr, max_message_size))
        .collect();

    if let Some(path) = &settings.server.unix_socket {
        servers.push(WsfsServer::new_unix(
            Arc::clone(fs),
            path.clone(),
            max_message_size,
        ));
    }
    servers
}

pub async fn run_server(config_path: PathBuf) -> Result<()> {
    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        "Starting wsfs (chunk size {}, block size {})",
        settings.filesystem.chunk_size, settings.filesystem.block_size
    );
    let fs = build_filesystem(&settings).await?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for server in build_servers(&settings, &fs) {
        let token = shutdown.clone();
        tasks.spawn(async move { server.start(token).await });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C, shutting down");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(())) => info!("Listener stopped"),
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Listener task panicked: {}", e),
            }
        }
    }

    shutdown.cancel();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Err(e)) = result {
            error!("Listener failed during shutdown: {}", e);
        }
    }

    if let Some(path) = &settings.server.unix_socket {
        let _ = std::fs::remove_file(path);
    }

    info!("Shutdown complete");
    Ok(())
}
