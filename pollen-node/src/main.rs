// Pollen node: TCP acceptor, connection manager, online message router.

mod config;
mod connection;
mod router;

use std::sync::Arc;
use std::time::Duration;

use pollen_core::codec::ChunkReceivedListener;
use pollen_core::era::Era;
use pollen_core::registry::EngineRegistry;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::connection::ConnectionManager;
use crate::router::OnlineMessageRouter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs every assimilated chunk. Applications replace this with their own
/// listener when they embed the engine.
struct LogListener;

impl ChunkReceivedListener for LogListener {
    fn chunk_received(&self, sender: &str, uri: &str, era: Era) {
        tracing::info!(sender, uri, %era, "chunk received");
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("pollen-node {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    std::fs::create_dir_all(&cfg.data_root)?;
    // configuration errors abort startup with a descriptive failure
    let registry = Arc::new(
        EngineRegistry::discover(&cfg.owner, &cfg.data_root, Arc::new(LogListener))?
            .with_cache_lookback(cfg.chunk_cache_lookback),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = ConnectionManager::new(
            registry.clone(),
            Duration::from_millis(cfg.max_execution_ms),
        );
        let router = OnlineMessageRouter::new(manager.clone());
        router.run();

        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
        tracing::info!(
            port = cfg.listen_port,
            owner = %cfg.owner,
            root = %cfg.data_root.display(),
            formats = ?registry.formats(),
            "pollen node listening"
        );
        tokio::spawn(accept_loop(listener, manager));
        shutdown_signal().await
    })
}

async fn accept_loop(listener: TcpListener, manager: Arc<ConnectionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::info!(%addr, "incoming connection");
                let (reader, writer) = stream.into_split();
                manager.handle_connection(reader, writer, false);
            }
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
