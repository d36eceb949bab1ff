// LAN Bridge hub: relays text and files between peers on the local network.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lanbridge_hub::{config, serve, FsPayloadStore};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lanbridge-hub", version, about = "LAN Bridge relay hub")]
struct Cli {
    /// Config file (default: ~/.config/lanbridge/hub.toml, then /etc/lanbridge/hub.toml).
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Listen address; overrides config and LANBRIDGE_BIND.
    #[arg(long)]
    bind: Option<IpAddr>,
    /// Listen port; overrides config and LANBRIDGE_PORT.
    #[arg(long, short)]
    port: Option<u16>,
    /// Upload directory; overrides config and LANBRIDGE_UPLOAD_DIR.
    #[arg(long)]
    upload_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(bind) = cli.bind {
        cfg.bind_addr = bind;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(dir) = cli.upload_dir {
        cfg.upload_dir = dir;
    }

    let addr = SocketAddr::new(cfg.bind_addr, cfg.port);
    let store = FsPayloadStore::new(cfg.upload_dir.clone(), cfg.reference_prefix.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(%addr, upload_dir = %cfg.upload_dir.display(), "hub listening");
        tokio::select! {
            () = serve(listener, store) => {}
            res = shutdown_signal() => {
                res?;
                info!("shutting down");
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
