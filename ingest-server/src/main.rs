// Ingest daemon: accepts segmented image uploads and writes one FITS file per image.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ingest_core::fits::FitsStoreFactory;
use ingest_server::{config, Coordinator, IngestServer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ingest-server", version, about = "Segmented image ingest server")]
struct Args {
    /// Config file (default: ~/.config/ingest/config.toml, then /etc/ingest/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Directory for finished images
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(bind) = args.bind {
        cfg.bind_address = bind;
    }
    if let Some(dir) = args.output_dir {
        cfg.output_dir = dir;
    }
    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("creating output dir {}", cfg.output_dir.display()))?;
    info!(
        output_dir = %cfg.output_dir.display(),
        idle_timeout_secs = cfg.idle_timeout_secs,
        "starting ingest server"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let factory = std::sync::Arc::new(FitsStoreFactory::new(cfg.output_dir.clone()));
        let coordinator = Coordinator::start(factory, cfg.coordinator_options());
        let server = IngestServer::bind(cfg.listen_addr(), coordinator)
            .await
            .with_context(|| format!("binding {}", cfg.listen_addr()))?;
        let handle = server.handle();
        let mut run = tokio::spawn(server.run());

        tokio::select! {
            res = shutdown_signal() => {
                res?;
                info!("shutdown requested");
                handle.shutdown().await;
                run.await??;
            }
            res = &mut run => {
                warn!("listener exited");
                handle.shutdown().await;
                res??;
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;
    info!("ingest server stopped");
    Ok(())
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
