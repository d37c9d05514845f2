// YeiciCap Hub daemon: NatNet multicast ingestion, transform, TCP JSON distribution.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use yeici_hub::{config, Bridge, Config};

/// Bridge Motive's NatNet stream to Unreal / Maya consumers as newline-delimited JSON.
#[derive(Parser, Debug)]
#[command(name = "yeici-hub")]
#[command(version)]
struct Args {
    /// Configuration file (default: ~/.config/yeicicap/config.toml, /etc/yeicicap/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NatNet multicast group
    #[arg(long)]
    multicast_group: Option<Ipv4Addr>,

    /// Local interface to join the multicast group on
    #[arg(long)]
    interface: Option<Ipv4Addr>,

    /// NatNet data port
    #[arg(long)]
    data_port: Option<u16>,

    /// Distribution listen host
    #[arg(long)]
    host: Option<String>,

    /// Distribution listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter (trace, debug, info, warn, error); defaults to RUST_LOG, then info
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, c: &mut Config) {
        if let Some(g) = self.multicast_group {
            c.multicast_group = g;
        }
        if let Some(i) = self.interface {
            c.multicast_interface = i;
        }
        if let Some(p) = self.data_port {
            c.data_port = p;
        }
        if let Some(h) = &self.host {
            c.bridge_host = h.clone();
        }
        if let Some(p) = self.port {
            c.bridge_port = p;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(args.log_level.as_deref()))
        .with_target(false)
        .init();

    let mut cfg = config::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut cfg);
    cfg.validate()?;
    let stats_interval =
        (cfg.stats_interval_secs > 0).then(|| Duration::from_secs(cfg.stats_interval_secs));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut bridge = Bridge::new(&cfg);
        bridge.start().await.context("starting bridge")?;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            natnet = %format_args!("{}:{}", cfg.multicast_group, cfg.data_port),
            bridge = %format_args!("{}:{}", cfg.bridge_host, cfg.bridge_port),
            "YeiciCap Hub running"
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = shutdown_signal().await {
                tracing::error!(error = %e, "signal handler failed, shutting down");
            }
            let _ = shutdown_tx.send(true);
        });

        bridge.run(shutdown_rx, stats_interval).await;
        bridge.stop().await;
        let stats = bridge.stats();
        let ingest = bridge.ingestion().stats();
        info!(
            frames = stats.frames,
            dropped = ingest.dropped,
            malformed = ingest.malformed,
            "YeiciCap Hub stopped"
        );
        Ok::<(), anyhow::Error>(())
    })
}

/// `--log-level` if it parses, else RUST_LOG, else info.
fn log_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
