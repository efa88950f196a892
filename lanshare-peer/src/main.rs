// LanShare peer daemon: registers, answers discovery, receives files.

use std::path::PathBuf;

use lanshare_peer::{config, AcceptPolicy, PeerClient};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut auto_accept = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanshare-peer {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => config_path = args.next().map(PathBuf::from),
            "--auto-accept" => auto_accept = true,
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    init_logging();
    let cfg = config::load(config_path.as_deref())?;
    cfg.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let client = PeerClient::new(cfg)?;
        client.set_accept_policy(if auto_accept {
            AcceptPolicy::accept_all()
        } else {
            AcceptPolicy::console_prompt()
        });

        let mut received = client.subscribe_received();
        tokio::spawn(async move {
            loop {
                match received.recv().await {
                    Ok(ev) => info!(file = %ev.file_name, path = %ev.saved_path.display(), from = %ev.from, "saved"),
                    Err(RecvError::Lagged(n)) => warn!(missed = n, "receive notifications lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!("lanshare-peer {} starting", VERSION);
        client.start().await?;
        shutdown_signal().await?;
        info!("shutdown requested");
        client.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
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
