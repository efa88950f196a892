// LanShare registry server daemon.

use std::path::PathBuf;

use lanshare_registry::{config, RegistryServer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanshare-registry {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = args.next().map(PathBuf::from);
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    init_logging();
    let cfg = config::load(config_path.as_deref())?;
    cfg.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = RegistryServer::bind(cfg.clone()).await?;
        info!(
            addr = %server.local_addr()?,
            max_peers = cfg.max_peers,
            ttl_secs = cfg.peer_timeout_secs,
            "lanshare-registry {} starting",
            VERSION
        );
        let token = server.shutdown_token();
        let run = tokio::spawn(server.run());
        shutdown_signal().await?;
        info!("shutdown requested");
        token.cancel();
        run.await??;
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
