use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::daemon::Coordinator;
use crate::ip::{IpManager, LocalIpManager};
use crate::{checker, dcs};

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: Option<PathBuf>,
}

/// Daemon lifecycle: configure → connect → bootstrap store → tick until a
/// signal arrives → drain → exit.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let conf = Config::load(args.config_path.as_deref())?;
    init_tracing(&conf.log_level);
    conf.log_settings();

    let checker = checker::new_checker(&conf)?;
    let dcs = dcs::new_dcs(&conf).await?;
    dcs.bootstrap()
        .await
        .context("coordination store bootstrap failed")?;
    let ip: Arc<dyn IpManager> = Arc::new(LocalIpManager::new(&conf)?);

    let coordinator = Arc::new(Coordinator::new(&conf, checker, dcs, ip));
    let shutdown = CancellationToken::new();

    // The tick loop is the only writer of kernel state; refreshes it spawns
    // touch the store alone.
    let tick_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        let interval = conf.interval;
        async move {
            loop {
                if sleep_or_shutdown(interval, &shutdown).await {
                    return;
                }
                coordinator.tick().await;
            }
        }
    });

    wait_for_shutdown(&shutdown).await;

    // The loop stops at the next tick boundary; in-flight refreshes are
    // abandoned and expire on their own.
    if let Err(e) = tick_handle.await {
        tracing::error!("daemon: control task error: {}", e);
    }

    coordinator.drain().await;
    tracing::info!("daemon: shutdown complete");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_target(false),
        )
        .init();

    // The writer guard must outlive the process.
    std::mem::forget(guard);
}

/// Sleep for `duration`, returning `true` immediately if shutdown is
/// signalled first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}

async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("daemon: cannot install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("daemon: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("daemon: received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
