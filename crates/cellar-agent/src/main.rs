//! Helper backend daemon. Drives the install queue and picks up install
//! requests dropped into the spool inbox as JSON release files. Exits
//! cleanly on SIGTERM or Ctrl-C, which is how the supervisor stops it.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use cellar_core::{Cellar, Release};
use tokio::sync::watch;
use tracing::{info, warn};

fn spool_dir() -> PathBuf {
    match std::env::var("CELLAR_SPOOL_DIR") {
        Ok(dir) if !dir.trim().is_empty() => cellar_util::expand_user(dir.trim()),
        _ => cellar_util::data_dir().join("inbox"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cellar_util::init_tracing()?;
    cellar_telemetry::init("cellar-agent", env!("CARGO_PKG_VERSION"));

    let cellar = Arc::new(Cellar::from_env()?);
    let config = cellar.config();
    info!(
        tools_dir = %config.tools_dir.display(),
        staging_dir = %config.staging_dir.display(),
        "cellar agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue_worker = {
        let cellar = cellar.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { cellar.run_queue(shutdown_rx).await })
    };

    let spool_worker = {
        let cellar = cellar.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = cellar.config().poll_interval;
        tokio::spawn(async move { drain_spool(cellar, spool_dir(), interval, shutdown_rx).await })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown requested, draining");
    let _ = shutdown_tx.send(true);
    let _ = queue_worker.await;
    let _ = spool_worker.await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM, Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

/// Polls the spool inbox for `*.json` release files, enqueueing and then
/// removing each one. Malformed files are removed too, with a warning, so
/// they cannot wedge the inbox.
async fn drain_spool(
    cellar: Arc<Cellar>,
    spool: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if let Err(err) = drain_once(&cellar, &spool).await {
            warn!(spool = %spool.display(), error = %err, "spool scan failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn drain_once(cellar: &Cellar, spool: &Path) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(spool).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str::<Release>(&raw) {
            Ok(release) => match cellar.enqueue(&release) {
                Ok(()) => info!(tag = %release.tag_name, "spooled install accepted"),
                Err(err) => warn!(tag = %release.tag_name, error = %err, "spooled install rejected"),
            },
            Err(err) => warn!(file = %path.display(), error = %err, "unreadable spool file"),
        }
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}
