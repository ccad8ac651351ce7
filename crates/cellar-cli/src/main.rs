use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use cellar_core::{Cellar, InstallStatus, Release, ToolState};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "cellar", version, about = "Compatibility tool manager")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List installed tools and pending installs
    List,
    /// Install a release (JSON file with tag_name and assets), waiting for
    /// the download and extraction to finish
    Install { release_file: PathBuf },
    /// Drop a release into the spool inbox for a running agent to install
    Queue { release_file: PathBuf },
    /// Remove an installed tool
    Uninstall { name: String },
    /// Read or write persisted settings
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Run the helper backend under supervision: SIGHUP restarts it,
    /// Ctrl-C stops it gracefully
    Backend,
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cellar_util::init_tracing()?;
    cellar_telemetry::init("cellar", env!("CARGO_PKG_VERSION"));
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::List => {
            let cellar = Cellar::from_env()?;
            for listing in cellar.list_tools()? {
                let state = match listing.state {
                    ToolState::Installed => "installed",
                    ToolState::Queued => "queued",
                    ToolState::Installing => "installing",
                    ToolState::Failed => "failed",
                };
                let version = listing.version.as_deref().unwrap_or("-");
                println!("{:<32} {:<10} {}", listing.display_name, state, version);
            }
        }
        Cmd::Install { release_file } => {
            let release = read_release(&release_file)?;
            let cellar = Arc::new(Cellar::from_env()?);
            cellar.enqueue(&release)?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let worker = {
                let cellar = cellar.clone();
                tokio::spawn(async move { cellar.run_queue(shutdown_rx).await })
            };

            let request = wait_terminal(&cellar, &release.tag_name).await;
            let _ = shutdown_tx.send(true);
            let _ = worker.await;
            match request.status {
                InstallStatus::Completed => println!("{} installed", release.tag_name),
                _ => return Err(format!("install of {} failed", release.tag_name).into()),
            }
        }
        Cmd::Queue { release_file } => {
            let release = read_release(&release_file)?;
            // Validate before spooling so a bad file fails here, not in the
            // agent's logs.
            release.archive_asset()?;
            let spool = spool_dir();
            std::fs::create_dir_all(&spool)?;
            let target = spool.join(format!(
                "{}-{}.json",
                release.tag_name,
                cellar_util::now_millis()
            ));
            cellar_util::write_json_atomic(&target, &release)?;
            println!("queued {} at {}", release.tag_name, target.display());
        }
        Cmd::Uninstall { name } => {
            let cellar = Cellar::from_env()?;
            cellar.uninstall(&name)?;
            println!("{name} removed");
        }
        Cmd::Settings { cmd } => {
            let cellar = Cellar::from_env()?;
            match cmd {
                SettingsCmd::Get { key } => {
                    println!("{}", cellar.settings().get(&key, serde_json::Value::Null));
                }
                SettingsCmd::Set { key, value } => {
                    // Store JSON when the value parses as JSON, else as a
                    // plain string.
                    let value = serde_json::from_str(&value)
                        .unwrap_or(serde_json::Value::String(value));
                    cellar.settings().set(&key, value)?;
                }
            }
        }
        Cmd::Backend => {
            let cellar = Cellar::from_env()?;
            cellar.start_backend().await?;
            info!(
                binary = %cellar.supervisor().binary().display(),
                "backend running; SIGHUP restarts, Ctrl-C stops"
            );
            let mut hangup =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        cellar.stop_backend().await;
                        break;
                    }
                    _ = hangup.recv() => {
                        cellar.restart_backend().await?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn read_release(path: &Path) -> Result<Release, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn spool_dir() -> PathBuf {
    match std::env::var("CELLAR_SPOOL_DIR") {
        Ok(dir) if !dir.trim().is_empty() => cellar_util::expand_user(dir.trim()),
        _ => cellar_util::data_dir().join("inbox"),
    }
}

async fn wait_terminal(cellar: &Cellar, name: &str) -> cellar_core::InstallRequest {
    let mut last_percent = u64::MAX;
    loop {
        if let Some(request) = cellar
            .queue_snapshot()
            .into_iter()
            .find(|request| request.name == name)
        {
            if request.status.is_terminal() {
                return request;
            }
            if request.total_size > 0 {
                let percent = request.downloaded_size * 100 / request.total_size;
                if percent != last_percent {
                    println!("{name}: {percent}%");
                    last_percent = percent;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
