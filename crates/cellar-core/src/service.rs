use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{EnqueueError, InventoryError, SettingsError};
use crate::inventory::{self, InstalledTool};
use crate::queue::{InstallQueue, InstallRequest, InstallStatus};
use crate::release::Release;
use crate::settings::SettingsStore;
use crate::supervisor::Supervisor;

/// Resolved runtime configuration. [`CellarConfig::from_env`] reads the
/// `CELLAR_*` environment; tests build one pointing at scratch directories.
#[derive(Debug, Clone)]
pub struct CellarConfig {
    pub tools_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub settings_path: PathBuf,
    pub fetch_timeout: Duration,
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl CellarConfig {
    pub fn from_env() -> Self {
        Self {
            tools_dir: cellar_util::tools_dir(),
            staging_dir: cellar_util::staging_dir(),
            settings_path: cellar_util::state_file_path("settings.json"),
            fetch_timeout: cellar_util::fetch_timeout(),
            stop_grace: cellar_util::stop_grace(),
            poll_interval: cellar_util::queue_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Installed,
    Queued,
    Installing,
    Failed,
}

/// One row of the merged inventory: tools on disk plus pending installs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolListing {
    pub name: String,
    pub display_name: String,
    pub version: Option<String>,
    pub state: ToolState,
    /// Download completion in [0.0, 1.0]; only meaningful while installing.
    pub progress: f64,
}

/// Top-level handle tying the install queue, the on-disk inventory, the
/// settings store and the backend supervisor together.
pub struct Cellar {
    config: CellarConfig,
    queue: Arc<InstallQueue>,
    settings: SettingsStore,
    supervisor: Supervisor,
}

impl Cellar {
    pub fn from_env() -> Result<Self, SettingsError> {
        let config = CellarConfig::from_env();
        let supervisor = Supervisor::from_env(config.stop_grace);
        Self::with_supervisor(config, supervisor)
    }

    pub fn with_config(config: CellarConfig) -> Result<Self, SettingsError> {
        let supervisor = Supervisor::from_env(config.stop_grace);
        Self::with_supervisor(config, supervisor)
    }

    fn with_supervisor(config: CellarConfig, supervisor: Supervisor) -> Result<Self, SettingsError> {
        let queue = Arc::new(InstallQueue::new(
            config.tools_dir.clone(),
            config.staging_dir.clone(),
            config.fetch_timeout,
            config.poll_interval,
        ));
        let settings = SettingsStore::open(config.settings_path.clone())?;
        Ok(Self {
            config,
            queue,
            settings,
            supervisor,
        })
    }

    pub fn config(&self) -> &CellarConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<InstallQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn enqueue(&self, release: &Release) -> Result<(), EnqueueError> {
        self.queue.enqueue(release)
    }

    pub fn cancel_install(&self, name: &str) -> bool {
        self.queue.cancel(name)
    }

    pub fn install_progress(&self, name: &str) -> f64 {
        self.queue.progress(name)
    }

    pub fn queue_snapshot(&self) -> Vec<InstallRequest> {
        self.queue.snapshot()
    }

    /// Drives the install queue until `shutdown` flips to true.
    pub async fn run_queue(&self, shutdown: watch::Receiver<bool>) {
        self.queue.run(shutdown).await;
    }

    pub fn installed_tools(&self) -> Result<Vec<InstalledTool>, InventoryError> {
        inventory::scan_installed(&self.config.tools_dir)
    }

    /// Merged inventory: every tool on disk plus every pending queue entry.
    /// A pending install shadows a same-named installed tool, so a
    /// reinstall shows up as installing rather than installed.
    pub fn list_tools(&self) -> Result<Vec<ToolListing>, InventoryError> {
        let mut listings: Vec<ToolListing> = Vec::new();
        let snapshot = self.queue.snapshot();
        for request in snapshot.clone() {
            let state = match request.status {
                InstallStatus::Queued => ToolState::Queued,
                InstallStatus::InProgress => ToolState::Installing,
                InstallStatus::Failed => ToolState::Failed,
                InstallStatus::Completed => continue,
            };
            // A failed attempt that has since been re-enqueued is stale;
            // the live entry represents the tag.
            if state == ToolState::Failed
                && snapshot
                    .iter()
                    .any(|other| other.name == request.name && !other.status.is_terminal())
            {
                continue;
            }
            if listings.iter().any(|listing| listing.name == request.name) {
                continue;
            }
            listings.push(ToolListing {
                display_name: request.name.clone(),
                progress: self.queue.progress(&request.name),
                name: request.name,
                version: None,
                state,
            });
        }
        for tool in self.installed_tools()? {
            if listings.iter().any(|listing| listing.name == tool.internal_name) {
                continue;
            }
            listings.push(ToolListing {
                name: tool.internal_name,
                display_name: tool.display_name,
                version: tool.version,
                state: ToolState::Installed,
                progress: 0.0,
            });
        }
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listings)
    }

    pub async fn start_backend(&self) -> Result<bool, crate::error::ProcessLaunchError> {
        self.supervisor.start().await
    }

    pub async fn stop_backend(&self) -> bool {
        self.supervisor.stop().await
    }

    pub async fn restart_backend(&self) -> Result<bool, crate::error::ProcessLaunchError> {
        self.supervisor.restart().await
    }

    /// Removes an installed tool's directory from the tools directory.
    pub fn uninstall(&self, internal_name: &str) -> Result<(), InventoryError> {
        let dir = inventory::tool_directory(&self.config.tools_dir, internal_name)?;
        fs::remove_dir_all(&dir).map_err(|source| InventoryError::Io {
            path: dir.clone(),
            source,
        })?;
        info!(tool = %internal_name, dir = %dir.display(), "tool uninstalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::{ReleaseAsset, GZIP_CONTENT_TYPE};
    use std::path::Path;

    fn config(root: &Path) -> CellarConfig {
        CellarConfig {
            tools_dir: root.join("tools"),
            staging_dir: root.join("staging"),
            settings_path: root.join("state/settings.json"),
            fetch_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
        }
    }

    fn write_tool(tools_dir: &Path, dir: &str, version: &str) {
        let tool = tools_dir.join(dir);
        fs::create_dir_all(&tool).expect("mkdir");
        let vdf = format!(
            "\"compatibilitytools\"\n{{\n  \"compat_tools\"\n  {{\n    \"{dir}\"\n    {{\n    }}\n  }}\n}}\n"
        );
        fs::write(tool.join("compatibilitytool.vdf"), vdf).expect("vdf");
        fs::write(tool.join("version"), format!("{version} {dir}\n")).expect("version");
    }

    fn release(tag: &str) -> Release {
        Release {
            tag_name: tag.into(),
            assets: vec![ReleaseAsset {
                content_type: GZIP_CONTENT_TYPE.into(),
                browser_download_url: "http://127.0.0.1:9/x.tar.gz".into(),
                size: 10,
            }],
        }
    }

    #[test]
    fn listing_merges_installed_and_pending() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let cellar = Cellar::with_config(config(scratch.path())).expect("cellar");
        write_tool(&cellar.config().tools_dir, "GE-Proton8-9", "8.9");
        cellar.enqueue(&release("GE-Proton9-1")).expect("enqueue");

        let listings = cellar.list_tools().expect("list");
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].name, "GE-Proton8-9");
        assert_eq!(listings[0].state, ToolState::Installed);
        assert_eq!(listings[0].version.as_deref(), Some("8.9"));
        assert_eq!(listings[1].name, "GE-Proton9-1");
        assert_eq!(listings[1].state, ToolState::Queued);
    }

    #[test]
    fn pending_reinstall_shadows_the_installed_tool() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let cellar = Cellar::with_config(config(scratch.path())).expect("cellar");
        write_tool(&cellar.config().tools_dir, "GE-Proton9-1", "9.1");
        cellar.enqueue(&release("GE-Proton9-1")).expect("enqueue");

        let listings = cellar.list_tools().expect("list");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].state, ToolState::Queued);
    }

    #[test]
    fn uninstall_removes_the_tool_directory() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let cellar = Cellar::with_config(config(scratch.path())).expect("cellar");
        write_tool(&cellar.config().tools_dir, "GE-Proton9-1", "9.1");

        cellar.uninstall("GE-Proton9-1").expect("uninstall");
        assert!(!cellar.config().tools_dir.join("GE-Proton9-1").exists());

        let err = cellar.uninstall("GE-Proton9-1").expect_err("gone");
        assert!(matches!(err, InventoryError::UnknownTool(_)));
    }

    #[test]
    fn settings_live_under_the_configured_state_dir() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let cellar = Cellar::with_config(config(scratch.path())).expect("cellar");
        cellar
            .settings()
            .set("channel", serde_json::json!("stable"))
            .expect("set");
        assert!(scratch.path().join("state/settings.json").is_file());
    }

    #[tokio::test]
    async fn backend_lifecycle_through_the_service() {
        use std::os::unix::fs::PermissionsExt;

        let scratch = tempfile::tempdir().expect("tempdir");
        let bin = scratch.path().join("backend.sh");
        fs::write(&bin, "#!/bin/sh\nsleep 30\n").expect("script");
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).expect("chmod");

        let cfg = config(scratch.path());
        let supervisor = Supervisor::new(bin, cfg.stop_grace);
        let cellar = Cellar::with_supervisor(cfg, supervisor).expect("cellar");

        assert!(cellar.start_backend().await.expect("start"));
        let first = cellar.supervisor().pid().await.expect("pid");

        assert!(cellar.restart_backend().await.expect("restart"));
        let second = cellar.supervisor().pid().await.expect("pid");
        assert_ne!(first, second);

        assert!(cellar.stop_backend().await);
        assert!(!cellar.supervisor().is_running().await);
    }
}
