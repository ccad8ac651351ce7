use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::error::{EnqueueError, InstallError};
use crate::extract;
use crate::fetch::{self, FetchedArchive};
use crate::release::Release;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl InstallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstallStatus::Completed | InstallStatus::Failed)
    }
}

/// Externally visible state of one queued install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    /// Release tag, which doubles as the request's identity in the queue.
    pub name: String,
    pub download_url: String,
    /// Declared archive size; 0 until either the release asset or the
    /// download response supplies one.
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: InstallStatus,
    /// Tool version read from the extracted version marker; set on
    /// completion.
    pub version: Option<String>,
    /// Digest of the downloaded archive, recorded on completion.
    pub archive_sha256: Option<String>,
}

struct QueueEntry {
    request: InstallRequest,
    cancel: Arc<AtomicBool>,
}

struct InstallOutcome {
    sha256: String,
    version: Option<String>,
}

/// FIFO install queue. Enqueue, cancel and snapshot are synchronous and
/// cheap; a single worker drains the queue via [`InstallQueue::run`], so at
/// most one install is in flight at a time.
pub struct InstallQueue {
    entries: Mutex<Vec<QueueEntry>>,
    wakeup: Notify,
    tools_dir: PathBuf,
    staging_root: PathBuf,
    fetch_timeout: Duration,
    poll_interval: Duration,
}

impl InstallQueue {
    pub fn new(
        tools_dir: PathBuf,
        staging_root: PathBuf,
        fetch_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            tools_dir,
            staging_root,
            fetch_timeout,
            poll_interval,
        }
    }

    /// Appends an install for the release's archive asset. A release whose
    /// tag is already queued or installing is rejected; releases that
    /// previously completed or failed may be enqueued again.
    pub fn enqueue(&self, release: &Release) -> Result<(), EnqueueError> {
        let asset = release.archive_asset()?;
        let mut entries = self.lock_entries();
        let pending = entries
            .iter()
            .any(|entry| entry.request.name == release.tag_name && !entry.request.status.is_terminal());
        if pending {
            return Err(EnqueueError::DuplicatePending(release.tag_name.clone()));
        }
        info!(tag = %release.tag_name, url = %asset.browser_download_url, "install queued");
        entries.push(QueueEntry {
            request: InstallRequest {
                name: release.tag_name.clone(),
                download_url: asset.browser_download_url.clone(),
                total_size: asset.size,
                downloaded_size: 0,
                status: InstallStatus::Queued,
                version: None,
                archive_sha256: None,
            },
            cancel: Arc::new(AtomicBool::new(false)),
        });
        drop(entries);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Cancels a pending install. A queued request fails immediately; an
    /// in-flight download is flagged and fails at its next cancel check.
    /// Returns false when no pending request carries the name.
    pub fn cancel(&self, name: &str) -> bool {
        let mut entries = self.lock_entries();
        let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.request.name == name && !entry.request.status.is_terminal())
        else {
            return false;
        };
        match entry.request.status {
            InstallStatus::Queued => {
                entry.request.status = InstallStatus::Failed;
                info!(tag = %name, "queued install cancelled");
            }
            InstallStatus::InProgress => {
                entry.cancel.store(true, Ordering::Relaxed);
                info!(tag = %name, "cancelling in-flight install");
            }
            _ => {}
        }
        true
    }

    pub fn snapshot(&self) -> Vec<InstallRequest> {
        self.lock_entries()
            .iter()
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// Download completion in [0.0, 1.0] for an in-flight install; 0.0 for
    /// anything else, including unknown names and downloads with no known
    /// total size.
    pub fn progress(&self, name: &str) -> f64 {
        let entries = self.lock_entries();
        let Some(entry) = entries.iter().find(|entry| {
            entry.request.name == name && entry.request.status == InstallStatus::InProgress
        }) else {
            return 0.0;
        };
        let request = &entry.request;
        if request.total_size > 0 {
            // The declared asset size can understate what the server
            // actually sends; never report past 1.0.
            (request.downloaded_size as f64 / request.total_size as f64).min(1.0)
        } else {
            0.0
        }
    }

    /// Worker loop. Claims queued requests in FIFO order and drives each
    /// through download and extraction; sleeps on the wakeup signal (with a
    /// polling fallback) when the queue is idle. Returns once `shutdown`
    /// flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.claim_next() {
                Some((request, cancel)) => self.process(request, cancel, &shutdown).await,
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    fn claim_next(&self) -> Option<(InstallRequest, Arc<AtomicBool>)> {
        let mut entries = self.lock_entries();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.request.status == InstallStatus::Queued)?;
        entry.request.status = InstallStatus::InProgress;
        Some((entry.request.clone(), entry.cancel.clone()))
    }

    async fn process(
        &self,
        request: InstallRequest,
        cancel: Arc<AtomicBool>,
        shutdown: &watch::Receiver<bool>,
    ) {
        info!(tag = %request.name, "starting install");
        let result = self.install(&request, &cancel, shutdown).await;
        let mut entries = self.lock_entries();
        let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.request.name == request.name && entry.request.status == InstallStatus::InProgress)
        else {
            return;
        };
        match result {
            Ok(outcome) => {
                entry.request.status = InstallStatus::Completed;
                entry.request.version = outcome.version;
                entry.request.archive_sha256 = Some(outcome.sha256);
                info!(tag = %request.name, "install completed");
                cellar_telemetry::event("install_completed", &[("tag", &request.name)]);
            }
            Err(err) => {
                entry.request.status = InstallStatus::Failed;
                warn!(tag = %request.name, error = %err, "install failed");
                cellar_telemetry::event(
                    "install_failed",
                    &[("tag", &request.name), ("error", &err.to_string())],
                );
            }
        }
    }

    async fn install(
        &self,
        request: &InstallRequest,
        cancel: &Arc<AtomicBool>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<InstallOutcome, InstallError> {
        let cancel_flag = cancel.clone();
        let shutdown = shutdown.clone();
        let should_cancel = {
            let cancel = cancel_flag.clone();
            let shutdown = shutdown.clone();
            move || cancel.load(Ordering::Relaxed) || *shutdown.borrow()
        };
        let FetchedArchive {
            bytes,
            total_size,
            sha256,
        } = fetch::fetch_archive(
            &request.download_url,
            self.fetch_timeout,
            should_cancel,
            |downloaded, total| self.record_progress(&request.name, downloaded, total),
        )
        .await?;
        if total_size == 0 {
            // No Content-Length; record the final size so the snapshot is
            // consistent once the download is done.
            self.record_progress(&request.name, bytes.len() as u64, bytes.len() as u64);
        }
        // Cancellation between the download and extraction phases.
        if cancel_flag.load(Ordering::Relaxed) || *shutdown.borrow() {
            return Err(InstallError::Fetch(crate::error::FetchError::Cancelled));
        }

        let staging_root = self.staging_root.clone();
        let tools_dir = self.tools_dir.clone();
        let promoted = tokio::task::spawn_blocking(move || {
            extract::extract_archive(&bytes, &staging_root, &tools_dir)
        })
        .await
        .map_err(|err| {
            InstallError::Extract(crate::error::ExtractError::Io(std::io::Error::other(err)))
        })??;
        info!(tag = %request.name, entries = promoted.len(), "archive extracted");
        let version = promoted.first().and_then(|dir| {
            crate::inventory::read_version_marker(&self.tools_dir.join(dir).join("version"))
        });
        Ok(InstallOutcome { sha256, version })
    }

    fn record_progress(&self, name: &str, downloaded: u64, total: u64) {
        let mut entries = self.lock_entries();
        // Terminal entries with the same tag may still be around after a
        // re-enqueue; only the in-flight one gets progress updates.
        let Some(entry) = entries.iter_mut().find(|entry| {
            entry.request.name == name && entry.request.status == InstallStatus::InProgress
        }) else {
            return;
        };
        entry.request.downloaded_size = downloaded;
        if entry.request.total_size == 0 && total > 0 {
            entry.request.total_size = total;
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<QueueEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
