use std::{env, path::PathBuf, time::Duration};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ProcessLaunchError;

/// Lifecycle manager for the helper backend process. Holds at most one
/// child; stop sends SIGTERM and escalates to SIGKILL after the grace
/// period.
pub struct Supervisor {
    binary: PathBuf,
    grace: Duration,
    child: Mutex<Option<Child>>,
}

impl Supervisor {
    pub fn new(binary: PathBuf, grace: Duration) -> Self {
        Self {
            binary,
            grace,
            child: Mutex::new(None),
        }
    }

    /// Binary from `CELLAR_AGENT_BIN`, falling back to a `cellar-agent`
    /// sibling of the current executable.
    pub fn from_env(grace: Duration) -> Self {
        let binary = match env::var("CELLAR_AGENT_BIN") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("cellar-agent")))
                .unwrap_or_else(|| PathBuf::from("cellar-agent")),
        };
        Self::new(binary, grace)
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Spawns the backend. Returns false without spawning when a child is
    /// already running.
    pub async fn start(&self) -> Result<bool, ProcessLaunchError> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    warn!(binary = %self.binary.display(), "backend already running");
                    return Ok(false);
                }
                // Exited or unknown; drop the stale handle and respawn.
                _ => {
                    *slot = None;
                }
            }
        }
        let child = Command::new(&self.binary)
            .spawn()
            .map_err(|source| ProcessLaunchError {
                path: self.binary.clone(),
                source,
            })?;
        info!(binary = %self.binary.display(), pid = child.id(), "backend started");
        *slot = Some(child);
        Ok(true)
    }

    /// Stops the backend if it is running. SIGTERM first; if the child has
    /// not exited within the grace period it is killed. Returns false when
    /// nothing was running.
    pub async fn stop(&self) -> bool {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return false;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return false;
        }
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from a live child handle we own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(code = status.code(), "backend exited");
            }
            Ok(Err(err)) => {
                warn!(error = %err, "failed to reap backend, killing");
                kill_child(&mut child).await;
            }
            Err(_) => {
                warn!(grace_secs = self.grace.as_secs(), "backend ignored SIGTERM, killing");
                kill_child(&mut child).await;
            }
        }
        true
    }

    pub async fn restart(&self) -> Result<bool, ProcessLaunchError> {
        self.stop().await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        let mut slot = self.child.lock().await;
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(None) => child.id(),
            _ => None,
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill backend");
    }
}
