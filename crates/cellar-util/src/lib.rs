use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;

pub const DEFAULT_TOOLS_DIR: &str = "~/.steam/root/compatibilitytools.d";
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_QUEUE_POLL_SECS: u64 = 5;

pub fn env_value(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

pub fn env_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Directory holding one subdirectory per installed compatibility tool.
pub fn tools_dir() -> PathBuf {
    expand_user(&env_value("CELLAR_TOOLS_DIR", DEFAULT_TOOLS_DIR))
}

pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CELLAR_DATA_DIR") {
        if !dir.trim().is_empty() {
            return expand_user(dir.trim());
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/cellar")
    } else {
        PathBuf::from("/tmp/cellar")
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

/// Scratch area archives are unpacked into before promotion into the
/// tools directory.
pub fn staging_dir() -> PathBuf {
    data_dir().join("staging")
}

pub fn fetch_timeout() -> Duration {
    env_secs("CELLAR_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)
}

pub fn stop_grace() -> Duration {
    env_secs("CELLAR_STOP_GRACE_SECS", DEFAULT_STOP_GRACE_SECS)
}

pub fn queue_poll_interval() -> Duration {
    env_secs("CELLAR_QUEUE_POLL_SECS", DEFAULT_QUEUE_POLL_SECS)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn expand_user_replaces_leading_tilde() {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".into());
        std::env::set_var("HOME", "/home/deck");
        assert_eq!(
            expand_user("~/.steam/root"),
            PathBuf::from("/home/deck/.steam/root")
        );
        assert_eq!(expand_user("/opt/tools"), PathBuf::from("/opt/tools"));
        std::env::set_var("HOME", home);
    }

    #[test]
    fn env_secs_ignores_garbage() {
        std::env::set_var("CELLAR_TEST_SECS", "not-a-number");
        assert_eq!(env_secs("CELLAR_TEST_SECS", 7), Duration::from_secs(7));
        std::env::set_var("CELLAR_TEST_SECS", "0");
        assert_eq!(env_secs("CELLAR_TEST_SECS", 7), Duration::from_secs(7));
        std::env::set_var("CELLAR_TEST_SECS", "12");
        assert_eq!(env_secs("CELLAR_TEST_SECS", 7), Duration::from_secs(12));
        std::env::remove_var("CELLAR_TEST_SECS");
    }

    #[test]
    fn write_json_atomic_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let mut map = BTreeMap::new();
        map.insert("flavor".to_string(), "proton-ge".to_string());
        write_json_atomic(&path, &map).expect("write");
        let raw = fs::read(&path).expect("read");
        let parsed: BTreeMap<String, String> = serde_json::from_slice(&raw).expect("parse");
        assert_eq!(parsed, map);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
