use std::{
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SettingsError;
use cellar_util::write_json_atomic;

/// Flat key/value settings persisted as one JSON object. Reads come from the
/// in-memory copy; every mutation is committed to disk atomically.
pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl SettingsStore {
    /// Opens the store at `path`, loading existing values. A missing file is
    /// an empty store; a file with invalid JSON is an error rather than a
    /// silent reset.
    pub fn open(path: PathBuf) -> Result<Self, SettingsError> {
        let values = load_map(&path)?;
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads the in-memory map from disk, discarding uncommitted edits.
    /// A missing file resets to empty.
    pub fn read(&self) -> Result<(), SettingsError> {
        let fresh = load_map(&self.path)?;
        *self.lock_values() = fresh;
        Ok(())
    }

    /// Writes the current map to disk.
    pub fn commit(&self) -> Result<(), SettingsError> {
        let values = self.lock_values();
        write_json_atomic(&self.path, &Value::Object(values.clone())).map_err(SettingsError::Io)
    }

    /// Returns the stored value, or `default` when the key is absent.
    pub fn get(&self, key: &str, default: Value) -> Value {
        self.lock_values().get(key).cloned().unwrap_or(default)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut values = self.lock_values();
        values.insert(key.to_string(), value);
        debug!(key, "setting updated");
        write_json_atomic(&self.path, &Value::Object(values.clone())).map_err(SettingsError::Io)
    }

    fn lock_values(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn load_map(path: &Path) -> Result<Map<String, Value>, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::Parse(serde::de::Error::custom(
                "settings root must be a JSON object",
            ))),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Map::new()),
        Err(err) => Err(SettingsError::Io(err)),
    }
}
