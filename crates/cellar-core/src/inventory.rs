use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::InventoryError;
use crate::vdf;

/// One tool found on disk in the tools directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledTool {
    /// Internal name from the tool's descriptor, the key Steam matches on.
    pub internal_name: String,
    /// Human-facing name; equal to the internal name when the descriptor
    /// carries no display name.
    pub display_name: String,
    /// Directory name under the tools directory.
    pub directory: String,
    /// Contents of the tool's `version` marker file, when present.
    pub version: Option<String>,
}

/// Scans the tools directory for installed compatibility tools. Directories
/// without a parseable `compatibilitytool.vdf` descriptor are skipped with a
/// warning. A missing tools directory is the same as an empty one.
pub fn scan_installed(tools_dir: &Path) -> Result<Vec<InstalledTool>, InventoryError> {
    let entries = match fs::read_dir(tools_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(InventoryError::Io {
                path: tools_dir.to_path_buf(),
                source: err,
            })
        }
    };

    let mut tools = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| InventoryError::Io {
            path: tools_dir.to_path_buf(),
            source: err,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let directory = entry.file_name().to_string_lossy().into_owned();
        let descriptor_path = path.join("compatibilitytool.vdf");
        let descriptor = match vdf::read_descriptor(&descriptor_path) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                warn!(directory = %directory, "skipping tool dir with unreadable descriptor");
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                warn!(directory = %directory, error = %err, "skipping tool dir");
                continue;
            }
        };
        tools.push(InstalledTool {
            internal_name: descriptor.internal_name,
            display_name: descriptor.display_name,
            version: read_version_marker(&path.join("version")),
            directory,
        });
    }
    tools.sort_by(|a, b| a.internal_name.cmp(&b.internal_name));
    Ok(tools)
}

/// Resolves the on-disk directory of an installed tool by internal name.
pub fn tool_directory(
    tools_dir: &Path,
    internal_name: &str,
) -> Result<std::path::PathBuf, InventoryError> {
    let tools = scan_installed(tools_dir)?;
    let tool = tools
        .into_iter()
        .find(|tool| tool.internal_name == internal_name)
        .ok_or_else(|| InventoryError::UnknownTool(internal_name.to_string()))?;
    Ok(tools_dir.join(tool.directory))
}

/// The version marker holds a short line like `9.1 GE-Proton9-1`; the first
/// whitespace-separated token is the version.
pub(crate) fn read_version_marker(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let first_line = raw.lines().next()?;
    let token = first_line.split_whitespace().next()?;
    Some(token.to_string())
}
