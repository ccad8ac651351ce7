use std::{fs, io, path::Path};

use flate2::read::GzDecoder;
use uuid::Uuid;

use crate::error::ExtractError;

/// Unpacks a gzip-compressed tar archive into a fresh staging directory,
/// then promotes every top-level entry into the tools directory. Promotion
/// replaces same-named entries, so reinstalling a tool overwrites it. On
/// any failure the staging directory is removed and the tools directory is
/// left as it was.
pub(crate) fn extract_archive(
    bytes: &[u8],
    staging_root: &Path,
    tools_dir: &Path,
) -> Result<Vec<String>, ExtractError> {
    let staging = staging_root.join(format!("install-{}", Uuid::new_v4()));
    fs::create_dir_all(&staging).map_err(ExtractError::Io)?;

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    if let Err(err) = archive.unpack(&staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(ExtractError::Archive(err));
    }

    match promote_staged(&staging, tools_dir) {
        Ok(promoted) => {
            let _ = fs::remove_dir_all(&staging);
            Ok(promoted)
        }
        Err(err) => {
            let _ = fs::remove_dir_all(&staging);
            Err(err)
        }
    }
}

fn promote_staged(staging: &Path, tools_dir: &Path) -> Result<Vec<String>, ExtractError> {
    fs::create_dir_all(tools_dir).map_err(ExtractError::Io)?;
    let mut promoted = Vec::new();
    let entries = fs::read_dir(staging).map_err(ExtractError::Io)?;
    for entry in entries {
        let entry = entry.map_err(ExtractError::Io)?;
        let name = entry.file_name();
        let dest = tools_dir.join(&name);
        remove_existing(&dest).map_err(ExtractError::Io)?;
        rename_or_copy(&entry.path(), &dest).map_err(ExtractError::Io)?;
        promoted.push(name.to_string_lossy().into_owned());
    }
    promoted.sort();
    Ok(promoted)
}

fn remove_existing(dest: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(dest),
        Ok(_) => fs::remove_file(dest),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn rename_or_copy(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => copy_recursive(src, dest),
        Err(err) => Err(err),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EXDEV))
}

fn copy_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dest).map(|_| ())
    }
}

/// Builds a minimal gzip-compressed tool tarball for tests.
#[cfg(test)]
pub(crate) fn tool_tarball(tool_dir_name: &str, version: &str) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn append_file<W: std::io::Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).expect("append");
    }

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let vdf = format!(
        "\"compatibilitytools\"\n{{\n  \"compat_tools\"\n  {{\n    \"{tool_dir_name}\"\n    {{\n      \"display_name\" \"{tool_dir_name} (test)\"\n    }}\n  }}\n}}\n"
    );
    append_file(
        &mut builder,
        &format!("{tool_dir_name}/compatibilitytool.vdf"),
        vdf.as_bytes(),
    );
    append_file(
        &mut builder,
        &format!("{tool_dir_name}/version"),
        format!("{version} {tool_dir_name}\n").as_bytes(),
    );
    builder.into_inner().expect("tar").finish().expect("gzip")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_into_tools_dir_and_cleans_staging() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let staging_root = scratch.path().join("staging");
        let tools_dir = scratch.path().join("compatibilitytools.d");

        let archive = tool_tarball("GE-Proton9-1", "9.1");
        let promoted = extract_archive(&archive, &staging_root, &tools_dir).expect("extract");

        assert_eq!(promoted, vec!["GE-Proton9-1".to_string()]);
        assert!(tools_dir.join("GE-Proton9-1/compatibilitytool.vdf").is_file());
        assert!(tools_dir.join("GE-Proton9-1/version").is_file());
        // Staging is empty again after promotion.
        let leftovers: Vec<_> = fs::read_dir(&staging_root)
            .map(|it| it.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn reinstall_replaces_the_existing_tool_dir() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let staging_root = scratch.path().join("staging");
        let tools_dir = scratch.path().join("compatibilitytools.d");

        extract_archive(&tool_tarball("GE-Proton9-1", "9.1"), &staging_root, &tools_dir)
            .expect("first install");
        extract_archive(&tool_tarball("GE-Proton9-1", "9.2"), &staging_root, &tools_dir)
            .expect("reinstall");

        let version = fs::read_to_string(tools_dir.join("GE-Proton9-1/version")).expect("read");
        assert!(version.starts_with("9.2 "));
    }

    #[test]
    fn garbage_input_fails_and_leaves_tools_dir_untouched() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let staging_root = scratch.path().join("staging");
        let tools_dir = scratch.path().join("compatibilitytools.d");

        let err = extract_archive(b"definitely not a tarball", &staging_root, &tools_dir)
            .expect_err("should fail");
        assert!(matches!(err, ExtractError::Archive(_)));
        assert!(!tools_dir.exists() || fs::read_dir(&tools_dir).expect("dir").next().is_none());
        let leftovers: Vec<_> = fs::read_dir(&staging_root)
            .map(|it| it.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "staging cleaned up on failure");
    }

    #[test]
    fn truncated_archive_fails() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let full = tool_tarball("GE-Proton9-1", "9.1");
        let truncated = &full[..full.len() / 2];
        let err = extract_archive(
            truncated,
            &scratch.path().join("staging"),
            &scratch.path().join("tools"),
        )
        .expect_err("should fail");
        assert!(matches!(err, ExtractError::Archive(_)));
    }
}
