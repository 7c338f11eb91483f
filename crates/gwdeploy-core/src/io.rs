//! Filesystem helpers for the deployment root.

use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `data` in one rename. The temporary file lives next to
/// the target so the rename never crosses filesystems.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    ensure_dir(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(Into::into)
}

/// Scaffolding write: creates `path` only when nothing is there yet.
/// Returns whether the file was created.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.try_exists()? {
        return Ok(false);
    }
    atomic_write(path, data).map(|()| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_content_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".gwdeploy/nested/gwdeploy.yaml");
        atomic_write(&path, b"version: 1").unwrap();
        atomic_write(&path, b"version: 2").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "version: 2");

        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn write_if_missing_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("README.md");
        assert!(write_if_missing(&path, b"scaffold").unwrap());
        std::fs::write(&path, b"edited by operator").unwrap();
        assert!(!write_if_missing(&path, b"scaffold").unwrap());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "edited by operator"
        );
    }
}
