//! Directory operation handlers: Op::Dir, Op::DirMode
//!
//! Each handler returns `true` when it changed the target.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Handle Op::Dir: Create a directory
pub fn handle_dir(root: &Path, path: &str) -> Result<bool> {
    let full_path = root.join(path.trim_start_matches('/'));
    if full_path.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(&full_path)
        .with_context(|| format!("creating directory '{}'", full_path.display()))?;
    Ok(true)
}

/// Handle Op::DirMode: Create a directory, then set its mode if it differs
pub fn handle_dirmode(root: &Path, path: &str, mode: u32) -> Result<bool> {
    let full_path = root.join(path.trim_start_matches('/'));
    let created = handle_dir(root, path)?;

    let current = fs::metadata(&full_path)
        .with_context(|| format!("reading metadata of '{}'", full_path.display()))?
        .permissions()
        .mode()
        & 0o7777;
    if current == mode {
        return Ok(created);
    }
    fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode {:o} on '{}'", mode, full_path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_handle_dir_creates_nested_structure() {
        let temp = TempDir::new().unwrap();

        assert!(handle_dir(temp.path(), "var/lib/sonjayos/models").unwrap());
        assert!(temp.path().join("var/lib/sonjayos/models").is_dir());
    }

    #[test]
    fn test_handle_dir_idempotent() {
        let temp = TempDir::new().unwrap();

        assert!(handle_dir(temp.path(), "/opt/sonjayos").unwrap());
        assert!(!handle_dir(temp.path(), "/opt/sonjayos").unwrap());
    }

    #[test]
    fn test_handle_dirmode_sets_permissions_once() {
        let temp = TempDir::new().unwrap();

        assert!(handle_dirmode(temp.path(), "var/log/sonjayos", 0o750).unwrap());
        let mode = fs::metadata(temp.path().join("var/log/sonjayos"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);

        assert!(!handle_dirmode(temp.path(), "var/log/sonjayos", 0o750).unwrap());
    }

    #[test]
    fn test_handle_dirmode_fixes_drifted_mode() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("etc/sonjayos");
        fs::create_dir_all(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o777)).unwrap();

        assert!(handle_dirmode(temp.path(), "etc/sonjayos", 0o755).unwrap());
        assert_eq!(fs::metadata(&dir).unwrap().permissions().mode() & 0o777, 0o755);
    }
}
