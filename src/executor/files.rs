//! File operation handlers: Op::WriteFile, Op::WriteFileMode, Op::Document
//!
//! Content is compared before writing; changed files are replaced atomically
//! through a sibling temp file.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Handle Op::WriteFile: Write a file with content
pub fn handle_writefile(root: &Path, path: &str, content: &str) -> Result<bool> {
    let full_path = root.join(path.trim_start_matches('/'));
    if read_existing(&full_path)?.as_deref() == Some(content.as_bytes()) {
        return Ok(false);
    }
    write_atomic(&full_path, content.as_bytes(), None)?;
    Ok(true)
}

/// Handle Op::WriteFileMode: Write a file with specific permissions
pub fn handle_writefilemode(root: &Path, path: &str, content: &str, mode: u32) -> Result<bool> {
    let full_path = root.join(path.trim_start_matches('/'));
    if read_existing(&full_path)?.as_deref() == Some(content.as_bytes()) {
        let current = fs::metadata(&full_path)
            .with_context(|| format!("reading metadata of '{}'", full_path.display()))?
            .permissions()
            .mode()
            & 0o7777;
        if current == mode {
            return Ok(false);
        }
        fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode {:o} on '{}'", mode, full_path.display()))?;
        return Ok(true);
    }
    write_atomic(&full_path, content.as_bytes(), Some(mode))?;
    Ok(true)
}

/// Write `bytes` to `path` via a temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;

    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, bytes).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    if let Some(mode) = mode {
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode {:o} on '{}'", mode, tmp.display()))?;
    }
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>> {
    if !path.is_file() {
        return Ok(None);
    }
    fs::read(path)
        .map(Some)
        .with_context(|| format!("reading '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_handle_writefile_creates_content() {
        let temp = TempDir::new().unwrap();

        assert!(handle_writefile(temp.path(), "etc/sonjayos/motd", "line one\nline two\n").unwrap());

        let written = fs::read_to_string(temp.path().join("etc/sonjayos/motd")).unwrap();
        assert_eq!(written, "line one\nline two\n");
    }

    #[test]
    fn test_handle_writefile_skips_identical_content() {
        let temp = TempDir::new().unwrap();

        assert!(handle_writefile(temp.path(), "a.conf", "x=1\n").unwrap());
        assert!(!handle_writefile(temp.path(), "a.conf", "x=1\n").unwrap());
        assert!(handle_writefile(temp.path(), "a.conf", "x=2\n").unwrap());
        assert_eq!(fs::read_to_string(temp.path().join("a.conf")).unwrap(), "x=2\n");
    }

    #[test]
    fn test_handle_writefilemode_sets_permissions() {
        let temp = TempDir::new().unwrap();

        handle_writefilemode(temp.path(), "secret.json", "{}", 0o640).unwrap();

        let mode = fs::metadata(temp.path().join("secret.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_handle_writefilemode_repairs_mode_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("secret.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        assert!(handle_writefilemode(temp.path(), "secret.json", "{}", 0o600).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
        assert!(!handle_writefilemode(temp.path(), "secret.json", "{}", 0o600).unwrap());
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();

        write_atomic(&temp.path().join("out/data.json"), b"[]", None).unwrap();

        let names: Vec<_> = fs::read_dir(temp.path().join("out"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["data.json".to_string()]);
    }
}
