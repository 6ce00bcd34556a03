//! Application tree deployment: Op::SyncTree
//!
//! Files are compared before copying, so a second sync of an unchanged tree
//! writes nothing. Files the source no longer has are removed from the
//! destination. Interpreter caches are ignored on both sides.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::files::write_atomic;

const IGNORED: &[&str] = &["__pycache__", ".git"];

/// What one sync changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub copied: usize,
    pub removed: usize,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.copied + self.removed > 0
    }
}

fn ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED.contains(&name))
}

/// Regular files below `dir`, relative to it. A missing `dir` has none.
fn files_under(dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut out = BTreeSet::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !ignored(e))
    {
        let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .with_context(|| format!("'{}' outside '{}'", entry.path().display(), dir.display()))?;
            out.insert(rel.to_path_buf());
        }
    }
    Ok(out)
}

fn matches(path: &Path, bytes: &[u8], mode: u32) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let current = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
    let current_mode = fs::metadata(path)
        .with_context(|| format!("reading metadata of '{}'", path.display()))?
        .permissions()
        .mode()
        & 0o7777;
    Ok(current == bytes && current_mode == mode)
}

/// Handle Op::SyncTree: mirror `source` into `<root>/<dest>`
pub fn sync_tree(source: &Path, root: &Path, dest: &str) -> Result<SyncReport> {
    if !source.is_dir() {
        bail!("application source '{}' is not a directory", source.display());
    }
    let dest_dir = root.join(dest.trim_start_matches('/'));
    let wanted = files_under(source)?;
    let present = files_under(&dest_dir)?;
    let mut report = SyncReport::default();

    for rel in &wanted {
        let from = source.join(rel);
        let to = dest_dir.join(rel);
        let bytes = fs::read(&from).with_context(|| format!("reading '{}'", from.display()))?;
        let mode = fs::metadata(&from)
            .with_context(|| format!("reading metadata of '{}'", from.display()))?
            .permissions()
            .mode()
            & 0o7777;
        if matches(&to, &bytes, mode)? {
            continue;
        }
        write_atomic(&to, &bytes, Some(mode))?;
        report.copied += 1;
    }

    for rel in present.difference(&wanted) {
        let stale = dest_dir.join(rel);
        fs::remove_file(&stale).with_context(|| format!("removing '{}'", stale.display()))?;
        report.removed += 1;
    }

    debug!(
        dest = %dest_dir.display(),
        copied = report.copied,
        removed = report.removed,
        "synced application tree"
    );
    Ok(report)
}
