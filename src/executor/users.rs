//! Account and ownership handlers: Op::User, Op::Group, Op::Chown, Op::Chgrp
//!
//! Existence is read from `<root>/etc/passwd` and `<root>/etc/group`; the
//! shadow-utils tools only run for accounts that are absent.

use anyhow::{bail, Context, Result};
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::process::{Cmd, Runner};

/// Read a UID/GID pair from the root's passwd file.
///
/// Returns:
/// - Ok(Some((uid, gid))) if user found
/// - Ok(None) if user not found or file doesn't exist
/// - Err if file exists but is corrupted/unreadable
pub fn read_uid_from_rootfs(root: &Path, username: &str) -> Result<Option<(u32, u32)>> {
    let passwd_path = root.join("etc/passwd");

    if !passwd_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&passwd_path)
        .with_context(|| format!("Failed to read passwd file at {}", passwd_path.display()))?;

    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 4 && parts[0] == username {
            let uid: u32 = parts[2].parse().with_context(|| {
                format!(
                    "Corrupted passwd file: invalid UID '{}' for user '{}' at {}",
                    parts[2],
                    username,
                    passwd_path.display()
                )
            })?;
            let gid: u32 = parts[3].parse().with_context(|| {
                format!(
                    "Corrupted passwd file: invalid GID '{}' for user '{}' at {}",
                    parts[3],
                    username,
                    passwd_path.display()
                )
            })?;
            return Ok(Some((uid, gid)));
        }
    }
    Ok(None)
}

/// Read a GID from the root's group file.
pub fn read_gid_from_rootfs(root: &Path, groupname: &str) -> Result<Option<u32>> {
    let group_path = root.join("etc/group");

    if !group_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&group_path)
        .with_context(|| format!("Failed to read group file at {}", group_path.display()))?;

    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == groupname {
            let gid: u32 = parts[2].parse().with_context(|| {
                format!(
                    "Corrupted group file: invalid GID '{}' for group '{}' at {}",
                    parts[2],
                    groupname,
                    group_path.display()
                )
            })?;
            return Ok(Some(gid));
        }
    }
    Ok(None)
}

/// `--prefix <root>` for roots other than `/`.
fn prefixed(cmd: Cmd, root: &Path) -> Cmd {
    if root == Path::new("/") {
        cmd
    } else {
        cmd.arg("--prefix").arg_path(root)
    }
}

/// Handle Op::Group: create a system group unless present
pub fn ensure_group(runner: &dyn Runner, root: &Path, name: &str) -> Result<bool> {
    if read_gid_from_rootfs(root, name)?.is_some() {
        return Ok(false);
    }
    let cmd = prefixed(Cmd::new("groupadd").arg("--system"), root)
        .arg(name)
        .error_msg(format!("creating group '{name}'"));
    cmd.run_with(runner)?;
    Ok(true)
}

/// Handle Op::User: create a system user unless present
pub fn ensure_user(
    runner: &dyn Runner,
    root: &Path,
    name: &str,
    group: &str,
    home: &str,
    shell: &str,
) -> Result<bool> {
    if read_uid_from_rootfs(root, name)?.is_some() {
        return Ok(false);
    }
    let cmd = prefixed(Cmd::new("useradd").arg("--system"), root)
        .args(["--gid", group, "--home-dir", home, "--no-create-home", "--shell", shell])
        .arg(name)
        .error_msg(format!("creating user '{name}'"));
    cmd.run_with(runner)?;
    Ok(true)
}

/// Handle Op::Chown: give `path` to `user:group` as resolved inside the root
pub fn ensure_owner(root: &Path, path: &str, user: &str, group: &str) -> Result<bool> {
    let full_path = root.join(path.trim_start_matches('/'));
    let Some((uid, _)) = read_uid_from_rootfs(root, user)? else {
        bail!("user '{}' does not exist in {}", user, root.display());
    };
    let Some(gid) = read_gid_from_rootfs(root, group)? else {
        bail!("group '{}' does not exist in {}", group, root.display());
    };

    let meta = fs::metadata(&full_path)
        .with_context(|| format!("reading metadata of '{}'", full_path.display()))?;
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(false);
    }
    chown(
        &full_path,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
    )
    .with_context(|| format!("changing owner of '{}' to {user}:{group}", full_path.display()))?;
    Ok(true)
}

/// Handle Op::Chgrp: give `path` to `group`, keeping its owning user
pub fn ensure_group_owner(root: &Path, path: &str, group: &str) -> Result<bool> {
    let full_path = root.join(path.trim_start_matches('/'));
    let Some(gid) = read_gid_from_rootfs(root, group)? else {
        bail!("group '{}' does not exist in {}", group, root.display());
    };

    let meta = fs::metadata(&full_path)
        .with_context(|| format!("reading metadata of '{}'", full_path.display()))?;
    if meta.gid() == gid {
        return Ok(false);
    }
    chown(&full_path, None, Some(Gid::from_raw(gid)))
        .with_context(|| format!("changing group of '{}' to {group}", full_path.display()))?;
    Ok(true)
}
