//! systemd handlers: Op::Unit, Op::DaemonReload, Op::EnableUnit
//!
//! Unit files land in `<root>/etc/systemd/system`. For roots other than `/`,
//! `systemctl --root` edits the enablement symlinks offline.

use anyhow::Result;
use std::path::Path;

use super::files::handle_writefile;
use crate::process::{Cmd, Runner};
use crate::service::ServiceDescriptor;

pub const UNIT_DIR: &str = "etc/systemd/system";

pub fn systemctl(root: &Path) -> Cmd {
    let cmd = Cmd::new("systemctl");
    if root == Path::new("/") {
        cmd
    } else {
        cmd.arg(format!("--root={}", root.display()))
    }
}

/// Handle Op::Unit: write the rendered unit if it differs
pub fn write_unit(root: &Path, service: &ServiceDescriptor) -> Result<bool> {
    let path = format!("{UNIT_DIR}/{}", service.unit_name());
    handle_writefile(root, &path, &service.render_unit())
}

/// Handle Op::DaemonReload. Offline roots have no manager to reload.
pub fn daemon_reload(runner: &dyn Runner, root: &Path) -> Result<bool> {
    if root != Path::new("/") {
        return Ok(false);
    }
    Cmd::new("systemctl")
        .arg("daemon-reload")
        .error_msg("reloading systemd units")
        .run_with(runner)?;
    Ok(true)
}

pub fn is_enabled(runner: &dyn Runner, root: &Path, unit: &str) -> Result<bool> {
    let out = systemctl(root)
        .args(["is-enabled", unit])
        .allow_fail()
        .run_with(runner)?;
    Ok(out.success() && out.stdout.trim() == "enabled")
}

/// Handle Op::EnableUnit: enable at boot unless already enabled
pub fn enable_unit(runner: &dyn Runner, root: &Path, unit: &str) -> Result<bool> {
    if is_enabled(runner, root, unit)? {
        return Ok(false);
    }
    systemctl(root)
        .args(["enable", unit])
        .error_msg(format!("enabling {unit}"))
        .run_with(runner)?;
    Ok(true)
}
