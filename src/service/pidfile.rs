//! Atomic pidfile I/O for development-mode services.
//!
//! Format: two-line text file
//! ```text
//! <pid>
//! <port>
//! ```
//! Port `0` means the service does not listen.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidFileData {
    pub pid: u32,
    pub port: Option<u16>,
}

pub fn pidfile_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pid"))
}

/// Write `<name>.pid` via `<name>.pid.tmp` + rename.
pub fn write_pidfile(dir: &Path, name: &str, pid: u32, port: Option<u16>) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let final_path = pidfile_path(dir, name);
    let temp_path = dir.join(format!("{name}.pid.tmp"));

    fs::write(&temp_path, format!("{}\n{}\n", pid, port.unwrap_or(0)))?;
    fs::rename(&temp_path, &final_path)?;

    Ok(final_path)
}

/// `Ok(None)` when there is no pidfile.
pub fn read_pidfile(dir: &Path, name: &str) -> io::Result<Option<PidFileData>> {
    match fs::read_to_string(pidfile_path(dir, name)) {
        Ok(content) => parse_pidfile_content(&content).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Delete `<name>.pid` (idempotent).
pub fn delete_pidfile(dir: &Path, name: &str) -> io::Result<()> {
    match fs::remove_file(pidfile_path(dir, name)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether a process with this pid exists (signal 0). Zombies awaiting
/// a reap count as gone.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let exists = match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    };
    exists && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

fn parse_pidfile_content(content: &str) -> io::Result<PidFileData> {
    let mut lines = content.lines();

    let pid = lines
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing or invalid PID"))?;

    let port = lines
        .next()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing or invalid port"))?;

    Ok(PidFileData {
        pid,
        port: (port != 0).then_some(port),
    })
}
