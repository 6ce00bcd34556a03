//! Preflight checks.
//!
//! Validates that the host has the tools the pipeline shells out to and that
//! it meets the platform requirements, before anything is changed.
//!
//! # Example
//!
//! ```rust,ignore
//! use sonjayos_provision::preflight::{check_required_tools, HostFacts};
//! use sonjayos_provision::process::SystemRunner;
//!
//! check_required_tools(&SystemRunner, &[("apt-get", "apt"), ("systemctl", "systemd")])?;
//! let facts = HostFacts::detect(Path::new("/"), Path::new("/opt/sonjayos"))?;
//! println!("{} {} on {}", facts.os_id, facts.os_version, facts.arch);
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sysinfo::System;

use crate::component::Requirement;
use crate::error::{MissingTool, PipelineError};
use crate::process::Runner;

/// Check if a command exists on the host.
pub fn command_exists(runner: &dyn Runner, cmd: &str) -> bool {
    runner.find_tool(cmd).is_some()
}

/// Check that every `(command, package)` pair is available.
///
/// Duplicates are reported once, in first-seen order.
pub fn check_required_tools(
    runner: &dyn Runner,
    tools: &[(&str, &str)],
) -> Result<(), PipelineError> {
    let mut seen = BTreeSet::new();
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !seen.insert(*tool) {
            continue;
        }
        if !command_exists(runner, tool) {
            missing.push(MissingTool {
                command: tool.to_string(),
                package: package.to_string(),
            });
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::MissingTools(missing))
    }
}

/// Observed properties of the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub os_id: String,
    pub os_version: String,
    pub arch: String,
    pub total_memory_mb: u64,
    /// Free space on the filesystem that will hold the install dir.
    pub available_disk_mb: u64,
}

impl HostFacts {
    /// Inspect the host. OS identity comes from `<root>/etc/os-release` so a
    /// staging tree reports the release it contains. Free space is measured
    /// at `disk_path`, or its nearest existing ancestor before it is created.
    pub fn detect(root: &Path, disk_path: &Path) -> Result<Self> {
        let os_release = root.join("etc/os-release");
        let (os_id, os_version) = if os_release.is_file() {
            let raw = fs::read_to_string(&os_release)
                .with_context(|| format!("reading '{}'", os_release.display()))?;
            parse_os_release(&raw)
        } else {
            (String::from("unknown"), String::new())
        };

        let mut sys = System::new();
        sys.refresh_memory();
        let total_memory_mb = sys.total_memory() / (1024 * 1024);

        let measured = nearest_existing(disk_path);
        let available_disk_mb = fs2::available_space(measured)
            .with_context(|| format!("querying free space on '{}'", measured.display()))?
            / (1024 * 1024);

        Ok(Self {
            os_id,
            os_version,
            arch: std::env::consts::ARCH.to_string(),
            total_memory_mb,
            available_disk_mb,
        })
    }
}

/// `path` itself if it exists, else the closest ancestor that does.
fn nearest_existing(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"))
}

/// `(ID, VERSION_ID)` from os-release content, with quotes stripped.
pub fn parse_os_release(raw: &str) -> (String, String) {
    let mut id = String::from("unknown");
    let mut version = String::new();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key.trim() {
            "ID" => id = value.to_string(),
            "VERSION_ID" => version = value.to_string(),
            _ => {}
        }
    }
    (id, version)
}

/// Result of checking one requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Advisory(String),
    Fatal(String),
}

pub fn evaluate(requirement: &Requirement, facts: &HostFacts) -> Verdict {
    match requirement {
        Requirement::Os { ids, versions } => {
            if !ids.is_empty() && !ids.iter().any(|id| id == &facts.os_id) {
                return Verdict::Fatal(format!(
                    "unsupported operating system '{}' (supported: {})",
                    facts.os_id,
                    ids.join(", ")
                ));
            }
            if !versions.is_empty() && !versions.iter().any(|v| v == &facts.os_version) {
                return Verdict::Fatal(format!(
                    "unsupported {} release '{}' (supported: {})",
                    facts.os_id,
                    facts.os_version,
                    versions.join(", ")
                ));
            }
            Verdict::Ok
        }
        Requirement::Arch(archs) => {
            if archs.is_empty() || archs.iter().any(|a| a == &facts.arch) {
                Verdict::Ok
            } else {
                Verdict::Fatal(format!(
                    "unsupported architecture '{}' (supported: {})",
                    facts.arch,
                    archs.join(", ")
                ))
            }
        }
        Requirement::Memory { min_mb, advisory } => {
            if facts.total_memory_mb >= *min_mb {
                return Verdict::Ok;
            }
            let msg = format!(
                "{} MB of memory available, {} MB {}",
                facts.total_memory_mb,
                min_mb,
                if *advisory { "recommended" } else { "required" }
            );
            if *advisory {
                Verdict::Advisory(msg)
            } else {
                Verdict::Fatal(msg)
            }
        }
        Requirement::Disk {
            path,
            min_mb,
            advisory,
        } => {
            if facts.available_disk_mb >= *min_mb {
                return Verdict::Ok;
            }
            let msg = format!(
                "{} MB free on /{}, {} MB {}",
                facts.available_disk_mb,
                path.trim_start_matches('/'),
                min_mb,
                if *advisory { "recommended" } else { "required" }
            );
            if *advisory {
                Verdict::Advisory(msg)
            } else {
                Verdict::Fatal(msg)
            }
        }
    }
}
