//! Declarative stage definitions.
//!
//! Stages describe WHAT state the target should reach as a list of [`Op`]s;
//! the [`executor`](crate::executor) decides HOW, checking each op's target
//! state before acting so every stage is safe to re-run.
//!
//! # Example
//!
//! ```rust
//! use sonjayos_provision::component::{dir, write_file, Op, Phase, Stage};
//! use sonjayos_provision::config::ProvisionContext;
//! use anyhow::Result;
//!
//! struct Motd;
//!
//! impl Stage for Motd {
//!     fn name(&self) -> &str { "motd" }
//!     fn phase(&self) -> Phase { Phase::Configuration }
//!     fn ops(&self, _ctx: &ProvisionContext) -> Result<Vec<Op>> {
//!         Ok(vec![
//!             dir("etc/motd.d"),
//!             write_file("etc/motd.d/sonjayos", "Welcome to SonjayOS\n"),
//!         ])
//!     }
//! }
//! ```

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::ProvisionContext;
use crate::documents::ConfigDocument;
use crate::process::Cmd;
use crate::service::ServiceDescriptor;

/// One provisioning step.
///
/// Stages are static: the graph never depends on the mode, only the content
/// of the ops they produce does.
pub trait Stage {
    /// Name for logging, prerequisites and run records.
    fn name(&self) -> &str;

    /// Ordering hint used to break ties between independent stages.
    fn phase(&self) -> Phase;

    /// Names of stages that must complete before this one.
    fn requires(&self) -> &[&'static str] {
        &[]
    }

    /// Host tools this stage invokes that the pipeline cannot install itself,
    /// as `(command, package)` pairs.
    fn tools(&self) -> &[(&'static str, &'static str)] {
        &[]
    }

    /// A failing advisory stage is reported as a warning instead of aborting.
    fn advisory(&self) -> bool {
        false
    }

    /// Operations to converge the target. An empty list means the stage does
    /// not apply to this configuration and is reported as skipped. Fails only
    /// when the desired state cannot be described (an invalid document).
    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>>;
}

impl fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name())
            .field("phase", &self.phase())
            .finish()
    }
}

/// Provisioning phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Host detection and requirement checks.
    Detect = 1,
    /// Package sources.
    Repositories = 2,
    /// System packages.
    Packages = 3,
    /// Service account.
    Accounts = 4,
    /// Directory layout.
    Layout = 5,
    /// Language runtimes and models.
    Runtimes = 6,
    /// Configuration documents.
    Configuration = 7,
    /// Service unit registration.
    Services = 8,
    /// Enabling units at boot.
    Enable = 9,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Detect => write!(f, "Detect"),
            Phase::Repositories => write!(f, "Repositories"),
            Phase::Packages => write!(f, "Packages"),
            Phase::Accounts => write!(f, "Accounts"),
            Phase::Layout => write!(f, "Layout"),
            Phase::Runtimes => write!(f, "Runtimes"),
            Phase::Configuration => write!(f, "Configuration"),
            Phase::Services => write!(f, "Services"),
            Phase::Enable => write!(f, "Enable"),
        }
    }
}

/// A host property checked before anything is changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// `ID` / `VERSION_ID` from os-release must match one of the lists.
    Os { ids: Vec<String>, versions: Vec<String> },
    Arch(Vec<String>),
    Memory { min_mb: u64, advisory: bool },
    /// Free space on the filesystem holding `path` (root-relative).
    Disk { path: String, min_mb: u64, advisory: bool },
}

/// Test that decides whether a [`Op::Command`] already reached its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// A tool is on `PATH`.
    ToolExists(String),
    /// A root-relative path exists.
    PathExists(String),
    /// The command exits zero.
    Succeeds(Cmd),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    // ─────────────────────────────────────────────────────────────────────
    // Host checks
    // ─────────────────────────────────────────────────────────────────────
    Require(Requirement),

    // ─────────────────────────────────────────────────────────────────────
    // Filesystem (paths are relative to the target root)
    // ─────────────────────────────────────────────────────────────────────
    Dir(String),
    DirMode(String, u32),
    WriteFile(String, String),
    WriteFileMode(String, String, u32),
    Document(ConfigDocument),

    // ─────────────────────────────────────────────────────────────────────
    // Accounts
    // ─────────────────────────────────────────────────────────────────────
    Group {
        name: String,
    },
    User {
        name: String,
        group: String,
        home: String,
        shell: String,
    },
    /// Owner of a root-relative path, resolved against the root's account files.
    Chown {
        path: String,
        user: String,
        group: String,
    },
    /// Group of a root-relative path; the owning user is left alone.
    Chgrp {
        path: String,
        group: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Package managers
    // ─────────────────────────────────────────────────────────────────────
    /// `etc/apt/sources.list.d/<name>.list` containing `line`.
    AptSource {
        name: String,
        line: String,
    },
    AptPackages(Vec<String>),
    /// Python virtualenv at a root-relative path.
    Venv(String),
    PipPackages {
        venv: String,
        packages: Vec<String>,
    },
    NpmGlobal(Vec<String>),
    OllamaModels(Vec<String>),

    /// Mirror a host directory into a root-relative one, pruning files the
    /// source no longer has.
    SyncTree {
        source: PathBuf,
        dest: String,
    },

    /// Anything else: run `run` unless `unless` already holds.
    Command {
        label: String,
        unless: Option<Condition>,
        run: Cmd,
    },

    // ─────────────────────────────────────────────────────────────────────
    // systemd
    // ─────────────────────────────────────────────────────────────────────
    Unit(ServiceDescriptor),
    /// Reload unit files; only runs when a unit changed earlier in the stage.
    DaemonReload,
    EnableUnit(String),
}

impl Op {
    /// Short label for logs and run records.
    pub fn describe(&self) -> String {
        match self {
            Op::Require(req) => format!("require {req:?}"),
            Op::Dir(path) | Op::DirMode(path, _) => format!("dir {path}"),
            Op::WriteFile(path, _) | Op::WriteFileMode(path, _, _) => format!("file {path}"),
            Op::Document(doc) => format!("{} {}", doc.format, doc.path),
            Op::Group { name } => format!("group {name}"),
            Op::User { name, .. } => format!("user {name}"),
            Op::Chown { path, user, group } => format!("chown {user}:{group} {path}"),
            Op::Chgrp { path, group } => format!("chgrp {group} {path}"),
            Op::SyncTree { dest, .. } => format!("sync {dest}"),
            Op::AptSource { name, .. } => format!("apt source {name}"),
            Op::AptPackages(pkgs) => format!("apt {}", pkgs.join(" ")),
            Op::Venv(path) => format!("venv {path}"),
            Op::PipPackages { packages, .. } => format!("pip {}", packages.join(" ")),
            Op::NpmGlobal(pkgs) => format!("npm -g {}", pkgs.join(" ")),
            Op::OllamaModels(models) => format!("ollama {}", models.join(" ")),
            Op::Command { label, .. } => label.clone(),
            Op::Unit(svc) => format!("unit {}", svc.unit_name()),
            Op::DaemonReload => "systemctl daemon-reload".to_string(),
            Op::EnableUnit(unit) => format!("enable {unit}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable stage definitions
// ─────────────────────────────────────────────────────────────────────────────

pub fn dir(path: impl Into<String>) -> Op {
    Op::Dir(path.into())
}

pub fn dir_mode(path: impl Into<String>, mode: u32) -> Op {
    Op::DirMode(path.into(), mode)
}

pub fn write_file(path: impl Into<String>, content: impl Into<String>) -> Op {
    Op::WriteFile(path.into(), content.into())
}

pub fn write_file_mode(path: impl Into<String>, content: impl Into<String>, mode: u32) -> Op {
    Op::WriteFileMode(path.into(), content.into(), mode)
}

pub fn group(name: impl Into<String>) -> Op {
    Op::Group { name: name.into() }
}

pub fn user(
    name: impl Into<String>,
    group: impl Into<String>,
    home: impl Into<String>,
    shell: impl Into<String>,
) -> Op {
    Op::User {
        name: name.into(),
        group: group.into(),
        home: home.into(),
        shell: shell.into(),
    }
}

pub fn apt(packages: impl IntoIterator<Item = impl Into<String>>) -> Op {
    Op::AptPackages(packages.into_iter().map(Into::into).collect())
}

pub fn enable(unit: impl Into<String>) -> Op {
    Op::EnableUnit(unit.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ProvisionConfig};

    struct Layout;

    impl Stage for Layout {
        fn name(&self) -> &str {
            "layout"
        }
        fn phase(&self) -> Phase {
            Phase::Layout
        }
        fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
            Ok(vec![dir(ctx.config.layout.config_dir.clone())])
        }
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Detect < Phase::Packages);
        assert!(Phase::Packages < Phase::Accounts);
        assert!(Phase::Configuration < Phase::Services);
        assert!(Phase::Services < Phase::Enable);
    }

    #[test]
    fn test_stage_defaults() {
        let stage = Layout;
        assert!(stage.requires().is_empty());
        assert!(stage.tools().is_empty());
        assert!(!stage.advisory());
        let ctx = ProvisionContext::new(ProvisionConfig::default(), Mode::Production);
        assert_eq!(stage.ops(&ctx).unwrap(), vec![Op::Dir("etc/sonjayos".into())]);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(dir_mode("var/lib/x", 0o750), Op::DirMode("var/lib/x".into(), 0o750));
        assert_eq!(
            apt(["curl", "git"]),
            Op::AptPackages(vec!["curl".into(), "git".into()])
        );
        assert_eq!(enable("sonjayos-ai.service").describe(), "enable sonjayos-ai.service");
    }
}
