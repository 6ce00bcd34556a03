//! The provisioning stage catalog.
//!
//! Stage bodies are declarative: each returns the [`Op`]s that describe its
//! target state and the executor converges the host onto it. The set of
//! stages and their order never depend on the mode.

use anyhow::Result;

use crate::component::{apt, dir, dir_mode, enable, group, user, Op, Phase, Condition, Requirement, Stage};
use crate::config::{Mode, ProvisionContext};
use crate::documents::service_documents;
use crate::process::Cmd;
use crate::service;

/// Every stage in declaration order.
pub fn catalog() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(Detect),
        Box::new(Repositories),
        Box::new(SystemPackages),
        Box::new(GpuRuntime),
        Box::new(Accounts),
        Box::new(Layout),
        Box::new(PythonRuntime),
        Box::new(NodeRuntime),
        Box::new(Ollama),
        Box::new(Application),
        Box::new(Configuration),
        Box::new(Services),
        Box::new(Enable),
    ]
}

const APT_TOOLS: &[(&str, &str)] = &[("apt-get", "apt"), ("dpkg-query", "dpkg")];
const SYSTEMD_TOOLS: &[(&str, &str)] = &[("systemctl", "systemd")];

pub struct Detect;

impl Stage for Detect {
    fn name(&self) -> &str {
        "detect"
    }

    fn phase(&self) -> Phase {
        Phase::Detect
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let req = &ctx.config.requirements;
        Ok(vec![
            Op::Require(Requirement::Os {
                ids: req.os_ids.clone(),
                versions: req.os_versions.clone(),
            }),
            Op::Require(Requirement::Arch(req.architectures.clone())),
            Op::Require(Requirement::Memory {
                min_mb: req.required_memory_mb,
                advisory: false,
            }),
            Op::Require(Requirement::Memory {
                min_mb: req.recommended_memory_mb,
                advisory: true,
            }),
            Op::Require(Requirement::Disk {
                path: ctx.config.layout.install_dir.clone(),
                min_mb: req.recommended_disk_mb,
                advisory: true,
            }),
        ])
    }
}

/// Transport prerequisites and third-party apt sources.
pub struct Repositories;

impl Stage for Repositories {
    fn name(&self) -> &str {
        "repositories"
    }

    fn phase(&self) -> Phase {
        Phase::Repositories
    }

    fn requires(&self) -> &[&'static str] {
        &["detect"]
    }

    fn tools(&self) -> &[(&'static str, &'static str)] {
        APT_TOOLS
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let mut ops = vec![apt(["ca-certificates", "gnupg", "curl"])];
        if ctx.config.gpu.rocm {
            ops.push(Op::AptSource {
                name: "rocm".into(),
                line: ctx.config.gpu.rocm_repository.clone(),
            });
        }
        Ok(ops)
    }
}

pub struct SystemPackages;

impl Stage for SystemPackages {
    fn name(&self) -> &str {
        "system-packages"
    }

    fn phase(&self) -> Phase {
        Phase::Packages
    }

    fn requires(&self) -> &[&'static str] {
        &["repositories"]
    }

    fn tools(&self) -> &[(&'static str, &'static str)] {
        APT_TOOLS
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let packages = &ctx.config.packages.apt;
        Ok(if packages.is_empty() {
            Vec::new()
        } else {
            vec![Op::AptPackages(packages.clone())]
        })
    }
}

/// ROCm runtime for AMD GPUs. Hosts without a supported GPU still provision.
pub struct GpuRuntime;

impl Stage for GpuRuntime {
    fn name(&self) -> &str {
        "gpu-runtime"
    }

    fn phase(&self) -> Phase {
        Phase::Packages
    }

    fn requires(&self) -> &[&'static str] {
        &["repositories"]
    }

    fn tools(&self) -> &[(&'static str, &'static str)] {
        APT_TOOLS
    }

    fn advisory(&self) -> bool {
        true
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let gpu = &ctx.config.gpu;
        Ok(if gpu.rocm && !gpu.rocm_packages.is_empty() {
            vec![Op::AptPackages(gpu.rocm_packages.clone())]
        } else {
            Vec::new()
        })
    }
}

/// Per-concern document directories below each mode's document root.
const DOCUMENT_DIRS: &[&str] = &["ai", "ui", "kernel", "dev_tools"];
/// Holds the security monitor's config; readable by the service group only.
const SECURITY_DIR: &str = "security";

/// System account the production services run as, and the directories it owns.
pub struct Accounts;

impl Stage for Accounts {
    fn name(&self) -> &str {
        "accounts"
    }

    fn phase(&self) -> Phase {
        Phase::Accounts
    }

    fn requires(&self) -> &[&'static str] {
        &["detect"]
    }

    fn tools(&self) -> &[(&'static str, &'static str)] {
        &[("groupadd", "passwd"), ("useradd", "passwd")]
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let account = &ctx.config.account;
        let layout = &ctx.config.layout;
        let mut ops = vec![
            group(&account.group),
            user(&account.user, &account.group, &account.home, &account.shell),
        ];
        for path in [&layout.log_dir, &layout.state_dir] {
            ops.push(dir_mode(path, 0o750));
            ops.push(Op::Chown {
                path: path.clone(),
                user: account.user.clone(),
                group: account.group.clone(),
            });
        }
        // Owner stays root; the service group may only read.
        for mode in Mode::ALL {
            let path = format!("{}/{SECURITY_DIR}", ctx.config.documents_dir(mode));
            ops.push(dir_mode(&path, 0o750));
            ops.push(Op::Chgrp {
                path,
                group: account.group.clone(),
            });
        }
        Ok(ops)
    }
}

pub struct Layout;

impl Stage for Layout {
    fn name(&self) -> &str {
        "layout"
    }

    fn phase(&self) -> Phase {
        Phase::Layout
    }

    fn requires(&self) -> &[&'static str] {
        &["detect", "accounts"]
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let layout = &ctx.config.layout;
        let mut ops = vec![dir(&layout.config_dir)];
        for mode in Mode::ALL {
            let docs = ctx.config.documents_dir(mode);
            ops.push(dir(&docs));
            ops.extend(DOCUMENT_DIRS.iter().map(|sub| dir(format!("{docs}/{sub}"))));
            ops.push(dir_mode(format!("{docs}/{SECURITY_DIR}"), 0o750));
        }
        ops.extend([
            dir(&layout.install_dir),
            dir(&layout.log_dir),
            dir(&layout.state_dir),
            dir(format!("{}/pids", layout.state_dir)),
        ]);
        Ok(ops)
    }
}

pub struct PythonRuntime;

impl Stage for PythonRuntime {
    fn name(&self) -> &str {
        "python-runtime"
    }

    fn phase(&self) -> Phase {
        Phase::Runtimes
    }

    fn requires(&self) -> &[&'static str] {
        &["system-packages", "layout"]
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let venv = format!("{}/venv", ctx.config.layout.install_dir);
        let mut ops = vec![Op::Venv(venv.clone())];
        if !ctx.config.packages.pip.is_empty() {
            ops.push(Op::PipPackages {
                venv,
                packages: ctx.config.packages.pip.clone(),
            });
        }
        Ok(ops)
    }
}

pub struct NodeRuntime;

impl Stage for NodeRuntime {
    fn name(&self) -> &str {
        "node-runtime"
    }

    fn phase(&self) -> Phase {
        Phase::Runtimes
    }

    fn requires(&self) -> &[&'static str] {
        &["system-packages"]
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let packages = &ctx.config.packages.npm;
        Ok(if packages.is_empty() {
            Vec::new()
        } else {
            vec![Op::NpmGlobal(packages.clone())]
        })
    }
}

/// Ollama runtime and the local models the AI service loads.
pub struct Ollama;

impl Stage for Ollama {
    fn name(&self) -> &str {
        "ollama"
    }

    fn phase(&self) -> Phase {
        Phase::Runtimes
    }

    fn requires(&self) -> &[&'static str] {
        &["system-packages"]
    }

    fn tools(&self) -> &[(&'static str, &'static str)] {
        &[("sh", "dash")]
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let packages = &ctx.config.packages;
        let mut ops = vec![Op::Command {
            label: "install ollama".into(),
            unless: Some(Condition::ToolExists("ollama".into())),
            run: Cmd::new("sh")
                .args(["-c", &format!("curl -fsSL {} | sh", packages.ollama_install_url)])
                .error_msg("ollama installer failed"),
        }];
        // Pulling needs a running server; a staging tree has none.
        if ctx.config.targets_host() && !packages.ollama_models.is_empty() {
            ops.push(Op::Command {
                label: "start ollama.service".into(),
                unless: Some(Condition::Succeeds(
                    Cmd::new("systemctl").args(["is-active", "--quiet", "ollama.service"]),
                )),
                run: Cmd::new("systemctl").args(["start", "ollama.service"]),
            });
            ops.push(Op::OllamaModels(packages.ollama_models.clone()));
        }
        Ok(ops)
    }
}

/// The service code the units run, mirrored into the install dir.
pub struct Application;

impl Stage for Application {
    fn name(&self) -> &str {
        "application"
    }

    fn phase(&self) -> Phase {
        Phase::Runtimes
    }

    fn requires(&self) -> &[&'static str] {
        &["layout"]
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        Ok(match &ctx.config.application.source_dir {
            Some(source) => vec![Op::SyncTree {
                source: source.clone(),
                dest: ctx.config.app_dir(),
            }],
            None => Vec::new(),
        })
    }
}

/// Per-service JSON documents and the environment file, for both modes.
pub struct Configuration;

impl Stage for Configuration {
    fn name(&self) -> &str {
        "configuration"
    }

    fn phase(&self) -> Phase {
        Phase::Configuration
    }

    fn requires(&self) -> &[&'static str] {
        &["layout"]
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        Ok(service_documents(ctx)?
            .into_iter()
            .map(Op::Document)
            .collect())
    }
}

/// systemd units for every long-running service.
pub struct Services;

impl Stage for Services {
    fn name(&self) -> &str {
        "services"
    }

    fn phase(&self) -> Phase {
        Phase::Services
    }

    fn requires(&self) -> &[&'static str] {
        &["accounts", "python-runtime", "application", "configuration"]
    }

    fn tools(&self) -> &[(&'static str, &'static str)] {
        SYSTEMD_TOOLS
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        let mut ops: Vec<Op> = service::catalog(ctx).into_iter().map(Op::Unit).collect();
        ops.push(Op::DaemonReload);
        Ok(ops)
    }
}

pub struct Enable;

impl Stage for Enable {
    fn name(&self) -> &str {
        "enable"
    }

    fn phase(&self) -> Phase {
        Phase::Enable
    }

    fn requires(&self) -> &[&'static str] {
        &["services"]
    }

    fn tools(&self) -> &[(&'static str, &'static str)] {
        SYSTEMD_TOOLS
    }

    fn ops(&self, ctx: &ProvisionContext) -> Result<Vec<Op>> {
        Ok(service::catalog(ctx)
            .iter()
            .map(|svc| enable(svc.unit_name()))
            .collect())
    }
}
