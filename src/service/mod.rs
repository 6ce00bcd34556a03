//! Long-running SonjayOS services: what they are, and how they are started,
//! observed and torn down.
//!
//! Two supervisors implement [`Supervisor`]:
//! - [`SystemdSupervisor`] for production, driving installed units.
//! - [`ProcessSupervisor`] for development, owning the service processes
//!   directly in their own process groups.

pub mod health;
pub mod pidfile;
pub mod process;
pub mod systemd;
mod unit;

use std::collections::BTreeMap;
use std::fmt;

use tracing::{info, warn};

use crate::config::{Mode, ProvisionContext};
use crate::error::PipelineError;
use crate::graph::topo_order;

pub use process::ProcessSupervisor;
pub use systemd::SystemdSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    Always,
    OnFailure,
    No,
}

impl Restart {
    pub fn as_systemd(self) -> &'static str {
        match self {
            Restart::Always => "always",
            Restart::OnFailure => "on-failure",
            Restart::No => "no",
        }
    }
}

/// Everything needed to run one service, under systemd or directly.
///
/// Paths are absolute on the target system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub description: String,
    pub exec: Vec<String>,
    pub working_dir: String,
    pub user: String,
    pub group: String,
    pub restart: Restart,
    pub restart_sec: u64,
    /// Units this one starts after. In-set `<name>.service` entries also
    /// order [`start_order`].
    pub after: Vec<String>,
    pub wants: Vec<String>,
    pub environment_file: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub port: Option<u16>,
    pub health_path: Option<String>,
}

impl ServiceDescriptor {
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    pub fn render_unit(&self) -> String {
        unit::render(self)
    }
}

/// The SonjayOS services.
///
/// The mode only changes argv flags; names, ports and ordering are fixed.
pub fn catalog(ctx: &ProvisionContext) -> Vec<ServiceDescriptor> {
    let cfg = &ctx.config;
    let abs = |rel: &str| format!("/{}", rel.trim_start_matches('/'));
    let install_dir = abs(&cfg.layout.install_dir);
    let python = format!("{install_dir}/venv/bin/python");
    let env_file = format!("{}/sonjayos.env", abs(&cfg.documents_dir(ctx.mode)));
    let dev = ctx.mode == Mode::Development;
    let s = &ctx.settings;

    let base = |name: &str, description: &str, module: &str| ServiceDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        exec: vec![python.clone(), "-m".into(), module.to_string()],
        working_dir: install_dir.clone(),
        user: cfg.account.user.clone(),
        group: cfg.account.group.clone(),
        restart: Restart::Always,
        restart_sec: 10,
        after: vec!["network-online.target".into()],
        wants: vec!["network-online.target".into()],
        environment_file: Some(env_file.clone()),
        environment: BTreeMap::from([("PYTHONPATH".to_string(), install_dir.clone())]),
        port: None,
        health_path: None,
    };

    let mut ai = base("sonjayos-ai", "SonjayOS AI Service", "src.ai.main");
    ai.exec
        .extend(["--port".to_string(), cfg.services.ai_port.to_string()]);
    if dev {
        ai.exec.push("--dev-mode".into());
    }
    if s.debug {
        ai.exec.push("--debug".into());
    }
    if s.mock_ai {
        ai.exec.push("--mock-ai".into());
    }
    ai.after.push(format!("{OLLAMA}.service"));
    ai.wants.push(format!("{OLLAMA}.service"));
    ai.port = Some(cfg.services.ai_port);
    ai.health_path = Some(cfg.services.health_path.clone());

    let mut ui = base("sonjayos-ui", "SonjayOS UI Service", "src.ui.main");
    ui.exec
        .extend(["--port".to_string(), cfg.services.ui_port.to_string()]);
    if dev {
        ui.exec.push("--dev-mode".into());
    }
    if s.debug {
        ui.exec.push("--debug".into());
    }
    if s.hot_reload {
        ui.exec.push("--hot-reload".into());
    }
    ui.after
        .extend(["sonjayos-ai.service".to_string(), "dbus.service".to_string()]);
    ui.wants.push("sonjayos-ai.service".into());
    ui.port = Some(cfg.services.ui_port);

    let mut security = base(
        "sonjayos-security",
        "SonjayOS AI Security Monitor",
        "src.system.security.ai_security",
    );
    security.after.push("sonjayos-ai.service".into());
    security.restart = Restart::OnFailure;

    vec![ai, ui, security]
}

/// Installed by the `ollama` stage and managed by its own unit. The AI
/// service talks to it, so `status` reports it without ever starting it.
pub const OLLAMA: &str = "ollama";

/// The three fixed ports status reports on, as `(owner, port)`.
pub fn fixed_ports(ctx: &ProvisionContext) -> [(&'static str, u16); 3] {
    let svc = &ctx.config.services;
    [
        ("sonjayos-ai", svc.ai_port),
        ("sonjayos-ui", svc.ui_port),
        (OLLAMA, svc.ollama_port),
    ]
}

/// State of the external services the SonjayOS services depend on, judged
/// by whether their port accepts connections.
pub fn dependency_status(ctx: &ProvisionContext) -> Vec<ServiceState> {
    let port = ctx.config.services.ollama_port;
    let listening = health::port_open(port);
    vec![ServiceState {
        name: OLLAMA.to_string(),
        activity: if listening {
            Activity::Running
        } else {
            Activity::Stopped
        },
        pid: None,
        port: Some(port),
        listening: Some(listening),
    }]
}

/// Start order: every service after the in-set services it is ordered after.
pub fn start_order(services: &[ServiceDescriptor]) -> Result<Vec<&ServiceDescriptor>, PipelineError> {
    let index: BTreeMap<String, usize> = services
        .iter()
        .enumerate()
        .map(|(i, svc)| (svc.unit_name(), i))
        .collect();

    let order = topo_order(services.len(), |i| {
        services[i]
            .after
            .iter()
            .filter_map(|unit| index.get(unit).copied())
            .collect()
    })
    .map_err(|stuck| {
        let names: Vec<&str> = stuck.iter().map(|&i| services[i].name.as_str()).collect();
        PipelineError::StageGraph(format!(
            "service ordering cycle between {}",
            names.join(", ")
        ))
    })?;

    Ok(order.into_iter().map(|i| &services[i]).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Running,
    Stopped,
    Failed,
    /// A pidfile names a process that no longer exists.
    Stale,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Running => write!(f, "running"),
            Activity::Stopped => write!(f, "stopped"),
            Activity::Failed => write!(f, "failed"),
            Activity::Stale => write!(f, "stale"),
        }
    }
}

/// Observed state of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub name: String,
    pub activity: Activity,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    /// Whether the port accepts connections; `None` for services without one.
    pub listening: Option<bool>,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<20} {:<8}", self.name, self.activity)?;
        if let Some(pid) = self.pid {
            write!(f, " pid={pid}")?;
        }
        match (self.port, self.listening) {
            (Some(port), Some(true)) => write!(f, " port={port} (listening)"),
            (Some(port), _) => write!(f, " port={port} (closed)"),
            _ => Ok(()),
        }
    }
}

/// Starts, stops and observes services.
pub trait Supervisor {
    /// Start one service and wait until it is up.
    fn start(&mut self, service: &ServiceDescriptor) -> Result<(), PipelineError>;

    /// Stop one service. Stopping a stopped service succeeds.
    fn stop(&mut self, service: &ServiceDescriptor) -> Result<(), PipelineError>;

    /// Observe one service without changing anything.
    fn state(&self, service: &ServiceDescriptor) -> ServiceState;
}

/// Start every service in dependency order, stopping at the first failure.
pub fn start_all(sup: &mut dyn Supervisor, services: &[ServiceDescriptor]) -> Result<(), PipelineError> {
    for service in start_order(services)? {
        info!(service = %service.name, "starting");
        sup.start(service)?;
        println!("  started {}", service.name);
    }
    Ok(())
}

/// Stop every service in reverse start order.
///
/// Every service is attempted; the first failure is returned.
pub fn teardown(sup: &mut dyn Supervisor, services: &[ServiceDescriptor]) -> Result<(), PipelineError> {
    let mut first_error = None;
    for service in start_order(services)?.into_iter().rev() {
        info!(service = %service.name, "stopping");
        match sup.stop(service) {
            Ok(()) => println!("  stopped {}", service.name),
            Err(err) => {
                warn!(service = %service.name, error = %err, "stop failed");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Current state of every service, in start order.
pub fn status(sup: &dyn Supervisor, services: &[ServiceDescriptor]) -> Result<Vec<ServiceState>, PipelineError> {
    Ok(start_order(services)?
        .into_iter()
        .map(|service| sup.state(service))
        .collect())
}
