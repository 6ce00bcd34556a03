//! Development supervision: the services run as children of this process.
//!
//! Each service gets its own process group so a shutdown reaches anything it
//! forked. Pidfiles let a later `stop` or `status` invocation find services a
//! detached run left behind.
//!
//! # Shutdown strategy
//! 1. SIGTERM to the process group
//! 2. Poll for exit for the grace period
//! 3. SIGKILL to the group if anything is still alive
//! 4. Reap, then delete the pidfile

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::health::{http_ok, port_open, wait_until};
use super::pidfile::{delete_pidfile, pid_alive, read_pidfile, write_pidfile};
use super::{Activity, ServiceDescriptor, ServiceState, Supervisor};
use crate::config::ProvisionContext;
use crate::error::PipelineError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_GRACE: Duration = Duration::from_secs(5);
/// How long a service without a port must stay up to count as started.
const SETTLE: Duration = Duration::from_millis(300);
const LOG_TAIL_LINES: usize = 20;

struct Tracked {
    name: String,
    child: Child,
}

/// Owns the development service processes.
///
/// Dropping the supervisor terminates every process it started unless
/// [`ProcessSupervisor::detach`] was called.
pub struct ProcessSupervisor {
    root: PathBuf,
    pids_dir: PathBuf,
    log_dir: PathBuf,
    env: BTreeMap<String, String>,
    wait: Duration,
    grace: Duration,
    health_checks: bool,
    children: Vec<Tracked>,
    detached: bool,
}

impl ProcessSupervisor {
    pub fn new(ctx: &ProvisionContext) -> Self {
        Self {
            root: ctx.config.root.clone(),
            pids_dir: ctx.config.pids_dir(),
            log_dir: ctx.config.log_dir(),
            env: ctx.environment(),
            wait: Duration::from_secs(ctx.config.services.wait_secs),
            grace: DEFAULT_GRACE,
            health_checks: true,
            children: Vec::new(),
            detached: false,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Only wait for the port to accept connections, not for HTTP 200.
    pub fn without_health_checks(mut self) -> Self {
        self.health_checks = false;
        self
    }

    /// Leave the children running when the supervisor is dropped.
    pub fn detach(mut self) {
        self.detached = true;
        info!(count = self.children.len(), "detaching from services");
    }

    /// Names of tracked services still running.
    pub fn running(&mut self) -> Vec<String> {
        self.children
            .iter_mut()
            .filter_map(|t| matches!(t.child.try_wait(), Ok(None)).then(|| t.name.clone()))
            .collect()
    }

    /// Stop every tracked service, newest first.
    pub fn shutdown(&mut self) -> Result<(), PipelineError> {
        let mut first_error = None;
        while let Some(tracked) = self.children.pop() {
            if let Err(err) = self.terminate_tracked(tracked) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            self.root.join(path.trim_start_matches('/'))
        } else {
            PathBuf::from(path)
        }
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.log"))
    }

    fn log_tail(&self, name: &str) -> String {
        let Ok(content) = fs::read_to_string(self.log_path(name)) else {
            return String::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(LOG_TAIL_LINES);
        lines[start..].join("\n")
    }

    fn start_error(&self, service: &ServiceDescriptor, reason: String) -> PipelineError {
        let tail = self.log_tail(&service.name);
        let detail = if tail.trim().is_empty() {
            reason
        } else {
            format!("{reason}\nlast log lines:\n{tail}")
        };
        PipelineError::ServiceStart {
            service: service.name.clone(),
            waited: self.wait,
            detail,
        }
    }

    fn spawn(&self, service: &ServiceDescriptor) -> Result<Child, String> {
        let (program, args) = service
            .exec
            .split_first()
            .ok_or_else(|| String::from("empty command line"))?;

        fs::create_dir_all(&self.log_dir)
            .map_err(|e| format!("creating '{}': {e}", self.log_dir.display()))?;
        let log_path = self.log_path(&service.name);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| format!("opening '{}': {e}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .map_err(|e| format!("opening '{}': {e}", log_path.display()))?;

        let mut command = Command::new(self.resolve(program));
        command
            .args(args)
            .current_dir(self.resolve(&service.working_dir))
            .envs(&self.env)
            .envs(&service.environment)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0);

        command
            .spawn()
            .map_err(|e| format!("spawning {}: {e}", service.exec.join(" ")))
    }

    fn terminate_tracked(&self, mut tracked: Tracked) -> Result<(), PipelineError> {
        let pid = tracked.child.id();
        debug!(service = %tracked.name, pid, "terminating");

        let result = match tracked.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => {
                let child = &mut tracked.child;
                terminate_group(pid, self.grace, || matches!(child.try_wait(), Ok(Some(_))))
                    .and_then(|()| child.wait().map(|_| ()).map_err(|e| e.to_string()))
            }
        };

        delete_pidfile(&self.pids_dir, &tracked.name).map_err(|e| PipelineError::ServiceStop {
            service: tracked.name.clone(),
            message: format!("removing pidfile: {e}"),
        })?;
        result.map_err(|message| PipelineError::ServiceStop {
            service: tracked.name,
            message,
        })
    }
}

/// SIGTERM the group led by `pid`, wait up to `grace` for `exited`, then SIGKILL.
fn terminate_group<F>(pid: u32, grace: Duration, mut exited: F) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    let pgid = Pid::from_raw(i32::try_from(pid).map_err(|_| format!("invalid pid {pid}"))?);

    match signal::killpg(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => return Err(format!("SIGTERM to group {pid}: {e}")),
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if exited() {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!(pid, "still running after SIGTERM, sending SIGKILL");
    match signal::killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(format!("SIGKILL to group {pid}: {e}")),
    }

    if wait_until(grace, POLL_INTERVAL, &mut exited) {
        Ok(())
    } else {
        Err(format!("process {pid} did not exit after SIGKILL"))
    }
}

impl Supervisor for ProcessSupervisor {
    fn start(&mut self, service: &ServiceDescriptor) -> Result<(), PipelineError> {
        if let Ok(Some(data)) = read_pidfile(&self.pids_dir, &service.name) {
            if pid_alive(data.pid) {
                info!(service = %service.name, pid = data.pid, "already running");
                return Ok(());
            }
        }

        let child = self
            .spawn(service)
            .map_err(|reason| self.start_error(service, reason))?;
        let pid = child.id();
        self.children.push(Tracked {
            name: service.name.clone(),
            child,
        });
        let idx = self.children.len() - 1;
        if let Err(e) = write_pidfile(&self.pids_dir, &service.name, pid, service.port) {
            let tracked = self.children.remove(idx);
            let _ = self.terminate_tracked(tracked);
            return Err(self.start_error(service, format!("writing pidfile: {e}")));
        }

        let health_checks = self.health_checks;
        let mut exit_status = None;
        let ready = {
            let child = &mut self.children[idx].child;
            let mut exited = |child: &mut Child| match child.try_wait() {
                Ok(Some(status)) => {
                    exit_status = Some(status);
                    true
                }
                _ => false,
            };
            match service.port {
                Some(port) => wait_until(self.wait, POLL_INTERVAL, || {
                    if exited(child) {
                        return true;
                    }
                    match (health_checks, service.health_path.as_deref()) {
                        (true, Some(path)) => http_ok(port, path),
                        _ => port_open(port),
                    }
                }),
                None => {
                    thread::sleep(SETTLE.min(self.wait));
                    !exited(child)
                }
            }
        };

        if let Some(status) = exit_status {
            let tracked = self.children.remove(idx);
            let _ = delete_pidfile(&self.pids_dir, &tracked.name);
            return Err(self.start_error(service, format!("exited during startup ({status})")));
        }
        if !ready {
            let tracked = self.children.remove(idx);
            let _ = self.terminate_tracked(tracked);
            let reason = match service.port {
                Some(port) => format!("port {port} never became ready"),
                None => String::from("did not stay running"),
            };
            return Err(self.start_error(service, reason));
        }

        info!(service = %service.name, pid, "started");
        Ok(())
    }

    fn stop(&mut self, service: &ServiceDescriptor) -> Result<(), PipelineError> {
        if let Some(idx) = self.children.iter().position(|t| t.name == service.name) {
            let tracked = self.children.remove(idx);
            return self.terminate_tracked(tracked);
        }

        let stop_error = |message: String| PipelineError::ServiceStop {
            service: service.name.clone(),
            message,
        };
        let data = match read_pidfile(&self.pids_dir, &service.name) {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(e) => return Err(stop_error(format!("reading pidfile: {e}"))),
        };
        if pid_alive(data.pid) {
            terminate_group(data.pid, self.grace, || !pid_alive(data.pid)).map_err(stop_error)?;
        }
        delete_pidfile(&self.pids_dir, &service.name)
            .map_err(|e| stop_error(format!("removing pidfile: {e}")))
    }

    fn state(&self, service: &ServiceDescriptor) -> ServiceState {
        let (activity, pid) = match read_pidfile(&self.pids_dir, &service.name) {
            Ok(Some(data)) if pid_alive(data.pid) => (Activity::Running, Some(data.pid)),
            Ok(Some(data)) => (Activity::Stale, Some(data.pid)),
            Ok(None) => (Activity::Stopped, None),
            Err(err) => {
                debug!(service = %service.name, error = %err, "unreadable pidfile");
                (Activity::Stale, None)
            }
        };
        ServiceState {
            name: service.name.clone(),
            activity,
            pid,
            port: service.port,
            listening: service.port.map(port_open),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.detached || self.children.is_empty() {
            return;
        }
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "shutting down services");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ProvisionConfig};
    use crate::service::{start_all, status, teardown, Restart};
    use tempfile::TempDir;

    fn ctx(root: &Path) -> ProvisionContext {
        let config = ProvisionConfig {
            root: root.to_path_buf(),
            ..ProvisionConfig::default()
        };
        ProvisionContext::new(config, Mode::Development)
    }

    fn svc(name: &str, exec: &[&str], after: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.into(),
            description: name.into(),
            exec: exec.iter().map(|s| s.to_string()).collect(),
            working_dir: "/".into(),
            user: "nobody".into(),
            group: "nogroup".into(),
            restart: Restart::No,
            restart_sec: 0,
            after: after.iter().map(|s| s.to_string()).collect(),
            wants: Vec::new(),
            environment_file: None,
            environment: BTreeMap::new(),
            port: None,
            health_path: None,
        }
    }

    fn supervisor(ctx: &ProvisionContext) -> ProcessSupervisor {
        ProcessSupervisor::new(ctx)
            .with_wait(Duration::from_secs(2))
            .with_grace(Duration::from_secs(2))
    }

    #[test]
    fn start_records_pidfile_and_drop_cleans_up() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        let services = vec![svc("sleeper", &["sleep", "30"], &[])];

        let pid = {
            let mut sup = supervisor(&ctx);
            start_all(&mut sup, &services).unwrap();
            let data = read_pidfile(&ctx.config.pids_dir(), "sleeper").unwrap().unwrap();
            assert!(pid_alive(data.pid));
            assert_eq!(sup.running(), vec!["sleeper".to_string()]);
            data.pid
        };

        assert!(read_pidfile(&ctx.config.pids_dir(), "sleeper").unwrap().is_none());
        assert!(wait_until(Duration::from_secs(2), POLL_INTERVAL, || !pid_alive(pid)));
    }

    #[test]
    fn running_drops_services_that_exited() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        let services = vec![
            svc("brief", &["sleep", "1"], &[]),
            svc("steady", &["sleep", "30"], &[]),
        ];

        let mut sup = supervisor(&ctx);
        start_all(&mut sup, &services).unwrap();
        assert_eq!(sup.running(), vec!["brief".to_string(), "steady".to_string()]);

        assert!(wait_until(Duration::from_secs(5), POLL_INTERVAL, || {
            sup.running() == vec!["steady".to_string()]
        }));
    }

    #[test]
    fn immediate_exit_is_a_start_error_with_log_tail() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        let services = vec![svc(
            "crasher",
            &["sh", "-c", "echo 'bind: address already in use' >&2; exit 3"],
            &[],
        )];

        let mut sup = supervisor(&ctx);
        let err = start_all(&mut sup, &services).unwrap_err();
        assert!(matches!(err, PipelineError::ServiceStart { .. }));
        assert!(err.to_string().contains("address already in use"));
        assert!(read_pidfile(&ctx.config.pids_dir(), "crasher").unwrap().is_none());
    }

    #[test]
    fn stop_from_another_invocation_uses_pidfile() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        let services = vec![
            svc("first", &["sleep", "30"], &[]),
            svc("second", &["sleep", "30"], &["first.service"]),
        ];

        let mut sup = supervisor(&ctx);
        start_all(&mut sup, &services).unwrap();
        sup.detach();

        let mut later = supervisor(&ctx);
        let states = status(&later, &services).unwrap();
        assert!(states.iter().all(|s| s.activity == Activity::Running));

        teardown(&mut later, &services).unwrap();
        let states = status(&later, &services).unwrap();
        assert!(states.iter().all(|s| s.activity == Activity::Stopped));
    }

    #[test]
    fn stale_pidfile_is_reported_not_removed() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        let services = vec![svc("ghost", &["sleep", "30"], &[])];

        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        write_pidfile(&ctx.config.pids_dir(), "ghost", dead_pid, None).unwrap();

        let sup = supervisor(&ctx);
        let states = status(&sup, &services).unwrap();
        assert_eq!(states[0].activity, Activity::Stale);
        assert!(read_pidfile(&ctx.config.pids_dir(), "ghost").unwrap().is_some());
    }

    #[test]
    fn terminate_group_escalates_to_sigkill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 0.05; done"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        thread::sleep(Duration::from_millis(100));

        terminate_group(pid, Duration::from_millis(300), || {
            matches!(child.try_wait(), Ok(Some(_)))
        })
        .unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }
}
