//! Production supervision through systemd.

use std::time::Duration;

use tracing::debug;

use super::health::{http_ok, port_open, wait_until};
use super::{Activity, ServiceDescriptor, ServiceState, Supervisor};
use crate::error::PipelineError;
use crate::process::{Cmd, Runner};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const JOURNAL_LINES: &str = "20";

pub struct SystemdSupervisor<'a> {
    runner: &'a dyn Runner,
    wait: Duration,
    poll: Duration,
    health_checks: bool,
}

impl<'a> SystemdSupervisor<'a> {
    pub fn new(runner: &'a dyn Runner, wait: Duration) -> Self {
        Self {
            runner,
            wait,
            poll: POLL_INTERVAL,
            health_checks: true,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Skip the HTTP health check after a unit turns active.
    pub fn without_health_checks(mut self) -> Self {
        self.health_checks = false;
        self
    }

    fn is_active(&self, unit: &str) -> String {
        match Cmd::new("systemctl")
            .args(["is-active", unit])
            .allow_fail()
            .run_with(self.runner)
        {
            Ok(out) => out.stdout.trim().to_string(),
            Err(err) => {
                debug!(unit, error = %err, "is-active query failed");
                String::from("unknown")
            }
        }
    }

    /// `LoadState` of a unit; `not-found` when no unit file is installed.
    fn load_state(&self, unit: &str) -> String {
        Cmd::new("systemctl")
            .args(["show", "--property=LoadState", "--value", unit])
            .allow_fail()
            .run_with(self.runner)
            .map(|out| out.stdout.trim().to_string())
            .unwrap_or_default()
    }

    fn recent_journal(&self, unit: &str) -> String {
        Cmd::new("journalctl")
            .args(["-u", unit, "-n", JOURNAL_LINES, "--no-pager", "--output=cat"])
            .allow_fail()
            .run_with(self.runner)
            .map(|out| out.stdout)
            .unwrap_or_default()
    }

    fn start_error(&self, service: &ServiceDescriptor, reason: String) -> PipelineError {
        let journal = self.recent_journal(&service.unit_name());
        let detail = if journal.trim().is_empty() {
            reason
        } else {
            format!("{reason}\nrecent journal:\n{}", journal.trim_end())
        };
        PipelineError::ServiceStart {
            service: service.name.clone(),
            waited: self.wait,
            detail,
        }
    }
}

impl Supervisor for SystemdSupervisor<'_> {
    fn start(&mut self, service: &ServiceDescriptor) -> Result<(), PipelineError> {
        let unit = service.unit_name();

        if let Err(err) = Cmd::new("systemctl")
            .args(["start", &unit])
            .run_with(self.runner)
        {
            return Err(self.start_error(service, format!("{err:#}")));
        }

        let mut last = String::new();
        let active = wait_until(self.wait, self.poll, || {
            last = self.is_active(&unit);
            last == "active"
        });
        if !active {
            return Err(self.start_error(service, format!("unit state: {last}")));
        }

        if let (true, Some(port), Some(path)) =
            (self.health_checks, service.port, service.health_path.as_deref())
        {
            if !wait_until(self.wait, self.poll, || http_ok(port, path)) {
                return Err(self.start_error(
                    service,
                    format!("GET http://127.0.0.1:{port}{path} did not return 200"),
                ));
            }
        }
        Ok(())
    }

    fn stop(&mut self, service: &ServiceDescriptor) -> Result<(), PipelineError> {
        let unit = service.unit_name();
        if self.load_state(&unit) == "not-found" {
            debug!(unit, "unit not installed, nothing to stop");
            return Ok(());
        }
        for action in ["stop", "disable"] {
            Cmd::new("systemctl")
                .args([action, unit.as_str()])
                .run_with(self.runner)
                .map_err(|err| PipelineError::ServiceStop {
                    service: service.name.clone(),
                    message: format!("{err:#}"),
                })?;
        }
        Ok(())
    }

    fn state(&self, service: &ServiceDescriptor) -> ServiceState {
        let activity = match self.is_active(&service.unit_name()).as_str() {
            "active" | "activating" | "reloading" => Activity::Running,
            "failed" => Activity::Failed,
            _ => Activity::Stopped,
        };
        let pid = Cmd::new("systemctl")
            .args(["show", "--property=MainPID", "--value", &service.unit_name()])
            .allow_fail()
            .run_with(self.runner)
            .ok()
            .and_then(|out| out.stdout.trim().parse::<u32>().ok())
            .filter(|pid| *pid > 0);

        ServiceState {
            name: service.name.clone(),
            activity,
            pid,
            port: service.port,
            listening: service.port.map(port_open),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ProvisionConfig, ProvisionContext};
    use crate::service::{catalog, start_all, status, teardown};
    use crate::testing::FakeHost;

    fn services() -> Vec<ServiceDescriptor> {
        let ctx = ProvisionContext::new(ProvisionConfig::default(), Mode::Production);
        let mut services = catalog(&ctx);
        // Nothing listens in tests.
        for svc in &mut services {
            svc.port = None;
        }
        services
    }

    fn supervisor(host: &FakeHost) -> SystemdSupervisor<'_> {
        SystemdSupervisor::new(host, Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn start_then_status_then_teardown() {
        let host = FakeHost::new();
        let services = services();
        let mut sup = supervisor(&host);

        start_all(&mut sup, &services).unwrap();
        let states = status(&sup, &services).unwrap();
        assert!(states.iter().all(|s| s.activity == Activity::Running));

        teardown(&mut sup, &services).unwrap();
        let states = status(&sup, &services).unwrap();
        assert!(states.iter().all(|s| s.activity == Activity::Stopped));
        assert!(host
            .calls_to("systemctl")
            .contains(&"systemctl disable sonjayos-ai.service".to_string()));
    }

    #[test]
    fn unit_that_never_activates_reports_journal() {
        let host = FakeHost::new()
            .never_active("sonjayos-ai.service")
            .with_journal("Traceback: ModuleNotFoundError: No module named 'src'");
        let services = services();
        let mut sup = supervisor(&host);

        let err = start_all(&mut sup, &services).unwrap_err();
        assert_eq!(err.exit_code(), 7);
        let msg = err.to_string();
        assert!(msg.contains("sonjayos-ai"));
        assert!(msg.contains("ModuleNotFoundError"));
    }

    #[test]
    fn status_does_not_change_units() {
        let host = FakeHost::new();
        let services = services();
        let sup = supervisor(&host);

        status(&sup, &services).unwrap();
        assert!(host
            .calls_to("systemctl")
            .iter()
            .all(|c| c.contains("is-active") || c.contains(" show ")));
    }

    #[test]
    fn stopping_units_that_were_never_installed_succeeds() {
        let host = FakeHost::new();
        let services = services();
        let mut sup = supervisor(&host);

        teardown(&mut sup, &services).unwrap();
        assert!(!host
            .calls_to("systemctl")
            .iter()
            .any(|c| c.contains(" stop ") || c.contains(" disable ")));
    }

    #[test]
    fn installed_but_stopped_unit_is_stopped_and_disabled() {
        let host = FakeHost::new().with_unit("sonjayos-ui.service");
        let services = services();
        let mut sup = supervisor(&host);

        teardown(&mut sup, &services).unwrap();
        let calls = host.calls_to("systemctl");
        assert!(calls.contains(&"systemctl stop sonjayos-ui.service".to_string()));
        assert!(calls.contains(&"systemctl disable sonjayos-ui.service".to_string()));
        assert!(!calls.contains(&"systemctl stop sonjayos-ai.service".to_string()));
    }
}
