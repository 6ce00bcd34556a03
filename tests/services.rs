//! Service lifecycle through both supervisors.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use sonjayos_provision::config::{Mode, ProvisionConfig, ProvisionContext};
use sonjayos_provision::service::{
    self, Activity, ProcessSupervisor, Restart, ServiceDescriptor, SystemdSupervisor,
};
use sonjayos_provision::testing::FakeHost;
use tempfile::TempDir;

fn ctx(root: &Path, mode: Mode) -> ProvisionContext {
    let config = ProvisionConfig {
        root: root.to_path_buf(),
        ..ProvisionConfig::default()
    };
    ProvisionContext::new(config, mode)
}

fn systemd(host: &FakeHost) -> SystemdSupervisor<'_> {
    SystemdSupervisor::new(host, Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(10))
        .without_health_checks()
}

#[test]
fn production_start_status_stop() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let services = service::catalog(&ctx);
    let host = FakeHost::new();
    let mut sup = systemd(&host);

    service::start_all(&mut sup, &services).unwrap();
    let starts: Vec<String> = host
        .calls_to("systemctl")
        .into_iter()
        .filter(|c| c.contains(" start "))
        .collect();
    assert_eq!(
        starts,
        [
            "systemctl start sonjayos-ai.service",
            "systemctl start sonjayos-ui.service",
            "systemctl start sonjayos-security.service",
        ]
    );

    let before = host.mutating_calls();
    let first = service::status(&sup, &services).unwrap();
    let second = service::status(&sup, &services).unwrap();
    assert_eq!(first, second);
    assert!(first.iter().all(|s| s.activity == Activity::Running));
    assert_eq!(host.mutating_calls(), before);

    service::teardown(&mut sup, &services).unwrap();
    let states = service::status(&sup, &services).unwrap();
    assert!(states.iter().all(|s| s.activity == Activity::Stopped));
    assert!(!host.unit_enabled("sonjayos-ai.service"));
}

#[test]
fn unit_that_never_activates_reports_journal() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let services = service::catalog(&ctx);
    let host = FakeHost::new()
        .never_active("sonjayos-ui.service")
        .with_journal("ModuleNotFoundError: No module named 'gi'");
    let mut sup = systemd(&host);

    let err = service::start_all(&mut sup, &services).unwrap_err();
    assert_eq!(err.exit_code(), 7);
    let msg = err.to_string();
    assert!(msg.contains("sonjayos-ui"));
    assert!(msg.contains("No module named 'gi'"));
    // Later services are not attempted.
    assert!(!host
        .calls_to("systemctl")
        .iter()
        .any(|c| c.contains("start sonjayos-security")));
}

fn sleeper(name: &str, after: &[&str]) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.into(),
        description: name.into(),
        exec: vec!["sleep".into(), "30".into()],
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

#[test]
fn development_processes_stop_in_reverse_order() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Development);
    let services = vec![
        sleeper("backend", &[]),
        sleeper("frontend", &["backend.service"]),
    ];

    let mut sup = ProcessSupervisor::new(&ctx)
        .with_wait(Duration::from_secs(2))
        .with_grace(Duration::from_secs(2));
    service::start_all(&mut sup, &services).unwrap();
    assert_eq!(sup.running(), ["backend", "frontend"]);

    // Starting again while running is a no-op.
    service::start_all(&mut sup, &services).unwrap();
    assert_eq!(sup.running().len(), 2);

    service::teardown(&mut sup, &services).unwrap();
    let states = service::status(&sup, &services).unwrap();
    assert!(states.iter().all(|s| s.activity == Activity::Stopped));
    assert!(sup.running().is_empty());
}

#[test]
fn stopping_nothing_succeeds() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Development);
    let services = vec![sleeper("idle", &[])];

    let mut sup = ProcessSupervisor::new(&ctx);
    service::teardown(&mut sup, &services).unwrap();
    assert_eq!(
        service::status(&sup, &services).unwrap()[0].activity,
        Activity::Stopped
    );
}
