//! End-to-end pipeline runs against a staging root and a scripted host.

use std::fs;
use std::path::Path;

use sonjayos_provision::config::{Mode, ProvisionConfig, ProvisionContext};
use sonjayos_provision::pipeline::{self, StageSet, StageStatus};
use sonjayos_provision::testing::{sample_facts, FakeHost};
use tempfile::TempDir;

fn ctx(root: &Path, mode: Mode) -> ProvisionContext {
    let config = ProvisionConfig {
        root: root.to_path_buf(),
        ..ProvisionConfig::default()
    };
    ProvisionContext::new(config, mode)
}

fn read_json(root: &Path, rel: &str) -> serde_json::Value {
    let raw = fs::read_to_string(root.join(rel)).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn fresh_install_materializes_configuration() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let host = FakeHost::new();

    let outcomes = pipeline::run(StageSet::Full, &ctx, &host, &sample_facts()).unwrap();
    assert_eq!(outcomes.len(), 13);

    let root = temp.path();
    for rel in [
        "etc/sonjayos/ai/llama_config.json",
        "etc/sonjayos/ai/whisper_config.json",
        "etc/sonjayos/ai/embeddings_config.json",
        "etc/sonjayos/ui/theme_config.json",
        "etc/sonjayos/security/ai_security_config.json",
        "etc/sonjayos/kernel/scheduler_config.json",
        "etc/sonjayos/dev_tools/code_completion_config.json",
        "etc/sonjayos/sonjayos.env",
        "etc/sonjayos/dev/ai/llama_config.json",
        "etc/sonjayos/dev/sonjayos.env",
        "etc/systemd/system/sonjayos-ai.service",
        "etc/systemd/system/sonjayos-ui.service",
        "etc/systemd/system/sonjayos-security.service",
        "opt/sonjayos/venv/bin/python",
    ] {
        assert!(root.join(rel).is_file(), "missing {rel}");
    }

    let env = fs::read_to_string(root.join("etc/sonjayos/sonjayos.env")).unwrap();
    assert!(env.contains("SONJAYOS_DEV_MODE=false"));
    let unit = fs::read_to_string(root.join("etc/systemd/system/sonjayos-ai.service")).unwrap();
    assert!(unit.contains("ollama.service"));
    assert!(!unit.contains("--mock-ai"));

    assert!(fs::read_to_string(root.join("etc/passwd"))
        .unwrap()
        .starts_with("sonjayos:x:"));
    assert!(host.unit_enabled("sonjayos-ai.service"));
    assert_eq!(pipeline::history(&ctx).unwrap()[0].status, "success");
}

#[test]
fn second_run_changes_nothing() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let host = FakeHost::new();

    pipeline::run(StageSet::Full, &ctx, &host, &sample_facts()).unwrap();
    let mutations = host.mutating_calls();
    let passwd = fs::read_to_string(temp.path().join("etc/passwd")).unwrap();

    let outcomes = pipeline::run(StageSet::Full, &ctx, &host, &sample_facts()).unwrap();
    for outcome in &outcomes {
        assert!(
            matches!(
                outcome.status,
                StageStatus::Applied { changes: 0 } | StageStatus::Skipped
            ),
            "{outcome}"
        );
    }
    assert_eq!(host.mutating_calls(), mutations);
    assert_eq!(
        fs::read_to_string(temp.path().join("etc/passwd")).unwrap(),
        passwd
    );
    assert_eq!(pipeline::history(&ctx).unwrap().len(), 2);
}

#[test]
fn missing_tool_fails_before_any_state() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let host = FakeHost::new().without_tool("apt-get");

    let err = pipeline::run(StageSet::Full, &ctx, &host, &sample_facts()).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains("apt-get (install: apt)"));
    assert_eq!(host.call_count(), 0);
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn unsupported_release_is_a_precondition_failure() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let mut facts = sample_facts();
    facts.os_version = "20.04".into();

    let err = pipeline::run(StageSet::Full, &ctx, &FakeHost::new(), &facts).unwrap_err();
    assert_eq!(err.exit_code(), 4);
    assert!(err.to_string().contains("20.04"));
    assert!(!temp.path().join("etc/sonjayos").exists());
}

#[test]
fn low_memory_is_only_a_warning() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let mut facts = sample_facts();
    facts.total_memory_mb = 12 * 1024;

    let outcomes = pipeline::run(StageSet::Full, &ctx, &FakeHost::new(), &facts).unwrap();
    assert!(matches!(&outcomes[0].status, StageStatus::Warned { warnings } if warnings[0].contains("recommended")));
}

#[test]
fn stage_failure_names_stage_and_tool_output() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Production);
    let host = FakeHost::new().fail("apt-get", 100, "E: Unable to locate package dbus");

    let err = pipeline::run(StageSet::Full, &ctx, &host, &sample_facts()).unwrap_err();
    assert_eq!(err.exit_code(), 5);
    let msg = err.to_string();
    assert!(msg.contains("repositories"));
    assert!(msg.contains("exit status 100"));
    assert!(msg.contains("Unable to locate package"));
    assert!(!temp.path().join("etc/sonjayos").exists());
}

#[test]
fn mode_changes_content_not_stages() {
    let dev_root = TempDir::new().unwrap();
    let prod_root = TempDir::new().unwrap();
    let dev = ctx(dev_root.path(), Mode::Development);
    let prod = ctx(prod_root.path(), Mode::Production);

    let dev_out = pipeline::run(StageSet::Full, &dev, &FakeHost::new(), &sample_facts()).unwrap();
    let prod_out = pipeline::run(StageSet::Full, &prod, &FakeHost::new(), &sample_facts()).unwrap();
    let names = |o: &[pipeline::StageOutcome]| o.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&dev_out), names(&prod_out));

    let files = |root: &Path| {
        walk(root)
            .into_iter()
            .filter(|p| !p.starts_with("var/lib/sonjayos/runs"))
            .collect::<Vec<_>>()
    };
    assert_eq!(files(dev_root.path()), files(prod_root.path()));

    // Both roots carry both modes' documents; the values differ by mode.
    for root in [dev_root.path(), prod_root.path()] {
        let prod_cfg = read_json(root, "etc/sonjayos/security/ai_security_config.json");
        let dev_cfg = read_json(root, "etc/sonjayos/dev/security/ai_security_config.json");
        assert_eq!(prod_cfg["threat_detection"]["cpu_threshold"], 80.0);
        assert_eq!(dev_cfg["threat_detection"]["cpu_threshold"], 95.0);
    }

    let dev_unit =
        fs::read_to_string(dev_root.path().join("etc/systemd/system/sonjayos-ai.service")).unwrap();
    assert!(dev_unit.contains("--mock-ai"));
}

#[test]
fn configure_set_only_writes_configuration() {
    let temp = TempDir::new().unwrap();
    let ctx = ctx(temp.path(), Mode::Development);
    let host = FakeHost::new();

    let outcomes = pipeline::run(StageSet::Configure, &ctx, &host, &sample_facts()).unwrap();
    let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, ["detect", "layout", "configuration"]);
    assert!(temp.path().join("etc/sonjayos/ai/llama_config.json").is_file());
    assert!(host.mutating_calls().is_empty());
}

#[test]
fn development_run_leaves_production_documents_alone() {
    let temp = TempDir::new().unwrap();
    let prod = ctx(temp.path(), Mode::Production);
    let dev = ctx(temp.path(), Mode::Development);
    pipeline::run(StageSet::Full, &prod, &FakeHost::new(), &sample_facts()).unwrap();

    let prod_docs = |root: &Path| {
        walk(&root.join("etc/sonjayos"))
            .into_iter()
            .filter(|p| !p.starts_with("dev"))
            .filter(|p| root.join("etc/sonjayos").join(p).is_file())
            .map(|p| {
                let bytes = fs::read(root.join("etc/sonjayos").join(&p)).unwrap();
                (p, bytes)
            })
            .collect::<Vec<_>>()
    };
    let before = prod_docs(temp.path());
    assert!(!before.is_empty());

    let outcomes = pipeline::run(StageSet::Configure, &dev, &FakeHost::new(), &sample_facts()).unwrap();
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.status, StageStatus::Applied { changes: 0 } | StageStatus::Skipped)));
    assert_eq!(prod_docs(temp.path()), before);

    let env = fs::read_to_string(temp.path().join("etc/sonjayos/sonjayos.env")).unwrap();
    assert!(env.contains("SONJAYOS_MOCK_AI=false"));
}

#[test]
fn application_tree_is_deployed_and_kept_in_sync() {
    let temp = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::create_dir_all(source.path().join("ai")).unwrap();
    fs::write(source.path().join("__init__.py"), "").unwrap();
    fs::write(source.path().join("ai/main.py"), "print('v1')\n").unwrap();

    let mut config = ProvisionConfig {
        root: temp.path().to_path_buf(),
        ..ProvisionConfig::default()
    };
    config.application.source_dir = Some(source.path().to_path_buf());
    let ctx = ProvisionContext::new(config, Mode::Production);
    let host = FakeHost::new();

    pipeline::run(StageSet::Full, &ctx, &host, &sample_facts()).unwrap();
    let deployed = temp.path().join("opt/sonjayos/src");
    assert_eq!(
        fs::read_to_string(deployed.join("ai/main.py")).unwrap(),
        "print('v1')\n"
    );

    let status = |outcomes: &[pipeline::StageOutcome]| {
        outcomes
            .iter()
            .find(|o| o.name == "application")
            .map(|o| o.status.clone())
            .unwrap()
    };
    let again = pipeline::run(StageSet::Services, &ctx, &host, &sample_facts()).unwrap();
    assert_eq!(status(&again), StageStatus::Applied { changes: 0 });

    fs::write(source.path().join("ai/main.py"), "print('v2')\n").unwrap();
    fs::remove_file(source.path().join("__init__.py")).unwrap();
    let updated = pipeline::run(StageSet::Services, &ctx, &host, &sample_facts()).unwrap();
    assert_eq!(status(&updated), StageStatus::Applied { changes: 1 });
    assert_eq!(
        fs::read_to_string(deployed.join("ai/main.py")).unwrap(),
        "print('v2')\n"
    );
    assert!(!deployed.join("__init__.py").exists());
}

fn walk(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            out.push(path.strip_prefix(root).unwrap().to_path_buf());
        }
    }
    out.sort();
    out
}
