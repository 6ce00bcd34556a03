use std::fmt::Write;

use super::ServiceDescriptor;

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

pub(super) fn render(svc: &ServiceDescriptor) -> String {
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "# Managed by sonjayos; local edits are overwritten.");
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description={}", svc.description);
    if !svc.after.is_empty() {
        let _ = writeln!(out, "After={}", svc.after.join(" "));
    }
    if !svc.wants.is_empty() {
        let _ = writeln!(out, "Wants={}", svc.wants.join(" "));
    }

    let _ = writeln!(out, "\n[Service]");
    let _ = writeln!(out, "Type=simple");
    let _ = writeln!(out, "User={}", svc.user);
    let _ = writeln!(out, "Group={}", svc.group);
    let _ = writeln!(out, "WorkingDirectory={}", svc.working_dir);
    if let Some(file) = &svc.environment_file {
        let _ = writeln!(out, "EnvironmentFile=-{file}");
    }
    for (key, value) in &svc.environment {
        let _ = writeln!(out, "Environment={}", quote(&format!("{key}={value}")));
    }
    let exec: Vec<String> = svc.exec.iter().map(|a| quote(a)).collect();
    let _ = writeln!(out, "ExecStart={}", exec.join(" "));
    let _ = writeln!(out, "Restart={}", svc.restart.as_systemd());
    let _ = writeln!(out, "RestartSec={}", svc.restart_sec);

    let _ = writeln!(out, "\n[Install]");
    let _ = writeln!(out, "WantedBy=multi-user.target");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ProvisionConfig, ProvisionContext};
    use crate::service::catalog;

    #[test]
    fn renders_all_sections() {
        let ctx = ProvisionContext::new(ProvisionConfig::default(), Mode::Production);
        let ai = &catalog(&ctx)[0];
        let unit = ai.render_unit();

        assert!(unit.contains("[Unit]\nDescription=SonjayOS AI Service\n"));
        assert!(unit.contains("After=network-online.target ollama.service\n"));
        assert!(unit.contains("User=sonjayos\n"));
        assert!(unit.contains("EnvironmentFile=-/etc/sonjayos/sonjayos.env\n"));
        assert!(unit.contains("Environment=PYTHONPATH=/opt/sonjayos\n"));
        assert!(unit.contains(
            "ExecStart=/opt/sonjayos/venv/bin/python -m src.ai.main --port 8000\n"
        ));
        assert!(unit.contains("Restart=always\nRestartSec=10\n"));
        assert!(unit.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn quotes_arguments_with_spaces() {
        assert_eq!(quote("--name"), "--name");
        assert_eq!(quote("a b"), "\"a b\"");
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
    }
}
