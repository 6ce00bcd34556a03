//! Package manager handlers: Op::AptSource, Op::AptPackages, Op::Venv,
//! Op::PipPackages, Op::NpmGlobal, Op::OllamaModels
//!
//! Every handler queries the package manager first and only installs what is
//! missing, so a converged host produces no install calls at all.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

use super::files::handle_writefile;
use crate::process::{Cmd, Runner};

/// Handle Op::AptSource: `etc/apt/sources.list.d/<name>.list`
pub fn ensure_apt_source(root: &Path, name: &str, line: &str) -> Result<bool> {
    let path = format!("etc/apt/sources.list.d/{name}.list");
    handle_writefile(root, &path, &format!("{}\n", line.trim_end()))
}

pub fn apt_installed(runner: &dyn Runner, package: &str) -> Result<bool> {
    let out = Cmd::new("dpkg-query")
        .args(["-W", "-f=${Status}", package])
        .allow_fail()
        .run_with(runner)?;
    Ok(out.success() && out.stdout.contains("install ok installed"))
}

/// Handle Op::AptPackages: refresh indexes and install the missing packages
pub fn ensure_apt(runner: &dyn Runner, packages: &[String]) -> Result<bool> {
    let mut missing = Vec::new();
    for package in packages {
        if !apt_installed(runner, package)? {
            missing.push(package.clone());
        }
    }
    if missing.is_empty() {
        return Ok(false);
    }
    debug!(packages = ?missing, "installing apt packages");

    Cmd::new("apt-get")
        .arg("update")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .error_msg("refreshing apt package indexes")
        .run_with(runner)?;
    Cmd::new("apt-get")
        .args(["install", "-y", "--no-install-recommends"])
        .args(missing)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .run_with(runner)?;
    Ok(true)
}

/// Handle Op::Venv: create a virtualenv unless its interpreter exists
pub fn ensure_venv(runner: &dyn Runner, root: &Path, path: &str) -> Result<bool> {
    let venv = root.join(path.trim_start_matches('/'));
    if venv.join("bin/python").exists() {
        return Ok(false);
    }
    Cmd::new("python3")
        .args(["-m", "venv"])
        .arg_path(&venv)
        .error_msg(format!("creating virtualenv at {}", venv.display()))
        .run_with(runner)?;
    Ok(true)
}

/// Distribution name of a requirement spec (`numpy>=1.24` -> `numpy`).
fn requirement_name(spec: &str) -> &str {
    spec.split(|c: char| "<>=!~[; ".contains(c))
        .next()
        .unwrap_or(spec)
        .trim()
}

/// Handle Op::PipPackages: install missing distributions into the venv
pub fn ensure_pip(runner: &dyn Runner, root: &Path, venv: &str, packages: &[String]) -> Result<bool> {
    let pip = root.join(venv.trim_start_matches('/')).join("bin/pip");

    let mut missing = Vec::new();
    for spec in packages {
        let out = Cmd::new(pip.to_string_lossy())
            .args(["show", "--quiet", requirement_name(spec)])
            .allow_fail()
            .run_with(runner)
            .with_context(|| format!("querying pip for '{spec}'"))?;
        if !out.success() {
            missing.push(spec.clone());
        }
    }
    if missing.is_empty() {
        return Ok(false);
    }

    Cmd::new(pip.to_string_lossy())
        .args(["install", "--disable-pip-version-check"])
        .args(missing)
        .run_with(runner)?;
    Ok(true)
}

/// Handle Op::NpmGlobal: install missing global npm packages
pub fn ensure_npm(runner: &dyn Runner, packages: &[String]) -> Result<bool> {
    let mut missing = Vec::new();
    for package in packages {
        let out = Cmd::new("npm")
            .args(["ls", "-g", "--depth=0", "--parseable", package])
            .allow_fail()
            .run_with(runner)?;
        if !out.success() || out.stdout.trim().is_empty() {
            missing.push(package.clone());
        }
    }
    if missing.is_empty() {
        return Ok(false);
    }

    Cmd::new("npm")
        .args(["install", "-g"])
        .args(missing)
        .run_with(runner)?;
    Ok(true)
}

/// Model names from `ollama list` output (first column, header skipped).
pub fn parse_ollama_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

fn model_present(installed: &[String], model: &str) -> bool {
    installed.iter().any(|have| {
        have == model || (!model.contains(':') && have == &format!("{model}:latest"))
    })
}

/// Handle Op::OllamaModels: pull models that are not yet local
pub fn ensure_ollama_models(runner: &dyn Runner, models: &[String]) -> Result<bool> {
    let out = Cmd::new("ollama")
        .arg("list")
        .error_msg("listing local ollama models")
        .run_with(runner)?;
    let installed = parse_ollama_list(&out.stdout);

    let mut changed = false;
    for model in models {
        if model_present(&installed, model) {
            continue;
        }
        Cmd::new("ollama")
            .args(["pull", model])
            .error_msg(format!("pulling model '{model}'"))
            .run_with(runner)?;
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_apt_installs_only_missing() {
        let host = FakeHost::new().with_apt(["curl"]);
        let packages = vec!["curl".to_string(), "git".to_string()];

        assert!(ensure_apt(&host, &packages).unwrap());
        let installs: Vec<_> = host
            .calls_to("apt-get")
            .into_iter()
            .filter(|c| c.contains("install"))
            .collect();
        assert_eq!(installs.len(), 1);
        assert!(installs[0].ends_with("git"));

        assert!(!ensure_apt(&host, &packages).unwrap());
        assert_eq!(host.calls_to("apt-get").len(), 2);
    }

    #[test]
    fn test_apt_failure_carries_stderr() {
        let host = FakeHost::new().fail("apt-get", 100, "E: Unable to locate package nodejs");
        let err = ensure_apt(&host, &["nodejs".to_string()]).unwrap_err();
        assert!(format!("{err:#}").contains("Unable to locate package nodejs"));
    }

    #[test]
    fn test_apt_source_written_once() {
        let temp = TempDir::new().unwrap();
        let line = "deb https://repo.radeon.com/rocm/apt/latest jammy main";
        assert!(ensure_apt_source(temp.path(), "rocm", line).unwrap());
        assert!(!ensure_apt_source(temp.path(), "rocm", line).unwrap());
        let written =
            fs::read_to_string(temp.path().join("etc/apt/sources.list.d/rocm.list")).unwrap();
        assert_eq!(written, format!("{line}\n"));
    }

    #[test]
    fn test_venv_and_pip() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new();
        let packages = vec!["psutil".to_string(), "numpy>=1.24".to_string()];

        assert!(ensure_venv(&host, temp.path(), "opt/sonjayos/venv").unwrap());
        assert!(!ensure_venv(&host, temp.path(), "opt/sonjayos/venv").unwrap());

        assert!(ensure_pip(&host, temp.path(), "opt/sonjayos/venv", &packages).unwrap());
        assert!(!ensure_pip(&host, temp.path(), "opt/sonjayos/venv", &packages).unwrap());
    }

    #[test]
    fn test_requirement_name() {
        assert_eq!(requirement_name("numpy>=1.24"), "numpy");
        assert_eq!(requirement_name("uvicorn[standard]"), "uvicorn");
        assert_eq!(requirement_name("psutil"), "psutil");
    }

    #[test]
    fn test_npm_global() {
        let host = FakeHost::new();
        let packages = vec!["typescript".to_string()];
        assert!(ensure_npm(&host, &packages).unwrap());
        assert!(!ensure_npm(&host, &packages).unwrap());
    }

    #[test]
    fn test_parse_ollama_list() {
        let out = "NAME            ID              SIZE    MODIFIED\n\
                   llama3.1:8b     42182419e950    4.7 GB  2 days ago\n\
                   mistral:latest  61e88e884507    4.1 GB  3 weeks ago\n";
        let models = parse_ollama_list(out);
        assert_eq!(models, vec!["llama3.1:8b", "mistral:latest"]);
        assert!(model_present(&models, "mistral"));
        assert!(!model_present(&models, "llama3.1:70b"));
    }

    #[test]
    fn test_ollama_pulls_missing_models_only() {
        let host = FakeHost::new().with_ollama_models(["llama3.1:8b"]);
        let models = vec!["llama3.1:8b".to_string(), "nomic-embed-text".to_string()];

        assert!(ensure_ollama_models(&host, &models).unwrap());
        let pulls: Vec<_> = host
            .calls_to("ollama")
            .into_iter()
            .filter(|c| c.starts_with("ollama pull"))
            .collect();
        assert_eq!(pulls, vec!["ollama pull nomic-embed-text".to_string()]);

        assert!(!ensure_ollama_models(&host, &models).unwrap());
    }
}
