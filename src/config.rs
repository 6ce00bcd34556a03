//! Provisioning configuration.
//!
//! Everything a stage needs is carried in an immutable [`ProvisionContext`]
//! built once per invocation: the on-disk [`ProvisionConfig`] plus the
//! selected [`Mode`]. The mode only changes configuration *content*; the stage
//! graph never looks at it.
//!
//! Lookup order for the config file:
//! 1. `--config <path>` (must exist)
//! 2. `$XDG_CONFIG_HOME/sonjayos/provision.toml`
//! 3. `/etc/sonjayos/provision.toml`
//! 4. built-in defaults

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const SYSTEM_CONFIG_PATH: &str = "/etc/sonjayos/provision.toml";
const CONFIG_FILENAME: &str = "provision.toml";
const DEV_DOCUMENTS_SUBDIR: &str = "dev";

/// Development vs production parameterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[value(alias = "dev")]
    Development,
    #[value(alias = "prod")]
    Production,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Production, Mode::Development];

    pub fn settings(self) -> ModeSettings {
        match self {
            Mode::Development => ModeSettings {
                debug: true,
                mock_ai: true,
                hot_reload: true,
                profiling: true,
                log_level: "debug",
                cpu_threshold: 95.0,
                memory_threshold: 95.0,
                monitor_interval_secs: 10,
                model_memory_fraction: 0.5,
            },
            Mode::Production => ModeSettings {
                debug: false,
                mock_ai: false,
                hot_reload: false,
                profiling: false,
                log_level: "info",
                cpu_threshold: 80.0,
                memory_threshold: 85.0,
                monitor_interval_secs: 30,
                model_memory_fraction: 0.8,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values that differ between modes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeSettings {
    pub debug: bool,
    pub mock_ai: bool,
    pub hot_reload: bool,
    pub profiling: bool,
    pub log_level: &'static str,
    /// Security monitor CPU alert threshold, percent.
    pub cpu_threshold: f64,
    /// Security monitor memory alert threshold, percent.
    pub memory_threshold: f64,
    pub monitor_interval_secs: u64,
    /// Fraction of RAM the model runtime may claim.
    pub model_memory_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Directory treated as `/` by every filesystem operation.
    pub root: PathBuf,
    pub layout: Layout,
    pub account: Account,
    pub packages: Packages,
    pub gpu: Gpu,
    pub requirements: Requirements,
    pub services: Services,
    pub application: Application,
}

/// Root-relative directory layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Layout {
    pub config_dir: String,
    pub install_dir: String,
    pub log_dir: String,
    pub state_dir: String,
}

/// Service account the units run as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Account {
    pub user: String,
    pub group: String,
    pub home: String,
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Packages {
    pub apt: Vec<String>,
    pub pip: Vec<String>,
    pub npm: Vec<String>,
    pub ollama_models: Vec<String>,
    pub ollama_install_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Gpu {
    pub rocm: bool,
    /// apt source line for the ROCm repository.
    pub rocm_repository: String,
    pub rocm_packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Requirements {
    pub os_ids: Vec<String>,
    pub os_versions: Vec<String>,
    pub architectures: Vec<String>,
    pub required_memory_mb: u64,
    pub recommended_memory_mb: u64,
    pub recommended_disk_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Services {
    pub ai_port: u16,
    pub ui_port: u16,
    pub health_path: String,
    /// How long a started service may take to become active.
    pub wait_secs: u64,
    /// Ollama API port. Not started by this crate, but reported by `status`
    /// next to the service ports.
    pub ollama_port: u16,
}

/// Where the service code is deployed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Application {
    /// Host copy of the service package, mirrored to `<install_dir>/src`.
    /// Deployment is skipped when unset.
    pub source_dir: Option<PathBuf>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            layout: Layout::default(),
            account: Account::default(),
            packages: Packages::default(),
            gpu: Gpu::default(),
            requirements: Requirements::default(),
            services: Services::default(),
            application: Application::default(),
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            config_dir: "etc/sonjayos".into(),
            install_dir: "opt/sonjayos".into(),
            log_dir: "var/log/sonjayos".into(),
            state_dir: "var/lib/sonjayos".into(),
        }
    }
}

impl Default for Account {
    fn default() -> Self {
        Self {
            user: "sonjayos".into(),
            group: "sonjayos".into(),
            home: "/var/lib/sonjayos".into(),
            shell: "/usr/sbin/nologin".into(),
        }
    }
}

impl Default for Packages {
    fn default() -> Self {
        Self {
            apt: [
                "python3",
                "python3-venv",
                "python3-pip",
                "nodejs",
                "npm",
                "curl",
                "git",
                "build-essential",
                "dbus",
            ]
            .map(String::from)
            .to_vec(),
            pip: ["psutil", "requests", "numpy", "aiohttp", "watchdog"]
                .map(String::from)
                .to_vec(),
            npm: vec!["typescript".into()],
            ollama_models: vec!["llama3.1:8b".into()],
            ollama_install_url: "https://ollama.com/install.sh".into(),
        }
    }
}

impl Default for Gpu {
    fn default() -> Self {
        Self {
            rocm: false,
            rocm_repository: "deb [arch=amd64] https://repo.radeon.com/rocm/apt/latest jammy main"
                .into(),
            rocm_packages: vec!["rocm-hip-runtime".into(), "rocm-smi-lib".into()],
        }
    }
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            os_ids: vec!["ubuntu".into()],
            os_versions: vec!["22.04".into(), "24.04".into()],
            architectures: vec!["x86_64".into()],
            required_memory_mb: 8 * 1024,
            recommended_memory_mb: 16 * 1024,
            recommended_disk_mb: 50 * 1024,
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Self {
            ai_port: 8000,
            ui_port: 8001,
            health_path: "/health".into(),
            wait_secs: 60,
            ollama_port: 11434,
        }
    }
}

impl ProvisionConfig {
    /// Load from the first config file found, falling back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                Some(path.to_path_buf())
            }
            None => default_config_candidates().into_iter().find(|p| p.is_file()),
        };

        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                tracing::debug!(path = %path.display(), "loading provisioning config");
                Self::from_toml(&raw, &path)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let svc = &self.services;
        let ports = [svc.ai_port, svc.ui_port, svc.ollama_port];
        if ports.contains(&0) {
            return Err(ConfigError::Invalid("service ports must be non-zero".into()));
        }
        for (i, port) in ports.iter().enumerate() {
            if ports[..i].contains(port) {
                return Err(ConfigError::Invalid(format!(
                    "service ports must be distinct, got {port} twice"
                )));
            }
        }
        if !svc.health_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "services.health_path must start with '/', got '{}'",
                svc.health_path
            )));
        }
        if svc.wait_secs == 0 {
            return Err(ConfigError::Invalid("services.wait_secs must be > 0".into()));
        }

        if let Some(source) = &self.application.source_dir {
            if !source.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "application.source_dir must be absolute, got '{}'",
                    source.display()
                )));
            }
        }

        let req = &self.requirements;
        if req.recommended_memory_mb < req.required_memory_mb {
            return Err(ConfigError::Invalid(format!(
                "requirements.recommended_memory_mb ({}) is below required_memory_mb ({})",
                req.recommended_memory_mb, req.required_memory_mb
            )));
        }

        for (field, value) in [
            ("layout.config_dir", &self.layout.config_dir),
            ("layout.install_dir", &self.layout.install_dir),
            ("layout.log_dir", &self.layout.log_dir),
            ("layout.state_dir", &self.layout.state_dir),
        ] {
            if value.is_empty() || Path::new(value).is_absolute() || value.contains("..") {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be a relative path below the target root, got '{value}'"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a root-relative path.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.path(&self.layout.config_dir)
    }

    /// Root-relative directory holding the documents for `mode`.
    ///
    /// Each mode has its own copy so switching modes never rewrites the
    /// documents the other mode's services read.
    pub fn documents_dir(&self, mode: Mode) -> String {
        let base = self.layout.config_dir.trim_matches('/');
        match mode {
            Mode::Production => base.to_string(),
            Mode::Development => format!("{base}/{DEV_DOCUMENTS_SUBDIR}"),
        }
    }

    /// Root-relative directory the application tree is deployed to.
    pub fn app_dir(&self) -> String {
        format!("{}/src", self.layout.install_dir.trim_matches('/'))
    }

    pub fn ollama_url(&self) -> String {
        format!("http://localhost:{}", self.services.ollama_port)
    }

    pub fn install_dir(&self) -> PathBuf {
        self.path(&self.layout.install_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path(&self.layout.log_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path(&self.layout.state_dir)
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.state_dir().join("pids")
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.install_dir().join("venv")
    }

    /// Whether operations target the running system rather than a staging tree.
    pub fn targets_host(&self) -> bool {
        self.root == Path::new("/")
    }
}

fn default_config_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("sonjayos").join(CONFIG_FILENAME));
    }
    candidates.push(PathBuf::from(SYSTEM_CONFIG_PATH));
    candidates
}

/// Immutable per-invocation context handed to every stage.
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    pub config: ProvisionConfig,
    pub mode: Mode,
    pub settings: ModeSettings,
}

impl ProvisionContext {
    pub fn new(config: ProvisionConfig, mode: Mode) -> Self {
        Self {
            config,
            mode,
            settings: mode.settings(),
        }
    }

    /// The same configuration under another mode.
    pub fn with_mode(&self, mode: Mode) -> Self {
        Self::new(self.config.clone(), mode)
    }

    /// Pass-through environment for downstream services.
    ///
    /// The pipeline writes and forwards these; it never reads them back.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let s = &self.settings;
        let absolute = |rel: &str| format!("/{}", rel.trim_start_matches('/'));
        BTreeMap::from([
            ("SONJAYOS_DEV_MODE".into(), (self.mode == Mode::Development).to_string()),
            ("SONJAYOS_MOCK_AI".into(), s.mock_ai.to_string()),
            ("SONJAYOS_DEBUG".into(), s.debug.to_string()),
            ("SONJAYOS_HOT_RELOAD".into(), s.hot_reload.to_string()),
            ("SONJAYOS_PROFILING".into(), s.profiling.to_string()),
            ("SONJAYOS_LOG_LEVEL".into(), s.log_level.to_string()),
            ("SONJAYOS_CONFIG_DIR".into(), absolute(&self.config.documents_dir(self.mode))),
            ("SONJAYOS_LOG_DIR".into(), absolute(&self.config.layout.log_dir)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_validate() {
        ProvisionConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let raw = r#"
            root = "/mnt/target"

            [services]
            ai_port = 9000

            [gpu]
            rocm = true
        "#;
        let config = ProvisionConfig::from_toml(raw, Path::new("test.toml")).unwrap();
        assert_eq!(config.root, PathBuf::from("/mnt/target"));
        assert_eq!(config.services.ai_port, 9000);
        assert_eq!(config.services.ui_port, 8001);
        assert!(config.gpu.rocm);
        assert_eq!(config.layout.config_dir, "etc/sonjayos");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = "[services]\nai_prot = 9000\n";
        let err = ProvisionConfig::from_toml(raw, Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn duplicate_ports_are_invalid() {
        let mut config = ProvisionConfig::default();
        config.services.ui_port = config.services.ai_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ollama_port_must_not_collide() {
        let mut config = ProvisionConfig::default();
        config.services.ollama_port = config.services.ui_port;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("8001 twice"));

        config.services.ollama_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_application_source_is_invalid() {
        let mut config = ProvisionConfig::default();
        config.application.source_dir = Some("src".into());
        assert!(config.validate().is_err());
        config.application.source_dir = Some("/srv/sonjayos/src".into());
        config.validate().unwrap();
    }

    #[test]
    fn documents_dir_per_mode() {
        let config = ProvisionConfig::default();
        assert_eq!(config.documents_dir(Mode::Production), "etc/sonjayos");
        assert_eq!(config.documents_dir(Mode::Development), "etc/sonjayos/dev");
        assert_eq!(config.ollama_url(), "http://localhost:11434");
    }

    #[test]
    fn absolute_layout_is_invalid() {
        let mut config = ProvisionConfig::default();
        config.layout.state_dir = "/var/lib/sonjayos".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.toml");
        let err = ProvisionConfig::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn explicit_file_is_loaded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("provision.toml");
        fs::write(&path, "[account]\nuser = \"ai\"\n").unwrap();
        let config = ProvisionConfig::load(Some(&path)).unwrap();
        assert_eq!(config.account.user, "ai");
    }

    #[test]
    fn paths_resolve_under_root() {
        let mut config = ProvisionConfig::default();
        config.root = PathBuf::from("/tmp/target");
        assert_eq!(config.config_dir(), PathBuf::from("/tmp/target/etc/sonjayos"));
        assert_eq!(config.path("/etc/passwd"), PathBuf::from("/tmp/target/etc/passwd"));
        assert!(!config.targets_host());
    }

    #[test]
    fn environment_follows_mode() {
        let dev = ProvisionContext::new(ProvisionConfig::default(), Mode::Development);
        let prod = ProvisionContext::new(ProvisionConfig::default(), Mode::Production);
        assert_eq!(dev.environment()["SONJAYOS_DEV_MODE"], "true");
        assert_eq!(prod.environment()["SONJAYOS_DEV_MODE"], "false");
        assert_eq!(prod.environment()["SONJAYOS_CONFIG_DIR"], "/etc/sonjayos");
        assert_eq!(dev.environment()["SONJAYOS_CONFIG_DIR"], "/etc/sonjayos/dev");
        let dev_keys: Vec<_> = dev.environment().into_keys().collect();
        let prod_keys: Vec<_> = prod.environment().into_keys().collect();
        assert_eq!(dev_keys, prod_keys);
    }
}
