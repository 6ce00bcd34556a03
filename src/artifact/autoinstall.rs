//! Ubuntu autoinstall descriptor, delivered as a cloud-init NoCloud seed.

use serde::{Deserialize, Serialize};

use crate::documents::Validate;
use crate::error::ConfigError;

/// Location of the seed on the image; matches the `ds=nocloud;s=` argument.
pub const SEED_DIR: &str = "nocloud";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub layout: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub hostname: String,
    pub realname: String,
    pub username: String,
    /// crypt(3) hash. `!` locks the account until a password is set.
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ssh {
    #[serde(rename = "install-server")]
    pub install_server: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Autoinstall {
    pub version: u8,
    pub locale: String,
    pub keyboard: Keyboard,
    pub identity: Identity,
    pub ssh: Ssh,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(rename = "late-commands", default, skip_serializing_if = "Vec::is_empty")]
    pub late_commands: Vec<String>,
}

impl Default for Autoinstall {
    fn default() -> Self {
        Self {
            version: 1,
            locale: "en_US.UTF-8".into(),
            keyboard: Keyboard {
                layout: "us".into(),
            },
            identity: Identity {
                hostname: "sonjayos".into(),
                realname: "SonjayOS User".into(),
                username: "sonjay".into(),
                password: "!".into(),
            },
            ssh: Ssh {
                install_server: false,
            },
            packages: vec!["curl".into(), "git".into()],
            late_commands: Vec::new(),
        }
    }
}

impl Autoinstall {
    /// Install the payload shipped under `/sonjayos` on the medium and run
    /// the provisioning pipeline inside the installed system.
    pub fn with_payload_install(mut self) -> Self {
        self.late_commands.extend([
            "cp -a /cdrom/sonjayos /target/opt/sonjayos-media".to_string(),
            "curtin in-target --target=/target -- /opt/sonjayos-media/sonjayos install --no-start"
                .to_string(),
        ]);
        self
    }
}

impl Validate for Autoinstall {
    fn validate(&self) -> Result<(), String> {
        if self.version != 1 {
            return Err(format!("unsupported autoinstall version {}", self.version));
        }
        let id = &self.identity;
        if id.hostname.is_empty() || id.hostname.len() > 63 {
            return Err("hostname must be 1-63 characters".into());
        }
        let valid_user = !id.username.is_empty()
            && id.username.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
            && id
                .username
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid_user {
            return Err(format!("invalid username '{}'", id.username));
        }
        if id.password.is_empty() {
            return Err("identity.password must be a crypt hash or '!'".into());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct UserData<'a> {
    autoinstall: &'a Autoinstall,
}

/// NoCloud `user-data`: `#cloud-config` followed by the YAML document.
pub fn user_data(config: &Autoinstall) -> Result<String, ConfigError> {
    let encode_err = |message: String| ConfigError::Encode {
        document: "user-data".into(),
        message,
    };
    config.validate().map_err(encode_err)?;
    let yaml = serde_yaml::to_string(&UserData { autoinstall: config })
        .map_err(|e| encode_err(e.to_string()))?;
    Ok(format!("#cloud-config\n{yaml}"))
}

/// NoCloud `meta-data`. Empty; the instance id defaults.
pub fn meta_data() -> String {
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_is_cloud_config() {
        let out = user_data(&Autoinstall::default()).unwrap();
        assert!(out.starts_with("#cloud-config\nautoinstall:\n"));
        assert!(out.contains("hostname: sonjayos"));
        assert!(out.contains("install-server: false"));
        assert!(!out.contains("late-commands"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(parsed["autoinstall"]["version"], serde_yaml::Value::from(1));
    }

    #[test]
    fn payload_install_adds_late_commands() {
        let out = user_data(&Autoinstall::default().with_payload_install()).unwrap();
        assert!(out.contains("late-commands:"));
        assert!(out.contains("curtin in-target"));
    }

    #[test]
    fn invalid_username_is_rejected() {
        let mut config = Autoinstall::default();
        config.identity.username = "Sonjay".into();
        let err = user_data(&config).unwrap_err();
        assert!(err.to_string().contains("invalid username"));
    }
}
