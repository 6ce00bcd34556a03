//! External command invocation.
//!
//! Every stage shells out through [`Cmd`]. Execution goes through a
//! [`Runner`] so the whole pipeline can be driven against a scripted host in
//! tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use sonjayos_provision::process::{Cmd, SystemRunner};
//!
//! let out = Cmd::new("dpkg-query")
//!     .args(["-W", "-f=${Status}", "curl"])
//!     .allow_fail()
//!     .run_with(&SystemRunner)?;
//! let installed = out.success() && out.stdout.contains("install ok installed");
//! ```

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::CommandError;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes commands and locates tools on behalf of the pipeline.
pub trait Runner {
    /// Run a command to completion, capturing its output.
    fn exec(&self, cmd: &Cmd) -> io::Result<CmdResult>;

    /// Locate a tool on the host `PATH`.
    fn find_tool(&self, name: &str) -> Option<PathBuf>;
}

/// Runs commands on the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn exec(&self, cmd: &Cmd) -> io::Result<CmdResult> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        for (key, value) in &cmd.envs {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.dir {
            command.current_dir(dir);
        }
        let output = command.output()?;
        Ok(CmdResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

/// Builder for one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    dir: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            dir: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: impl AsRef<Path>) -> Self {
        self.args
            .push(path.as_ref().as_os_str().to_string_lossy().into_owned());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.envs.push((
            key.into(),
            value.as_ref().to_string_lossy().into_owned(),
        ));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Context attached when the command cannot be spawned or fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Treat a non-zero exit as data instead of an error (status queries).
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn get_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Run on the real host.
    pub fn run(&self) -> Result<CmdResult> {
        self.run_with(&SystemRunner)
    }

    /// Run through the given runner.
    ///
    /// A non-zero exit becomes a [`CommandError`] unless [`Cmd::allow_fail`]
    /// was set.
    pub fn run_with(&self, runner: &dyn Runner) -> Result<CmdResult> {
        debug!(command = %self, "running");
        let result = runner.exec(self).with_context(|| match &self.error_msg {
            Some(msg) => format!("spawning `{}`: {}", self, msg),
            None => format!("spawning `{}`", self),
        })?;

        if !self.allow_fail && !result.success() {
            let err = CommandError {
                command: self.to_string(),
                code: result.code,
                stderr: result.stderr.clone(),
            };
            return Err(match &self.error_msg {
                Some(msg) => anyhow::Error::new(err).context(msg.clone()),
                None => anyhow::Error::new(err),
            });
        }

        Ok(result)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace() {
        let cmd = Cmd::new("sh").args(["-c", "echo hi"]);
        assert_eq!(cmd.to_string(), "sh -c 'echo hi'");
    }

    #[test]
    fn test_system_runner_captures_output() {
        let out = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_failure_is_command_error() {
        let err = Cmd::new("sh")
            .args(["-c", "echo nope >&2; exit 7"])
            .run()
            .unwrap_err();
        let cmd_err = err.downcast_ref::<CommandError>().unwrap();
        assert_eq!(cmd_err.code, Some(7));
        assert_eq!(cmd_err.stderr.trim(), "nope");
    }

    #[test]
    fn test_allow_fail_returns_result() {
        let out = Cmd::new("sh")
            .args(["-c", "exit 3"])
            .allow_fail()
            .run()
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let result = Cmd::new("definitely_not_a_real_command_12345").run();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("definitely_not_a_real_command_12345"));
    }
}
