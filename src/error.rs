//! Error taxonomy surfaced to the operator.
//!
//! Leaf handlers work with `anyhow` and attach context; the pipeline and the
//! service lifecycle translate failures into [`PipelineError`] so the binary
//! can map them onto distinct exit codes.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A required host tool and the package that provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTool {
    pub command: String,
    pub package: String,
}

impl fmt::Display for MissingTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (install: {})", self.command, self.package)
    }
}

/// An external command that exited unsuccessfully.
///
/// Carries the tool's exit status and stderr verbatim.
#[derive(Debug, Clone, Error)]
#[error("`{command}` exited with {}{}", describe_status(.code), describe_stderr(.stderr))]
pub struct CommandError {
    pub command: String,
    pub code: Option<i32>,
    pub stderr: String,
}

/// A host precondition that does not hold (unsupported OS, too little memory).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PreconditionError(pub String);

/// Configuration load or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to encode {document}: {message}")]
    Encode { document: String, message: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing required host tools:\n{}", list_missing(.0))]
    MissingTools(Vec<MissingTool>),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("stage '{stage}' failed: {source}")]
    StageExecution {
        stage: String,
        #[source]
        source: CommandError,
    },

    #[error("stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("invalid stage graph: {0}")]
    StageGraph(String),

    #[error("service '{service}' did not become active within {}s{}", .waited.as_secs(), describe_detail(.detail))]
    ServiceStart {
        service: String,
        waited: Duration,
        detail: String,
    },

    #[error("failed to stop service '{service}': {message}")]
    ServiceStop { service: String, message: String },

    #[error("artifact verification failed for '{}': {reason}", .path.display())]
    ArtifactVerification { path: PathBuf, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::MissingTools(_) => 3,
            PipelineError::Precondition(_) => 4,
            PipelineError::StageExecution { .. } | PipelineError::StageFailed { .. } => 5,
            PipelineError::StageGraph(_) => 6,
            PipelineError::ServiceStart { .. } | PipelineError::ServiceStop { .. } => 7,
            PipelineError::ArtifactVerification { .. } => 8,
            PipelineError::Config(_) => 9,
        }
    }

    /// Translate a leaf failure from inside a stage into the taxonomy.
    pub fn from_stage(stage: &str, err: anyhow::Error) -> Self {
        let err = match err.downcast::<CommandError>() {
            Ok(source) => {
                return PipelineError::StageExecution {
                    stage: stage.to_string(),
                    source,
                }
            }
            Err(err) => err,
        };
        let err = match err.downcast::<PreconditionError>() {
            Ok(PreconditionError(message)) => return PipelineError::Precondition(message),
            Err(err) => err,
        };
        PipelineError::StageFailed {
            stage: stage.to_string(),
            message: format!("{err:#}"),
        }
    }
}

/// Exit code for any error reaching `main`.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(pipeline) = err.downcast_ref::<PipelineError>() {
        return pipeline.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 9;
    }
    1
}

fn describe_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "no exit status (terminated by signal)".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

fn describe_detail(detail: &str) -> String {
    if detail.trim().is_empty() {
        String::new()
    } else {
        format!("\n{}", detail.trim_end())
    }
}

fn list_missing(missing: &[MissingTool]) -> String {
    missing
        .iter()
        .map(|tool| format!("  {tool}"))
        .collect::<Vec<_>>()
        .join("\n")
}
