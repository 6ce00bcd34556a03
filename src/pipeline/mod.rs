//! Provisioning pipeline: plan, preflight, execute, record.
//!
//! A run is strictly sequential. Tools are checked for every planned stage
//! before anything on the target is touched, so a missing tool leaves no
//! state behind. The first failing non-advisory stage aborts the run.
//!
//! # Example
//!
//! ```rust,ignore
//! use sonjayos_provision::pipeline::{self, StageSet};
//!
//! let facts = HostFacts::detect(&ctx.config.root, &ctx.config.install_dir())?;
//! for outcome in pipeline::run(StageSet::Full, &ctx, &SystemRunner, &facts)? {
//!     println!("{outcome}");
//! }
//! ```

pub mod runs;
pub mod stages;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::component::Stage;
use crate::config::ProvisionContext;
use crate::error::PipelineError;
use crate::executor::{Executor, OpOutcome};
use crate::graph;
use crate::preflight::{check_required_tools, HostFacts};
use crate::process::Runner;

use runs::{RunManifest, StageRecord};

const LOCK_FILENAME: &str = "provision.lock";

/// Which part of the catalog a command runs. Chosen by the command, never by
/// the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSet {
    /// Everything, for `install`.
    Full,
    /// Directory layout and configuration documents, ahead of development
    /// services.
    Configure,
    /// Application code, configuration and unit registration, ahead of
    /// production services.
    Services,
}

impl StageSet {
    pub fn as_str(self) -> &'static str {
        match self {
            StageSet::Full => "full",
            StageSet::Configure => "configure",
            StageSet::Services => "services",
        }
    }

    /// Stage names in the set; `None` means the whole catalog.
    pub fn members(self) -> Option<&'static [&'static str]> {
        match self {
            StageSet::Full => None,
            StageSet::Configure => Some(&["detect", "layout", "configuration"]),
            StageSet::Services => Some(&[
                "detect",
                "layout",
                "application",
                "configuration",
                "services",
                "enable",
            ]),
        }
    }
}

impl fmt::Display for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// The stage ran; `changes` ops altered the target (0 when converged).
    Applied { changes: usize },
    /// The stage has nothing to do for this configuration.
    Skipped,
    /// Advisory conditions did not hold, or an advisory stage failed.
    Warned { warnings: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub name: String,
    pub status: StageStatus,
    pub duration: Duration,
}

impl StageOutcome {
    fn record(&self) -> StageRecord {
        let (status, changes, warnings) = match &self.status {
            StageStatus::Applied { changes } => ("applied", *changes, Vec::new()),
            StageStatus::Skipped => ("skipped", 0, Vec::new()),
            StageStatus::Warned { warnings } => ("warned", 0, warnings.clone()),
        };
        StageRecord {
            name: self.name.clone(),
            status: status.to_string(),
            changes,
            warnings,
            duration_ms: self.duration.as_millis() as u64,
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.duration.as_secs_f64();
        match &self.status {
            StageStatus::Applied { changes: 0 } => {
                write!(f, "{:<16} ok (up to date, {secs:.1}s)", self.name)
            }
            StageStatus::Applied { changes } => {
                write!(f, "{:<16} ok ({changes} changed, {secs:.1}s)", self.name)
            }
            StageStatus::Skipped => write!(f, "{:<16} skipped", self.name),
            StageStatus::Warned { warnings } => {
                write!(f, "{:<16} warning: {}", self.name, warnings.join("; "))
            }
        }
    }
}

/// Order the stages of `set` for execution.
///
/// Prerequisites come first; independent stages run by phase, then by
/// declaration order. Prerequisites outside the set count as satisfied, but
/// every name must exist in the catalog.
pub fn plan(
    catalog: Vec<Box<dyn Stage>>,
    set: StageSet,
) -> Result<Vec<Box<dyn Stage>>, PipelineError> {
    let known: BTreeSet<String> = catalog.iter().map(|s| s.name().to_string()).collect();
    for stage in &catalog {
        for req in stage.requires() {
            if !known.contains(*req) {
                return Err(PipelineError::StageGraph(format!(
                    "stage '{}' requires unknown stage '{req}'",
                    stage.name()
                )));
            }
        }
    }
    if let Some(members) = set.members() {
        if let Some(missing) = members.iter().find(|name| !known.contains(**name)) {
            return Err(PipelineError::StageGraph(format!(
                "stage set '{set}' names unknown stage '{missing}'"
            )));
        }
    }

    let mut selected: Vec<Box<dyn Stage>> = catalog
        .into_iter()
        .filter(|s| set.members().map_or(true, |m| m.contains(&s.name())))
        .collect();
    // Stable: equal phases keep declaration order.
    selected.sort_by_key(|s| s.phase());

    let index: BTreeMap<String, usize> = selected
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name().to_string(), i))
        .collect();
    let order = graph::topo_order(selected.len(), |i| {
        selected[i]
            .requires()
            .iter()
            .filter_map(|req| index.get(*req).copied())
            .collect()
    })
    .map_err(|stuck| {
        let names: Vec<&str> = stuck.iter().map(|&i| selected[i].name()).collect();
        PipelineError::StageGraph(format!("dependency cycle among: {}", names.join(", ")))
    })?;

    let mut slots: Vec<Option<Box<dyn Stage>>> = selected.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Run `set` from the built-in catalog.
pub fn run(
    set: StageSet,
    ctx: &ProvisionContext,
    runner: &dyn Runner,
    facts: &HostFacts,
) -> Result<Vec<StageOutcome>, PipelineError> {
    run_stages(stages::catalog(), set, ctx, runner, facts)
}

/// Run `set` from an explicit catalog.
pub fn run_stages(
    catalog: Vec<Box<dyn Stage>>,
    set: StageSet,
    ctx: &ProvisionContext,
    runner: &dyn Runner,
    facts: &HostFacts,
) -> Result<Vec<StageOutcome>, PipelineError> {
    let planned = plan(catalog, set)?;
    debug!(
        set = %set,
        stages = ?planned.iter().map(|s| s.name()).collect::<Vec<_>>(),
        "planned"
    );

    let tools: Vec<(&str, &str)> = planned
        .iter()
        .flat_map(|s| s.tools().iter().copied())
        .collect();
    check_required_tools(runner, &tools)?;

    let state_dir = ctx.config.state_dir();
    let _lock = RunLock::acquire(&state_dir)?;

    let run_id = runs::generate_run_id().map_err(internal)?;
    let mut manifest = RunManifest {
        run_id,
        mode: ctx.mode.as_str().to_string(),
        stage_set: set.as_str().to_string(),
        status: "running".into(),
        created_at_utc: runs::now_utc_compact(),
        finished_at_utc: None,
        stages: Vec::new(),
        error: None,
    };
    runs::write_manifest(&state_dir, &manifest).map_err(internal)?;
    info!(run_id = %manifest.run_id, set = %set, mode = %ctx.mode.as_str(), "pipeline started");

    let mut executor = Executor::new(ctx, runner, facts);
    let mut outcomes = Vec::with_capacity(planned.len());

    for stage in &planned {
        let name = stage.name();
        let started = Instant::now();
        let status = match run_stage(stage.as_ref(), ctx, &mut executor) {
            Ok(status) => status,
            Err(err) if stage.advisory() => {
                let message = format!("{err:#}");
                warn!(stage = name, error = %message, "advisory stage failed");
                StageStatus::Warned {
                    warnings: vec![message],
                }
            }
            Err(err) => {
                let err = PipelineError::from_stage(name, err);
                manifest.stages.push(StageRecord {
                    name: name.to_string(),
                    status: "failed".into(),
                    changes: 0,
                    warnings: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                finish(&state_dir, &mut manifest, "failed", Some(err.to_string()));
                return Err(err);
            }
        };
        let outcome = StageOutcome {
            name: name.to_string(),
            status,
            duration: started.elapsed(),
        };
        println!("  {outcome}");
        manifest.stages.push(outcome.record());
        outcomes.push(outcome);
    }

    finish(&state_dir, &mut manifest, "success", None);
    Ok(outcomes)
}

fn run_stage(
    stage: &dyn Stage,
    ctx: &ProvisionContext,
    executor: &mut Executor<'_>,
) -> Result<StageStatus> {
    let ops = stage.ops(ctx)?;
    if ops.is_empty() {
        debug!(stage = stage.name(), "nothing to do");
        return Ok(StageStatus::Skipped);
    }

    executor.begin_stage();
    let mut changes = 0;
    let mut warnings = Vec::new();
    for op in &ops {
        match executor
            .execute(op)
            .with_context(|| op.describe())?
        {
            OpOutcome::Applied => {
                debug!(stage = stage.name(), op = %op.describe(), "applied");
                changes += 1;
            }
            OpOutcome::Satisfied => {}
            OpOutcome::Warned(msg) => warnings.push(msg),
        }
    }

    Ok(if warnings.is_empty() {
        StageStatus::Applied { changes }
    } else {
        StageStatus::Warned { warnings }
    })
}

/// Final manifest write and pruning. Failures here do not change the result
/// of a run whose stages already completed.
fn finish(state_dir: &Path, manifest: &mut RunManifest, status: &str, error: Option<String>) {
    manifest.status = status.to_string();
    manifest.finished_at_utc = Some(runs::now_utc_compact());
    manifest.error = error;
    if let Err(err) = runs::write_manifest(state_dir, manifest) {
        warn!(error = %format!("{err:#}"), "recording run manifest");
    }
    if let Err(err) = runs::prune_old_runs(state_dir, runs::KEEP_RUNS) {
        warn!(error = %format!("{err:#}"), "pruning old runs");
    }
    info!(run_id = %manifest.run_id, status, "pipeline finished");
}

/// Recorded runs, newest first.
pub fn history(ctx: &ProvisionContext) -> Result<Vec<RunManifest>> {
    runs::load_runs(&ctx.config.state_dir())
}

fn internal(err: anyhow::Error) -> PipelineError {
    PipelineError::StageFailed {
        stage: "pipeline".into(),
        message: format!("{err:#}"),
    }
}

/// Exclusive lock on `<state>/provision.lock`, held for the whole run.
struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    fn acquire(state_dir: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state directory '{}'", state_dir.display()))
            .map_err(internal)?;
        let path = state_dir.join(LOCK_FILENAME);
        // Never unlink the lock file: a second process could lock a fresh
        // inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file '{}'", path.display()))
            .map_err(internal)?;
        if file.try_lock_exclusive().is_err() {
            return Err(PipelineError::Precondition(format!(
                "another provisioning run holds {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "run lock acquired");
        Ok(Self { _file: file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "run lock released");
    }
}
