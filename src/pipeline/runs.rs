//! Run records under `<state>/runs/<run-id>/run-manifest.json`.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Number of run records kept after each run.
pub const KEEP_RUNS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    /// `applied`, `skipped`, `warned` or `failed`.
    pub status: String,
    #[serde(default)]
    pub changes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub mode: String,
    pub stage_set: String,
    /// `running`, `success` or `failed`.
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn runs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("runs")
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Sortable, collision-resistant run id (base62 of time, pid and a counter).
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128) << (RUN_ID_SALT_BITS - 16);
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let id = base62_encode_u128(entropy);
    if id.len() > 22 {
        bail!("run id overflow while generating run identifier")
    }
    Ok(id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

/// `YYYYMMDDTHHMMSSZ`; sorts lexicographically.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub fn write_manifest(state_dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let path = manifest_path(&runs_dir(state_dir).join(&manifest.run_id));
    write_json_atomic(&path, manifest)
        .with_context(|| format!("writing run manifest '{}'", path.display()))?;
    Ok(path)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let mut payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    payload.push(b'\n');
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Every readable run manifest, newest first.
pub fn load_runs(state_dir: &Path) -> Result<Vec<RunManifest>> {
    let dir = runs_dir(state_dir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("reading runs directory '{}'", dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("iterating runs directory '{}'", dir.display()))?;
        let run_dir = entry.path();
        let hidden = run_dir
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(true, |name| name.starts_with('.'));
        if !run_dir.is_dir() || hidden {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        let parsed: RunManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful_run(state_dir: &Path) -> Result<Option<RunManifest>> {
    Ok(load_runs(state_dir)?
        .into_iter()
        .find(|run| run.status == "success"))
}

/// Remove all but the newest `keep` runs.
pub fn prune_old_runs(state_dir: &Path, keep: usize) -> Result<()> {
    let dir = runs_dir(state_dir);
    for run in load_runs(state_dir)?.into_iter().skip(keep) {
        let path = dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
    }
    Ok(())
}

fn run_sort_key(run: &RunManifest) -> (String, String) {
    (run.created_at_utc.clone(), run.run_id.clone())
}
