//! Installer ISO repackaging.
//!
//! # Example
//!
//! ```rust,ignore
//! use sonjayos_provision::artifact::{build_iso, Autoinstall, ImagePayload, IsoOptions};
//! use sonjayos_provision::process::SystemRunner;
//!
//! let payload = ImagePayload::new("ubuntu-24.04-live-server-amd64.iso", Autoinstall::default());
//! let artifact = build_iso(&payload, &IsoOptions::new("out/sonjayos.iso"), &SystemRunner)?;
//! println!("{}", artifact.sha512);
//! ```

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha512};
use tracing::{debug, info, warn};

use super::{autoinstall, boot_menu, ImagePayload};
use crate::error::PipelineError;
use crate::preflight::{check_required_tools, command_exists};
use crate::process::{Cmd, Runner};

/// Path of the boot menu inside the image.
pub const GRUB_CFG: &str = "/boot/grub/grub.cfg";
/// Offset of the primary volume descriptor's standard identifier.
pub const ISO9660_MAGIC_OFFSET: u64 = 32769;
pub const ISO9660_MAGIC: &[u8; 5] = b"CD001";
const CHECKSUM_SEPARATOR: &str = "  ";

#[derive(Debug, Clone)]
pub struct IsoOptions {
    pub output: PathBuf,
    /// Replace an existing output.
    pub force: bool,
}

impl IsoOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            force: false,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoArtifact {
    pub iso: PathBuf,
    pub checksum_file: PathBuf,
    pub sha512: String,
}

/// Assemble an installer image from `payload`.
///
/// The output only appears once it has been verified; a failed build leaves
/// neither the output nor its `.partial` behind.
pub fn build_iso(
    payload: &ImagePayload,
    options: &IsoOptions,
    runner: &dyn Runner,
) -> Result<IsoArtifact, PipelineError> {
    check_required_tools(runner, &[("xorriso", "xorriso")])?;

    if !payload.base_image.is_file() {
        return Err(PipelineError::Precondition(format!(
            "base image not found: {}",
            payload.base_image.display()
        )));
    }
    if let Some(dir) = &payload.payload_dir {
        if !dir.is_dir() {
            return Err(PipelineError::Precondition(format!(
                "payload directory not found: {}",
                dir.display()
            )));
        }
    }
    let output = &options.output;
    if output.exists() && !options.force {
        return Err(PipelineError::Precondition(format!(
            "refusing to overwrite {} (use --force)",
            output.display()
        )));
    }

    let partial = sibling(output, ".partial");
    let work = sibling_dir(output, ".work")?;
    let result = assemble(payload, output, &partial, &work, runner);

    if let Err(err) = fs::remove_dir_all(&work) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %work.display(), error = %err, "removing work directory");
        }
    }
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn assemble(
    payload: &ImagePayload,
    output: &Path,
    partial: &Path,
    work: &Path,
    runner: &dyn Runner,
) -> Result<IsoArtifact, PipelineError> {
    let step = |name: &'static str| move |err: anyhow::Error| PipelineError::from_stage(name, err);

    prepare_dir(work).map_err(step("prepare"))?;
    remove_if_exists(partial).map_err(step("prepare"))?;

    println!("  Extracting boot menu from {}", payload.base_image.display());
    let grub_path = work.join("grub.cfg");
    extract_boot_menu(runner, &payload.base_image, &grub_path).map_err(step("extract"))?;

    let menu = fs::read_to_string(&grub_path)
        .with_context(|| format!("reading extracted '{}'", grub_path.display()))
        .and_then(|raw| boot_menu::add_entries(&raw, &payload.boot_entries))
        .map_err(step("boot-menu"))?;
    fs::write(&grub_path, menu)
        .with_context(|| format!("writing '{}'", grub_path.display()))
        .map_err(step("boot-menu"))?;

    let seed = work.join(autoinstall::SEED_DIR);
    let user_data = autoinstall::user_data(&payload.autoinstall)?;
    write_seed(&seed, &user_data).map_err(step("autoinstall"))?;

    println!("  Repacking into {}", partial.display());
    let mut cmd = Cmd::new("xorriso")
        .arg("-indev")
        .arg_path(&payload.base_image)
        .arg("-outdev")
        .arg_path(partial)
        .arg("-map")
        .arg_path(&grub_path)
        .arg(GRUB_CFG)
        .arg("-map")
        .arg_path(&seed)
        .arg(format!("/{}", autoinstall::SEED_DIR));
    if let Some(dir) = &payload.payload_dir {
        cmd = cmd.arg("-map").arg_path(dir).arg("/sonjayos");
    }
    cmd.args(["-boot_image", "any", "replay"])
        .error_msg("xorriso failed to repack the image")
        .run_with(runner)
        .map_err(step("repack"))?;

    verify_iso9660(partial).map_err(|reason| PipelineError::ArtifactVerification {
        path: output.to_path_buf(),
        reason,
    })?;

    fs::rename(partial, output)
        .with_context(|| format!("renaming '{}' to '{}'", partial.display(), output.display()))
        .map_err(step("finalize"))?;

    let (sha512, checksum_file) = write_checksum(output).map_err(step("checksum"))?;
    println!("  SHA512: {}...{}", &sha512[..8], &sha512[sha512.len() - 8..]);
    println!("  Wrote: {}", checksum_file.display());
    info!(iso = %output.display(), "image built");

    Ok(IsoArtifact {
        iso: output.to_path_buf(),
        checksum_file,
        sha512,
    })
}

/// Copy `/boot/grub/grub.cfg` out of `image`, falling back to `7z` when
/// xorriso cannot extract it.
fn extract_boot_menu(runner: &dyn Runner, image: &Path, dest: &Path) -> Result<()> {
    let xorriso = Cmd::new("xorriso")
        .args(["-osirrox", "on", "-indev"])
        .arg_path(image)
        .args(["-extract", GRUB_CFG])
        .arg_path(dest)
        .run_with(runner);

    let err = match xorriso {
        Ok(_) if dest.is_file() => return Ok(()),
        Ok(_) => anyhow!("xorriso reported success but wrote no {GRUB_CFG}"),
        Err(err) => err,
    };
    if !command_exists(runner, "7z") {
        return Err(err);
    }
    debug!(error = %format!("{err:#}"), "xorriso extraction failed, trying 7z");

    let out_dir = dest
        .parent()
        .ok_or_else(|| anyhow!("no parent for '{}'", dest.display()))?;
    Cmd::new("7z")
        .args(["e", "-y"])
        .arg(format!("-o{}", out_dir.display()))
        .arg_path(image)
        .arg(GRUB_CFG.trim_start_matches('/'))
        .error_msg("7z could not extract the boot menu")
        .run_with(runner)?;
    if !dest.is_file() {
        return Err(err.context(format!("base image has no {GRUB_CFG}")));
    }
    Ok(())
}

fn write_seed(seed: &Path, user_data: &str) -> Result<()> {
    fs::create_dir_all(seed).with_context(|| format!("creating '{}'", seed.display()))?;
    fs::write(seed.join("user-data"), user_data).context("writing user-data")?;
    fs::write(seed.join("meta-data"), autoinstall::meta_data()).context("writing meta-data")?;
    Ok(())
}

/// Check that `path` is a non-empty ISO 9660 image.
pub fn verify_iso9660(path: &Path) -> Result<(), String> {
    let mut file = File::open(path).map_err(|e| format!("cannot open: {e}"))?;
    let len = file
        .metadata()
        .map_err(|e| format!("cannot stat: {e}"))?
        .len();
    if len == 0 {
        return Err("image is empty".into());
    }
    if len < ISO9660_MAGIC_OFFSET + ISO9660_MAGIC.len() as u64 {
        return Err(format!("image is only {len} bytes"));
    }
    let mut magic = [0u8; 5];
    file.seek(SeekFrom::Start(ISO9660_MAGIC_OFFSET))
        .and_then(|_| file.read_exact(&mut magic))
        .map_err(|e| format!("cannot read volume descriptor: {e}"))?;
    if &magic != ISO9660_MAGIC {
        return Err("no ISO 9660 signature (CD001) at byte 32769".into());
    }
    Ok(())
}

/// Write `<iso>.sha512` as `<hash>  <filename>` so `sha512sum -c` works from
/// the output directory.
pub fn write_checksum(iso: &Path) -> Result<(String, PathBuf)> {
    let mut file = File::open(iso).with_context(|| format!("opening '{}'", iso.display()))?;
    let mut hasher = Sha512::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("hashing '{}'", iso.display()))?;
    let hash = format!("{:x}", hasher.finalize());

    let filename = iso
        .file_name()
        .context("Could not get ISO filename")?
        .to_string_lossy();
    let checksum_path = sibling(iso, ".sha512");
    fs::write(&checksum_path, format!("{hash}{CHECKSUM_SEPARATOR}{filename}\n"))
        .with_context(|| format!("writing '{}'", checksum_path.display()))?;
    Ok((hash, checksum_path))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn sibling_dir(output: &Path, suffix: &str) -> Result<PathBuf, PipelineError> {
    let name = output.file_name().ok_or_else(|| {
        PipelineError::Precondition(format!("invalid output path: {}", output.display()))
    })?;
    let parent = output.parent().unwrap_or_else(|| Path::new("."));
    let mut dir = std::ffi::OsString::from(".");
    dir.push(name);
    dir.push(suffix);
    Ok(parent.join(dir))
}

fn prepare_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("removing stale '{}'", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing '{}'", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Autoinstall;
    use crate::testing::FakeHost;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ImagePayload, IsoOptions) {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("ubuntu.iso");
        fs::write(&base, b"base image").unwrap();
        let payload = ImagePayload::new(&base, Autoinstall::default());
        let options = IsoOptions::new(temp.path().join("out/sonjayos.iso"));
        fs::create_dir_all(temp.path().join("out")).unwrap();
        (temp, payload, options)
    }

    #[test]
    fn builds_verifies_and_checksums() {
        let (_temp, payload, options) = setup();
        let host = FakeHost::new();

        let artifact = build_iso(&payload, &options, &host).unwrap();
        assert!(artifact.iso.is_file());
        assert!(!sibling(&options.output, ".partial").exists());
        let checksum = fs::read_to_string(&artifact.checksum_file).unwrap();
        assert_eq!(checksum, format!("{}  sonjayos.iso\n", artifact.sha512));
        assert_eq!(artifact.sha512.len(), 128);

        let repack = host
            .calls_to("xorriso")
            .into_iter()
            .find(|c| c.contains("-outdev"))
            .unwrap();
        assert!(repack.contains("/boot/grub/grub.cfg"));
        assert!(repack.contains("/nocloud"));
        assert!(repack.ends_with("-boot_image any replay"));
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let (_temp, payload, options) = setup();
        fs::write(&options.output, b"previous").unwrap();

        let err = build_iso(&payload, &options, &FakeHost::new()).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(fs::read(&options.output).unwrap(), b"previous");

        build_iso(&payload, &options.clone().force(true), &FakeHost::new()).unwrap();
    }

    #[test]
    fn corrupt_output_fails_verification() {
        let (_temp, payload, options) = setup();
        let err = build_iso(&payload, &options, &FakeHost::new().corrupt_iso()).unwrap_err();
        assert_eq!(err.exit_code(), 8);
        assert!(!options.output.exists());
        assert!(!sibling(&options.output, ".partial").exists());
    }

    #[test]
    fn missing_xorriso_is_reported_first() {
        let (_temp, payload, options) = setup();
        let host = FakeHost::new().without_tool("xorriso");
        let err = build_iso(&payload, &options, &host).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(host.call_count(), 0);
    }

    #[test]
    fn missing_boot_menu_is_a_stage_error() {
        let (_temp, payload, options) = setup();
        let err = build_iso(&payload, &options, &FakeHost::new().without_grub_cfg()).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("extract"));
    }

    #[test]
    fn verify_rejects_small_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tiny.iso");
        fs::write(&path, b"x").unwrap();
        assert!(verify_iso9660(&path).unwrap_err().contains("bytes"));
    }
}
