//! Installer image assembly.
//!
//! The ISO pipeline never writes ISO 9660 itself. It takes an Ubuntu live
//! image, extracts and rewrites its boot menu, adds a cloud-init NoCloud seed
//! and an optional payload tree, and hands the result to `xorriso` to
//! repackage:
//! - [`boot_menu`] - GRUB menu rewriting
//! - [`autoinstall`] - NoCloud `user-data` / `meta-data`
//! - [`iso`] - extraction, repackaging, verification and checksums

pub mod autoinstall;
pub mod boot_menu;
pub mod iso;

use std::path::PathBuf;

pub use autoinstall::Autoinstall;
pub use iso::{build_iso, IsoArtifact, IsoOptions};

/// One boot menu entry added in front of the base image's entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub title: String,
    /// Extra kernel arguments placed before `---`.
    pub kernel_args: Vec<String>,
    /// Boot the unattended installer (adds the NoCloud seed arguments).
    pub autoinstall: bool,
}

impl BootEntry {
    pub fn autoinstall(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kernel_args: Vec::new(),
            autoinstall: true,
        }
    }

    pub fn live(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kernel_args: Vec::new(),
            autoinstall: false,
        }
    }
}

/// Everything that goes into one installer image.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Ubuntu live-server or desktop ISO to repackage.
    pub base_image: PathBuf,
    /// Directory copied to `/sonjayos` on the image.
    pub payload_dir: Option<PathBuf>,
    pub boot_entries: Vec<BootEntry>,
    pub autoinstall: Autoinstall,
}

impl ImagePayload {
    /// The default SonjayOS menu: an unattended install entry and a live
    /// session entry.
    pub fn new(base_image: impl Into<PathBuf>, autoinstall: Autoinstall) -> Self {
        Self {
            base_image: base_image.into(),
            payload_dir: None,
            boot_entries: vec![
                BootEntry::autoinstall("Install SonjayOS (automated)"),
                BootEntry::live("Try SonjayOS"),
            ],
            autoinstall,
        }
    }

    pub fn with_payload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.payload_dir = Some(dir.into());
        self
    }
}
