use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use sonjayos_provision::artifact::{build_iso, Autoinstall, BootEntry, ImagePayload, IsoOptions};
use sonjayos_provision::process::SystemRunner;

#[derive(Args, Debug, Clone)]
pub(crate) struct IsoArgs {
    /// Ubuntu live ISO to repackage.
    #[arg(long, value_name = "ISO")]
    base: PathBuf,

    /// Where to write the installer image.
    #[arg(long, short, value_name = "ISO")]
    output: PathBuf,

    /// Directory shipped as /sonjayos on the image and installed by the
    /// unattended installer.
    #[arg(long, value_name = "DIR")]
    payload: Option<PathBuf>,

    #[arg(long, default_value = "sonjayos")]
    hostname: String,

    #[arg(long, default_value = "sonjay")]
    username: String,

    /// crypt(3) hash for the user; the account stays locked without one.
    #[arg(long, value_name = "HASH")]
    password_hash: Option<String>,

    /// Extra kernel arguments for the added boot entries.
    #[arg(long = "kernel-arg", value_name = "ARG")]
    kernel_args: Vec<String>,

    /// Replace an existing output image.
    #[arg(long)]
    force: bool,
}

pub(crate) fn build_image(args: &IsoArgs) -> Result<()> {
    let mut autoinstall = Autoinstall::default();
    autoinstall.identity.hostname = args.hostname.clone();
    autoinstall.identity.username = args.username.clone();
    if let Some(hash) = &args.password_hash {
        autoinstall.identity.password = hash.clone();
    }

    let mut payload = ImagePayload::new(&args.base, autoinstall);
    if let Some(dir) = &args.payload {
        payload = payload.with_payload_dir(dir);
        payload.autoinstall = payload.autoinstall.with_payload_install();
    }
    if !args.kernel_args.is_empty() {
        payload.boot_entries = payload
            .boot_entries
            .into_iter()
            .map(|entry| BootEntry {
                kernel_args: args.kernel_args.clone(),
                ..entry
            })
            .collect();
    }

    println!("Building installer image {}", args.output.display());
    let options = IsoOptions::new(&args.output).force(args.force);
    let artifact = build_iso(&payload, &options, &SystemRunner)?;
    println!("Built {}", artifact.iso.display());
    Ok(())
}
