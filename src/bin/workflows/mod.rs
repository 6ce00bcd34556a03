mod history;
mod image;
mod install;
mod mode;

use anyhow::{Context, Result};
use sonjayos_provision::config::{Mode, ProvisionConfig, ProvisionContext};
use sonjayos_provision::preflight::HostFacts;
use tracing::debug;

use crate::GlobalArgs;

pub(crate) use history::history;
pub(crate) use image::{build_image, IsoArgs};
pub(crate) use install::install;
pub(crate) use mode::run_mode;

/// Config from `--config` (or the default search), with `--root` applied.
pub(crate) fn load_context(global: &GlobalArgs, mode: Mode) -> Result<ProvisionContext> {
    let mut config = ProvisionConfig::load(global.config.as_deref())?;
    if let Some(root) = &global.root {
        config.root = root.clone();
    }
    config.validate()?;
    debug!(root = %config.root.display(), mode = %mode, "context loaded");
    Ok(ProvisionContext::new(config, mode))
}

pub(crate) fn detect_host(ctx: &ProvisionContext) -> Result<HostFacts> {
    HostFacts::detect(&ctx.config.root, &ctx.config.install_dir())
        .with_context(|| format!("inspecting target root '{}'", ctx.config.root.display()))
}

pub(crate) fn print_header(title: &str, ctx: &ProvisionContext) {
    println!("{title} ({} mode, root {})", ctx.mode, ctx.config.root.display());
}
