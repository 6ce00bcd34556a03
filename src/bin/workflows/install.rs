use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sonjayos_provision::config::Mode;
use sonjayos_provision::pipeline::{self, StageSet};
use sonjayos_provision::process::SystemRunner;
use sonjayos_provision::service::{self, SystemdSupervisor};

use crate::GlobalArgs;

pub(crate) fn install(
    global: &GlobalArgs,
    mode: Mode,
    no_start: bool,
    source: Option<&Path>,
) -> Result<()> {
    let mut ctx = super::load_context(global, mode)?;
    if let Some(source) = source {
        let source = fs::canonicalize(source)
            .with_context(|| format!("resolving source directory '{}'", source.display()))?;
        ctx.config.application.source_dir = Some(source);
        ctx.config.validate()?;
    }
    let facts = super::detect_host(&ctx)?;

    super::print_header("Installing SonjayOS", &ctx);
    pipeline::run(StageSet::Full, &ctx, &SystemRunner, &facts)?;

    if no_start {
        println!("Provisioned; services left stopped (--no-start).");
        return Ok(());
    }
    if !ctx.config.targets_host() {
        println!(
            "Provisioned {}; services start when that system boots.",
            ctx.config.root.display()
        );
        return Ok(());
    }

    println!("Starting services");
    let services = service::catalog(&ctx);
    let wait = Duration::from_secs(ctx.config.services.wait_secs);
    let mut sup = SystemdSupervisor::new(&SystemRunner, wait);
    service::start_all(&mut sup, &services)?;
    super::mode::show_status(&ctx, &sup, &services)
}
