use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use sonjayos_provision::config::{Mode, ProvisionContext};
use sonjayos_provision::pipeline::{self, StageSet};
use sonjayos_provision::process::SystemRunner;
use sonjayos_provision::service::{self, ProcessSupervisor, ServiceDescriptor, Supervisor, SystemdSupervisor};
use tracing::{info, warn};

use crate::{GlobalArgs, ModeAction};

const FOREGROUND_POLL: Duration = Duration::from_millis(200);

pub(crate) fn run_mode(global: &GlobalArgs, mode: Mode, action: ModeAction) -> Result<()> {
    let ctx = super::load_context(global, mode)?;
    let services = service::catalog(&ctx);

    match (mode, action) {
        (Mode::Development, ModeAction::Start { detach }) => dev_start(&ctx, &services, detach),
        (Mode::Development, ModeAction::Restart { detach }) => {
            stop(&mut ProcessSupervisor::new(&ctx), &services)?;
            dev_start(&ctx, &services, detach)
        }
        (Mode::Development, ModeAction::Stop) => stop(&mut ProcessSupervisor::new(&ctx), &services),
        (Mode::Development, ModeAction::Status) => show_status(&ctx, &ProcessSupervisor::new(&ctx), &services),

        (Mode::Production, ModeAction::Start { .. }) => prod_start(&ctx, &services),
        (Mode::Production, ModeAction::Restart { .. }) => {
            stop(&mut systemd(&ctx), &services)?;
            prod_start(&ctx, &services)
        }
        (Mode::Production, ModeAction::Stop) => stop(&mut systemd(&ctx), &services),
        (Mode::Production, ModeAction::Status) => show_status(&ctx, &systemd(&ctx), &services),
    }
}

fn systemd(ctx: &ProvisionContext) -> SystemdSupervisor<'static> {
    SystemdSupervisor::new(&SystemRunner, Duration::from_secs(ctx.config.services.wait_secs))
}

fn stop(sup: &mut dyn Supervisor, services: &[ServiceDescriptor]) -> Result<()> {
    println!("Stopping services");
    service::teardown(sup, services)?;
    Ok(())
}

/// Service states followed by the dependencies they talk to.
pub(super) fn show_status(
    ctx: &ProvisionContext,
    sup: &dyn Supervisor,
    services: &[ServiceDescriptor],
) -> Result<()> {
    let states = service::status(sup, services)?;
    for state in states.iter().chain(&service::dependency_status(ctx)) {
        println!("  {state}");
    }
    Ok(())
}

fn prod_start(ctx: &ProvisionContext, services: &[ServiceDescriptor]) -> Result<()> {
    let facts = super::detect_host(ctx)?;
    super::print_header("Preparing SonjayOS services", ctx);
    pipeline::run(StageSet::Services, ctx, &SystemRunner, &facts)?;

    println!("Starting services");
    let mut sup = systemd(ctx);
    service::start_all(&mut sup, services)?;
    show_status(ctx, &sup, services)
}

fn dev_start(ctx: &ProvisionContext, services: &[ServiceDescriptor], detach: bool) -> Result<()> {
    let facts = super::detect_host(ctx)?;
    super::print_header("Preparing SonjayOS development environment", ctx);
    pipeline::run(StageSet::Configure, ctx, &SystemRunner, &facts)?;

    // Registered before spawning so an early interrupt still reaches the
    // shutdown path below.
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&interrupted))
            .context("registering signal handler")?;
    }

    println!("Starting services");
    let mut sup = ProcessSupervisor::new(ctx);
    service::start_all(&mut sup, services)?;

    if detach {
        println!("Services detached; stop them with `sonjayos dev stop`.");
        sup.detach();
        return Ok(());
    }

    let mut running = sup.running();
    if running.is_empty() {
        println!("Services were already running; nothing to supervise.");
        return Ok(());
    }
    println!("Supervising {} (Ctrl-C to stop)", running.join(", "));

    while !interrupted.load(Ordering::Relaxed) {
        thread::sleep(FOREGROUND_POLL);
        let now = sup.running();
        for gone in running.iter().filter(|name| !now.contains(name)) {
            warn!(service = %gone, "service exited");
            println!("  {gone} exited");
        }
        running = now;
        if running.is_empty() {
            break;
        }
    }

    info!("shutting down development services");
    println!("Stopping services");
    sup.shutdown()?;
    Ok(())
}
