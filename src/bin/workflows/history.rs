use anyhow::Result;
use sonjayos_provision::config::Mode;
use sonjayos_provision::pipeline;

use crate::GlobalArgs;

pub(crate) fn history(global: &GlobalArgs, limit: usize) -> Result<()> {
    // The mode does not affect where runs are recorded.
    let ctx = super::load_context(global, Mode::Production)?;
    let runs = pipeline::history(&ctx)?;
    if runs.is_empty() {
        println!("No recorded runs under {}", ctx.config.state_dir().display());
        return Ok(());
    }

    println!(
        "{:<24} {:<17} {:<12} {:<10} {:<8} STAGES",
        "RUN", "CREATED", "MODE", "SET", "STATUS"
    );
    for run in runs.iter().take(limit) {
        let changed: usize = run.stages.iter().map(|s| s.changes).sum();
        println!(
            "{:<24} {:<17} {:<12} {:<10} {:<8} {} ({changed} changes)",
            run.run_id,
            run.created_at_utc,
            run.mode,
            run.stage_set,
            run.status,
            run.stages.len()
        );
        if let Some(error) = &run.error {
            println!("    {error}");
        }
    }
    Ok(())
}
