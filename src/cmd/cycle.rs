//! Foreground cycle commands - `enhancer cycle`, `enhancer drain`.

use std::time::Duration;

use anyhow::Result;

use enhancer::automation::orchestrator::Orchestrator;
use enhancer::config::EnhancerConfig;

pub async fn cmd_cycle(config: &EnhancerConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let report = orchestrator.run_cycle().await?;
    println!(
        "Processed {} request(s): {} submitted, {} failed",
        report.processed, report.submitted, report.failed
    );
    Ok(())
}

pub async fn cmd_drain(config: &EnhancerConfig, max_cycles: usize, interval_secs: u64) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let drained = orchestrator
        .drain(max_cycles, Duration::from_secs(interval_secs))
        .await?;
    println!(
        "Ran {} cycle(s): {} processed, {} submitted, {} failed, {} still pending",
        drained.cycles,
        drained.totals.processed,
        drained.totals.submitted,
        drained.totals.failed,
        drained.remaining
    );
    Ok(())
}
