//! End-to-end run: searches, then the parallel final sweep.

use chrono::Local;
use tracing::info;

use crate::config::TuneConfig;
use crate::error::Result;
use crate::isa::{self, SimdTier};
use crate::orchestrator::{Orchestrator, SweepPlan};
use crate::report::Report;
use crate::search::Tuner;
use crate::trial::{BenchRequest, KernelBuilder, KernelRunner, TrialExecutor, KERNEL_BINARY};

/// Parameters chosen by a run and the report they produced.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub tier: SimdTier,
    pub unroll: u32,
    pub block_size: u32,
    pub report: Report,
}

/// The configured SIMD tier, or the detected one.
pub fn resolve_tier(config: &TuneConfig) -> SimdTier {
    config.simd.unwrap_or_else(isa::detect)
}

/// Runs whichever searches are not overridden, then the final sweep.
///
/// The report is only written once every trial has succeeded.
pub fn run<B, R>(
    config: &TuneConfig,
    executor: &TrialExecutor<B, R>,
    tier: SimdTier,
) -> Result<Outcome>
where
    B: KernelBuilder + Sync,
    R: KernelRunner + Sync,
{
    config.validate()?;
    info!(%tier, lanes = tier.lane_width(), "tuning kernel");

    let search_binary = config.build_dir.join("search").join(KERNEL_BINARY);
    let tuner = Tuner::new(executor, tier, config.search_range, search_binary)
        .with_restarts(config.restarts)
        .with_parallel(config.parallel);

    let unroll = match config.unroll {
        Some(unroll) => {
            info!(unroll, "unroll fixed by configuration");
            unroll
        }
        None => tuner.tune_unroll()?,
    };

    let block_size = match config.block_size {
        Some(block_size) => {
            info!(block_size, "block size fixed by configuration");
            block_size
        }
        None => tuner.tune_block_size(unroll)?,
    };

    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let sweep_dir = config.build_dir.join(format!("sweep-{stamp}"));
    let orchestrator =
        Orchestrator::new(executor, config.pool_size, sweep_dir).with_stagger(config.stagger);
    info!(dir = %orchestrator.build_dir().display(), "final sweep build directory");

    let plan = SweepPlan {
        unroll,
        block_size,
        trial_count: config.trial_count,
        request: BenchRequest::new(tier.report_algorithms(), config.final_range, config.parallel),
        report_path: config.report_path.clone(),
    };
    let report = orchestrator.run_all(&plan)?;

    Ok(Outcome {
        tier,
        unroll,
        block_size,
        report,
    })
}
