//! Parallel final sweeps and their merge into the report.
//!
//! Every trial is a full build-and-run of the tuned kernel. Trials run on a
//! bounded rayon pool; each worker thread builds into its own slot directory
//! so no two running trials ever share a kernel binary. The whole batch
//! fails on the first trial error and nothing is written in that case.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rayon::ThreadPoolBuilder;
use tracing::{debug, info};

use crate::error::{invalid_config, Result, TuneError};
use crate::metrics::DetailAggregates;
use crate::report::Report;
use crate::trial::{
    BenchRequest, BuildSpec, KernelBuilder, KernelRunner, TrialExecutor, KERNEL_BINARY,
};

/// Start-time spreading for the first tasks of a batch.
///
/// Task `i` waits `i * interval` before starting when `i < count`. With
/// `count` equal to the pool size only the initial burst is spread out;
/// later tasks are already staggered by waiting for a free worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerPolicy {
    pub interval: Duration,
    pub count: usize,
}

impl StaggerPolicy {
    pub fn new(interval: Duration, count: usize) -> Self {
        Self { interval, count }
    }

    /// No delay for any task.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn delay_for(&self, task_index: usize) -> Duration {
        if task_index < self.count {
            let factor = u32::try_from(task_index).unwrap_or(u32::MAX);
            self.interval.saturating_mul(factor)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for StaggerPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// One batch of final trials with fixed kernel parameters.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub unroll: u32,
    pub block_size: u32,
    pub trial_count: usize,
    pub request: BenchRequest,
    pub report_path: PathBuf,
}

/// Sums every trial's value per `(algorithm, size)`, counting each trial once.
pub fn merge_trials(trials: &[DetailAggregates]) -> DetailAggregates {
    let mut merged = DetailAggregates::new();
    for trial in trials {
        for (key, aggregate) in trial {
            match merged.get_mut(key) {
                Some(total) => total.absorb_trial(aggregate),
                None => {
                    let mut total = *aggregate;
                    total.count = 1;
                    merged.insert(key.clone(), total);
                }
            }
        }
    }
    merged
}

pub struct Orchestrator<'a, B, R> {
    executor: &'a TrialExecutor<B, R>,
    pool_size: usize,
    stagger: StaggerPolicy,
    build_dir: PathBuf,
}

impl<'a, B, R> Orchestrator<'a, B, R>
where
    B: KernelBuilder + Sync,
    R: KernelRunner + Sync,
{
    pub fn new(
        executor: &'a TrialExecutor<B, R>,
        pool_size: usize,
        build_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            pool_size,
            stagger: StaggerPolicy::none(),
            build_dir: build_dir.into(),
        }
    }

    pub fn with_stagger(mut self, stagger: StaggerPolicy) -> Self {
        self.stagger = stagger;
        self
    }

    /// Kernel binary location for a pool slot.
    pub fn slot_output_path(&self, slot: usize) -> PathBuf {
        self.build_dir.join(format!("slot-{slot}")).join(KERNEL_BINARY)
    }

    /// Runs every trial, merges them and writes the report.
    pub fn run_all(&self, plan: &SweepPlan) -> Result<Report> {
        let trials = self.run_trials(plan)?;
        let merged = merge_trials(&trials);
        let report = Report::from_aggregates(&merged)?;

        report.write_to(&plan.report_path)?;
        info!(
            path = %plan.report_path.display(),
            rows = report.len(),
            trials = trials.len(),
            "report written"
        );
        Ok(report)
    }

    /// Per-trial detailed metrics, in submission order.
    ///
    /// Every pool worker claims the next trial index from a shared counter,
    /// so indices start in order and the stagger delay follows start order.
    /// A failed trial stops further claims; trials already running finish.
    pub fn run_trials(&self, plan: &SweepPlan) -> Result<Vec<DetailAggregates>> {
        if self.pool_size == 0 {
            return Err(invalid_config("pool size must be at least 1"));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.pool_size)
            .thread_name(|slot| format!("trial-slot-{slot}"))
            .build()
            .map_err(|e| TuneError::WorkerPool(e.to_string()))?;

        info!(
            trials = plan.trial_count,
            pool_size = self.pool_size,
            unroll = plan.unroll,
            block_size = plan.block_size,
            "starting final sweep"
        );

        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let per_slot = pool.broadcast(|ctx| self.run_slot(ctx.index(), plan, &next, &failed));

        let mut finished = Vec::with_capacity(plan.trial_count);
        for slot in per_slot {
            finished.extend(slot?);
        }
        if finished.len() != plan.trial_count {
            return Err(TuneError::WorkerPool(format!(
                "{} of {} trials produced results",
                finished.len(),
                plan.trial_count
            )));
        }
        finished.sort_unstable_by_key(|&(index, _)| index);
        Ok(finished.into_iter().map(|(_, detail)| detail).collect())
    }

    /// Claims and runs trials on one pool slot until none are left.
    fn run_slot(
        &self,
        slot: usize,
        plan: &SweepPlan,
        next: &AtomicUsize,
        failed: &AtomicBool,
    ) -> Result<Vec<(usize, DetailAggregates)>> {
        let output_path = self.slot_output_path(slot);
        let mut finished = Vec::new();

        while !failed.load(Ordering::SeqCst) {
            let index = next.fetch_add(1, Ordering::SeqCst);
            if index >= plan.trial_count {
                break;
            }
            match self.run_trial(index, plan, &output_path) {
                Ok(detail) => finished.push((index, detail)),
                Err(e) => {
                    failed.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(finished)
    }

    fn run_trial(
        &self,
        index: usize,
        plan: &SweepPlan,
        output_path: &Path,
    ) -> Result<DetailAggregates> {
        let delay = self.stagger.delay_for(index);
        if !delay.is_zero() {
            debug!(trial = index, delay_ms = delay.as_millis() as u64, "staggering trial start");
            thread::sleep(delay);
        }

        let build = BuildSpec::new(plan.unroll, plan.block_size, output_path);

        let started = Instant::now();
        let detail = self.executor.detailed(&build, &plan.request)?;
        info!(
            trial = index,
            points = detail.len(),
            elapsed_s = started.elapsed().as_secs_f64(),
            "trial finished"
        );
        Ok(detail)
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }
}
