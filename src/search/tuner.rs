//! The two concrete searches: unroll factor first, then block size.

use std::path::PathBuf;

use crate::config::SizeRange;
use crate::error::Result;
use crate::isa::SimdTier;
use crate::search::{ParameterSearch, SearchSpace, DEFAULT_RESTARTS};
use crate::trial::{
    BenchRequest, BuildSpec, KernelBuilder, KernelRunner, TrialExecutor, DEFAULT_BLOCK_SIZE,
};

/// Unroll factors are kept even.
pub const UNROLL_STEP: u32 = 2;

/// Times a block-size candidate may be evaluated within one restart.
pub const BLOCK_REVISIT_LIMIT: u32 = 3;

pub fn unroll_space() -> SearchSpace {
    SearchSpace {
        lower_bound: UNROLL_STEP,
        upper_bound: 2 * UNROLL_STEP,
        start: UNROLL_STEP,
        step: UNROLL_STEP,
        revisit_limit: None,
    }
}

/// Block sizes are multiples of `lane_width * unroll`, starting at one such tile.
pub fn block_size_space(lane_width: u32, unroll: u32) -> SearchSpace {
    let step = lane_width.saturating_mul(unroll);
    SearchSpace {
        lower_bound: step,
        upper_bound: step.saturating_mul(2),
        start: step,
        step,
        revisit_limit: Some(BLOCK_REVISIT_LIMIT),
    }
}

/// Drives both searches against one kernel build location.
///
/// Candidates are evaluated one at a time, so a single output path is
/// enough here; only the final sweep builds concurrently.
pub struct Tuner<'a, B, R> {
    executor: &'a TrialExecutor<B, R>,
    tier: SimdTier,
    search_range: SizeRange,
    output_path: PathBuf,
    restarts: usize,
    parallel: bool,
}

impl<'a, B: KernelBuilder, R: KernelRunner> Tuner<'a, B, R> {
    pub fn new(
        executor: &'a TrialExecutor<B, R>,
        tier: SimdTier,
        search_range: SizeRange,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            tier,
            search_range,
            output_path: output_path.into(),
            restarts: DEFAULT_RESTARTS,
            parallel: false,
        }
    }

    pub fn with_restarts(mut self, restarts: usize) -> Self {
        self.restarts = restarts;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Searches the unroll factor over the `*_unroll` variants.
    pub fn tune_unroll(&self) -> Result<u32> {
        let request = BenchRequest::new(
            self.tier.unroll_algorithms(),
            self.search_range,
            self.parallel,
        );
        let search = ParameterSearch::new("unroll", unroll_space(), self.restarts);

        search.run(|unroll| {
            let build = BuildSpec::new(unroll, DEFAULT_BLOCK_SIZE, &self.output_path);
            self.executor.collapsed(&build, &request)
        })
    }

    /// Searches the block size over the `*_unroll_blocking` variants for a fixed unroll.
    pub fn tune_block_size(&self, unroll: u32) -> Result<u32> {
        let request = BenchRequest::new(
            self.tier.blocking_algorithms(),
            self.search_range,
            self.parallel,
        );
        let space = block_size_space(self.tier.lane_width(), unroll);
        let search = ParameterSearch::new("block_size", space, self.restarts);

        search.run(|block_size| {
            let build = BuildSpec::new(unroll, block_size, &self.output_path);
            self.executor.collapsed(&build, &request)
        })
    }
}
