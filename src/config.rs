//! Run configuration: size ranges, logging and the validated tuner settings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::level_filters::LevelFilter;

use crate::error::{invalid_config, Result, TuneError};
use crate::isa::SimdTier;
use crate::orchestrator::StaggerPolicy;

/// Problem sizes swept by one kernel invocation, `min:max:step` on the wire.
///
/// The kernel rejects zero or negative values and `min > max`, so those are
/// refused here before any process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

impl SizeRange {
    /// Creates a validated range.
    pub fn new(min: u32, max: u32, step: u32) -> Result<Self> {
        if min == 0 || max == 0 || step == 0 {
            return Err(invalid_config(format!(
                "size range {min}:{max}:{step} must be strictly positive"
            )));
        }
        if min > max {
            return Err(invalid_config(format!(
                "size range {min}:{max}:{step} has min greater than max"
            )));
        }
        Ok(Self { min, max, step })
    }

    /// Sizes the kernel will visit, in order.
    pub fn sizes(&self) -> impl Iterator<Item = u32> {
        (self.min..=self.max).step_by(self.step as usize)
    }
}

impl fmt::Display for SizeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.min, self.max, self.step)
    }
}

impl FromStr for SizeRange {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(invalid_config(format!(
                "size range '{s}' must have the form min:max:step"
            )));
        }

        let mut values = [0u32; 3];
        for (value, part) in values.iter_mut().zip(&parts) {
            *value = part
                .trim()
                .parse()
                .map_err(|_| invalid_config(format!("size range '{s}' has a non-integer bound")))?;
        }

        SizeRange::new(values[0], values[1], values[2])
    }
}

/// Logging configuration handed to `main`, derived from the integer verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub verbosity: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { verbosity: 2 }
    }
}

impl LogConfig {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    /// Higher verbosity means more output: 0 error, 1 warn, 2 info, 3 debug, 4+ trace.
    pub fn level_filter(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::ERROR,
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Installs a stderr fmt subscriber filtered at this verbosity.
    ///
    /// Fails if a global subscriber is already installed.
    pub fn init(&self) -> Result<()> {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_max_level(self.level_filter())
            .try_init()
            .map_err(|e| invalid_config(format!("cannot install logger: {e}")))
    }
}

/// Everything one tuning run needs, already validated.
#[derive(Debug, Clone)]
pub struct TuneConfig {
    /// Fixed unroll factor; `None` runs the unroll search.
    pub unroll: Option<u32>,
    /// Fixed block size; `None` runs the block-size search.
    pub block_size: Option<u32>,
    /// Narrow sweep used to score search candidates.
    pub search_range: SizeRange,
    /// Full sweep used by every final trial.
    pub final_range: SizeRange,
    pub pool_size: usize,
    pub trial_count: usize,
    pub restarts: usize,
    pub stagger: StaggerPolicy,
    /// Benchmark the OpenMP `_parallel` variants alongside the blocking ones.
    pub parallel: bool,
    /// Forces a SIMD tier instead of detecting it.
    pub simd: Option<SimdTier>,
    pub report_path: PathBuf,
    pub build_dir: PathBuf,
    pub log: LogConfig,
}

impl TuneConfig {
    pub fn validate(&self) -> Result<()> {
        if self.unroll == Some(0) {
            return Err(invalid_config("unroll must be positive"));
        }
        if self.block_size == Some(0) {
            return Err(invalid_config("block size must be positive"));
        }
        if self.pool_size == 0 {
            return Err(invalid_config("pool size must be at least 1"));
        }
        if self.trial_count == 0 {
            return Err(invalid_config("trial count must be at least 1"));
        }
        if self.restarts == 0 {
            return Err(invalid_config("search restarts must be at least 1"));
        }
        Ok(())
    }
}
