//! Auto-tuning of the native DGEMM kernel's unroll factor and block size.
//!
//! The kernel is an external C program: it is rebuilt for every candidate
//! parameter value and benchmarked as a child process. The crate provides
//!
//! - [`metrics`]: parsing of the kernel's `algorithm,size,ms,gflops` lines,
//! - [`trial`]: one build-and-run of the kernel,
//! - [`search`]: the doubling-then-bisection parameter search with restarts,
//! - [`orchestrator`]: the parallel final sweep and its merge,
//! - [`report`]: the averaged report file,
//! - [`pipeline`]: all of the above wired together.

pub mod config;
pub mod error;
pub mod isa;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod search;
pub mod trial;

pub use config::{LogConfig, SizeRange, TuneConfig};
pub use error::{Result, TuneError};
pub use isa::SimdTier;
pub use metrics::{Aggregate, AlgorithmAggregates, DetailAggregates, ParseMode, Sample};
pub use orchestrator::{merge_trials, Orchestrator, StaggerPolicy, SweepPlan};
pub use report::Report;
pub use search::{ParameterSearch, SearchSpace};
pub use trial::{BenchRequest, BuildSpec, GccBuilder, KernelProcess, TrialExecutor};
