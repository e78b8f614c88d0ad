//! Build-and-run of one kernel configuration.
//!
//! A trial is two external processes: the compiler, parameterised by a
//! [`BuildSpec`], and the resulting binary, parameterised by a
//! [`BenchRequest`]. Both sit behind traits so the search engine and the
//! orchestrator can be driven without a C toolchain.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, trace};

use crate::config::SizeRange;
use crate::error::{benchmark_failed, build_failed, Result};
use crate::metrics::{
    parse_collapsed, parse_detailed, parse_output, AlgorithmAggregates, DetailAggregates, Metrics,
    ParseMode,
};

/// Block size baked into the kernel when none is requested.
pub const DEFAULT_BLOCK_SIZE: u32 = 32;

/// File name of the compiled kernel inside its build directory.
pub const KERNEL_BINARY: &str = "dgemm";

/// Parameters of one kernel build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub unroll: u32,
    pub block_size: u32,
    pub output_path: PathBuf,
}

impl BuildSpec {
    pub fn new(unroll: u32, block_size: u32, output_path: impl Into<PathBuf>) -> Self {
        Self {
            unroll,
            block_size,
            output_path: output_path.into(),
        }
    }
}

/// What to run once the kernel is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchRequest {
    pub algorithms: BTreeSet<String>,
    pub size_range: SizeRange,
    /// Also run the OpenMP `_parallel` companion of every blocking variant.
    pub parallel: bool,
}

impl BenchRequest {
    pub fn new<I, S>(algorithms: I, size_range: SizeRange, parallel: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            algorithms: algorithms.into_iter().map(Into::into).collect(),
            size_range,
            parallel,
        }
    }

    /// Comma-separated `--dgemm` argument.
    pub fn algorithm_filter(&self) -> String {
        let mut names = self.algorithms.clone();
        if self.parallel {
            let parallel: Vec<String> = self
                .algorithms
                .iter()
                .filter(|name| name.ends_with("_blocking"))
                .map(|name| format!("{name}_parallel"))
                .collect();
            names.extend(parallel);
        }
        names.into_iter().collect::<Vec<_>>().join(",")
    }
}

/// Compiles the kernel for a [`BuildSpec`].
pub trait KernelBuilder {
    /// Must leave an executable at `spec.output_path` or return `BuildFailed`.
    fn build(&self, spec: &BuildSpec) -> Result<()>;
}

/// Runs a compiled kernel and returns its standard output.
pub trait KernelRunner {
    /// Returns `BenchmarkFailed` on a nonzero exit.
    fn run(&self, binary: &Path, request: &BenchRequest) -> Result<String>;
}

impl<F> KernelBuilder for F
where
    F: Fn(&BuildSpec) -> Result<()>,
{
    fn build(&self, spec: &BuildSpec) -> Result<()> {
        self(spec)
    }
}

impl<F> KernelRunner for F
where
    F: Fn(&Path, &BenchRequest) -> Result<String>,
{
    fn run(&self, binary: &Path, request: &BenchRequest) -> Result<String> {
        self(binary, request)
    }
}

/// Native compiler invocation with aggressive optimisation, OpenMP and libm.
#[derive(Debug, Clone)]
pub struct GccBuilder {
    compiler: String,
    sources: Vec<PathBuf>,
}

impl GccBuilder {
    pub fn new(compiler: impl Into<String>, sources: Vec<PathBuf>) -> Self {
        Self {
            compiler: compiler.into(),
            sources,
        }
    }

    pub fn command(&self, spec: &BuildSpec) -> Command {
        let mut command = Command::new(&self.compiler);
        command
            .args(["-O3", "-march=native", "-ftree-vectorize", "-fopenmp"])
            .args(&self.sources)
            .arg("-o")
            .arg(&spec.output_path)
            .arg(format!("-DUNROLL={}", spec.unroll))
            .arg(format!("-DBLOCK_SIZE={}", spec.block_size))
            .arg("-lm");
        command
    }
}

impl Default for GccBuilder {
    fn default() -> Self {
        Self::new(
            "gcc",
            vec![PathBuf::from("kernel/main.c"), PathBuf::from("kernel/dgemm.c")],
        )
    }
}

impl KernelBuilder for GccBuilder {
    fn build(&self, spec: &BuildSpec) -> Result<()> {
        let parent = spec.output_path.parent();
        if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut command = self.command(spec);
        trace!(?command, "invoking compiler");
        let output = command.output().map_err(|e| {
            build_failed(format!("could not start {}", self.compiler), e.to_string())
        })?;

        if !output.status.success() {
            return Err(build_failed(
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end(),
            ));
        }
        Ok(())
    }
}

/// Runs the compiled kernel as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelProcess;

impl KernelProcess {
    pub fn command(&self, binary: &Path, request: &BenchRequest) -> Command {
        let mut command = Command::new(binary);
        command
            .arg("--dgemm")
            .arg(request.algorithm_filter())
            .arg("--loop")
            .arg(request.size_range.to_string());
        command
    }
}

impl KernelRunner for KernelProcess {
    fn run(&self, binary: &Path, request: &BenchRequest) -> Result<String> {
        let mut command = self.command(binary, request);
        trace!(?command, "invoking kernel");
        let output = command.output().map_err(|e| {
            benchmark_failed(format!("could not start {}", binary.display()), e.to_string())
        })?;

        if !output.status.success() {
            return Err(benchmark_failed(
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Builds, runs and parses one trial.
#[derive(Debug, Clone)]
pub struct TrialExecutor<B, R> {
    builder: B,
    runner: R,
}

impl<B: KernelBuilder, R: KernelRunner> TrialExecutor<B, R> {
    pub fn new(builder: B, runner: R) -> Self {
        Self { builder, runner }
    }

    pub fn execute(
        &self,
        build: &BuildSpec,
        request: &BenchRequest,
        mode: ParseMode,
    ) -> Result<Metrics> {
        parse_output(&self.run(build, request)?, mode)
    }

    pub fn collapsed(
        &self,
        build: &BuildSpec,
        request: &BenchRequest,
    ) -> Result<AlgorithmAggregates> {
        parse_collapsed(&self.run(build, request)?)
    }

    pub fn detailed(&self, build: &BuildSpec, request: &BenchRequest) -> Result<DetailAggregates> {
        parse_detailed(&self.run(build, request)?)
    }

    fn run(&self, build: &BuildSpec, request: &BenchRequest) -> Result<String> {
        debug!(
            unroll = build.unroll,
            block_size = build.block_size,
            output = %build.output_path.display(),
            "building kernel"
        );
        self.builder.build(build)?;

        debug!(
            algorithms = %request.algorithm_filter(),
            sizes = %request.size_range,
            "running kernel"
        );
        self.runner.run(&build.output_path, request)
    }
}
