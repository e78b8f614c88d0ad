use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dgemm_tune::error::{invalid_config, Result};
use dgemm_tune::orchestrator::StaggerPolicy;
use dgemm_tune::pipeline;
use dgemm_tune::search::DEFAULT_RESTARTS;
use dgemm_tune::{
    GccBuilder, KernelProcess, LogConfig, SimdTier, SizeRange, TrialExecutor, TuneConfig,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Tunes the DGEMM kernel's unroll factor and block size, then benchmarks it"
)]
struct Cli {
    /// Unroll factor; skips the unroll search when set
    #[arg(long)]
    unroll: Option<u32>,

    /// Block size; skips the block-size search when set
    #[arg(long)]
    block_size: Option<u32>,

    /// Smallest matrix size of the final sweep
    #[arg(long, default_value_t = 64)]
    loop_min: u32,

    /// Largest matrix size of the final sweep
    #[arg(long, default_value_t = 2048)]
    loop_max: u32,

    /// Size increment of the final sweep
    #[arg(long, default_value_t = 64)]
    loop_step: u32,

    /// Sizes used to score search candidates, as min:max:step
    #[arg(long, default_value = "256:512:64")]
    search_loop: SizeRange,

    /// Worker threads for the final sweep (default: available cores)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Independent final sweeps averaged into the report
    #[arg(long, default_value_t = 10)]
    trials: usize,

    /// Restarts per parameter search
    #[arg(long, default_value_t = DEFAULT_RESTARTS)]
    restarts: usize,

    /// Delay between the starts of the first trials, in seconds
    #[arg(long, default_value_t = 1.0)]
    stagger_secs: f64,

    /// Number of leading trials that are staggered (default: pool size)
    #[arg(long)]
    stagger_count: Option<usize>,

    /// Also benchmark the OpenMP parallel variants
    #[arg(long)]
    parallel: bool,

    /// SIMD tier to assume instead of detecting it (avx512, avx256, manual)
    #[arg(long)]
    simd: Option<SimdTier>,

    /// C compiler used to build the kernel
    #[arg(long, default_value = "gcc")]
    cc: String,

    /// Kernel source file; repeat for several
    #[arg(long = "source", default_values = ["kernel/main.c", "kernel/dgemm.c"])]
    sources: Vec<PathBuf>,

    /// Directory for kernel binaries
    #[arg(long, default_value = "out")]
    build_dir: PathBuf,

    /// Output report file, overwritten on success
    #[arg(long, default_value = "report.csv")]
    report_path: PathBuf,

    /// Verbosity: 0 error, 1 warn, 2 info, 3 debug, 4 trace
    #[arg(long, default_value_t = 2)]
    log_level: u8,
}

impl Cli {
    fn into_config(self) -> Result<TuneConfig> {
        let pool_size = self.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let interval = Duration::try_from_secs_f64(self.stagger_secs).map_err(|_| {
            invalid_config("stagger delay must be a non-negative number of seconds")
        })?;

        Ok(TuneConfig {
            unroll: self.unroll,
            block_size: self.block_size,
            search_range: self.search_loop,
            final_range: SizeRange::new(self.loop_min, self.loop_max, self.loop_step)?,
            pool_size,
            trial_count: self.trials,
            restarts: self.restarts,
            stagger: StaggerPolicy::new(interval, self.stagger_count.unwrap_or(pool_size)),
            parallel: self.parallel,
            simd: self.simd,
            report_path: self.report_path,
            build_dir: self.build_dir,
            log: LogConfig::new(self.log_level),
        })
    }
}

fn run(cli: Cli) -> Result<()> {
    let builder = GccBuilder::new(cli.cc.clone(), cli.sources.clone());
    let executor = TrialExecutor::new(builder, KernelProcess);
    let config = cli.into_config()?;
    config.log.init()?;

    let tier = pipeline::resolve_tier(&config);
    let outcome = pipeline::run(&config, &executor, tier)?;

    println!(
        "simd={} unroll={} block_size={} rows={} report={}",
        outcome.tier,
        outcome.unroll,
        outcome.block_size,
        outcome.report.len(),
        config.report_path.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
