//! Error types for dgemm-tune operations.
//!
//! Every failure in the tuner is fatal: nothing here is retried or recovered
//! locally. A flaky measurement is absorbed by the search restarts and the
//! trial averaging, never by re-running a failed process.

use thiserror::Error;

/// Errors that can occur while tuning or benchmarking the kernel.
#[derive(Error, Debug)]
pub enum TuneError {
    /// The compiler exited with a nonzero status or could not be started.
    #[error("kernel build failed ({status}): {stderr}")]
    BuildFailed {
        /// Exit status, or the spawn failure when the compiler never ran.
        status: String,
        /// Diagnostic text captured from the compiler.
        stderr: String,
    },
    /// The kernel binary exited with a nonzero status or could not be started.
    #[error("benchmark run failed ({status}): {stderr}")]
    BenchmarkFailed {
        /// Exit status, or the spawn failure when the binary never ran.
        status: String,
        /// Diagnostic text captured from the kernel binary.
        stderr: String,
    },
    /// A sample line did not have the expected four fields.
    #[error("malformed benchmark output on line {line}: {reason} ({text:?})")]
    MalformedOutput {
        /// 1-based line number within the captured output.
        line: usize,
        /// The offending line.
        text: String,
        /// Human-readable error message.
        reason: String,
    },
    /// An average was requested on an aggregate with no samples.
    #[error("average requested on an empty aggregate: {0}")]
    DivisionByEmptyAggregate(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("worker pool error: {0}")]
    WorkerPool(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dgemm-tune operations.
pub type Result<T> = std::result::Result<T, TuneError>;

/// Creates a build failure.
pub fn build_failed(status: impl ToString, stderr: impl Into<String>) -> TuneError {
    TuneError::BuildFailed {
        status: status.to_string(),
        stderr: stderr.into(),
    }
}

/// Creates a benchmark failure.
pub fn benchmark_failed(status: impl ToString, stderr: impl Into<String>) -> TuneError {
    TuneError::BenchmarkFailed {
        status: status.to_string(),
        stderr: stderr.into(),
    }
}

/// Creates a malformed-output error for the given 1-based line.
pub fn malformed_output(line: usize, text: &str, reason: impl Into<String>) -> TuneError {
    TuneError::MalformedOutput {
        line,
        text: text.to_string(),
        reason: reason.into(),
    }
}

/// Creates an empty-aggregate error.
pub fn empty_aggregate(context: impl Into<String>) -> TuneError {
    TuneError::DivisionByEmptyAggregate(context.into())
}

/// Creates a configuration error.
pub fn invalid_config(message: impl Into<String>) -> TuneError {
    TuneError::InvalidConfig(message.into())
}
