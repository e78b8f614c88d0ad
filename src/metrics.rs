//! Parsing of kernel output into aggregated throughput statistics.
//!
//! The kernel prints one sample per line, `algorithm,size,elapsed_ms,gflops`,
//! with no header. Two views are built from that text:
//!
//! - **Collapsed**: one [`Aggregate`] per algorithm, summed over every size in
//!   the sweep. The search engine only needs "average over the sweep" to
//!   compare candidates.
//! - **Detailed**: one [`Aggregate`] per `(algorithm, size)`, keeping the
//!   performance-vs-size curve for the final report.

use std::collections::BTreeMap;

use crate::error::{empty_aggregate, malformed_output, Result};

/// Number of comma-separated fields on every sample line.
pub const SAMPLE_FIELDS: usize = 4;

/// One benchmark observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub algorithm: String,
    pub size: u32,
    pub elapsed_ms: f64,
    pub throughput_gflops: f64,
}

impl Sample {
    /// Parses a single non-empty line. `line_no` is only used for diagnostics.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Sample> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != SAMPLE_FIELDS {
            return Err(malformed_output(
                line_no,
                line,
                format!("expected {SAMPLE_FIELDS} fields, found {}", fields.len()),
            ));
        }

        let algorithm = fields[0];
        if algorithm.is_empty() {
            return Err(malformed_output(line_no, line, "empty algorithm name"));
        }

        let size = fields[1]
            .parse::<u32>()
            .map_err(|_| malformed_output(line_no, line, "size is not an integer"))?;
        let elapsed_ms = fields[2]
            .parse::<f64>()
            .map_err(|_| malformed_output(line_no, line, "elapsed time is not a number"))?;
        let throughput_gflops = fields[3]
            .parse::<f64>()
            .map_err(|_| malformed_output(line_no, line, "throughput is not a number"))?;

        Ok(Sample {
            algorithm: algorithm.to_string(),
            size,
            elapsed_ms,
            throughput_gflops,
        })
    }
}

/// Running sums for a group of samples. Averages are derived, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aggregate {
    pub ms_sum: f64,
    pub gflops_sum: f64,
    pub count: u32,
}

impl Aggregate {
    pub fn from_sample(sample: &Sample) -> Self {
        Self {
            ms_sum: sample.elapsed_ms,
            gflops_sum: sample.throughput_gflops,
            count: 1,
        }
    }

    pub fn add_sample(&mut self, sample: &Sample) {
        self.ms_sum += sample.elapsed_ms;
        self.gflops_sum += sample.throughput_gflops;
        self.count += 1;
    }

    /// Folds in one trial's value for the same key, counting the trial once.
    pub fn absorb_trial(&mut self, other: &Aggregate) {
        self.ms_sum += other.ms_sum;
        self.gflops_sum += other.gflops_sum;
        self.count += 1;
    }

    pub fn ms_avg(&self) -> Result<f64> {
        self.average(self.ms_sum, "ms_avg")
    }

    pub fn gflops_avg(&self) -> Result<f64> {
        self.average(self.gflops_sum, "gflops_avg")
    }

    fn average(&self, sum: f64, what: &str) -> Result<f64> {
        if self.count == 0 {
            return Err(empty_aggregate(what));
        }
        Ok(sum / f64::from(self.count))
    }
}

/// Collapsed view: algorithm name to its aggregate over the whole sweep.
pub type AlgorithmAggregates = BTreeMap<String, Aggregate>;

/// Detailed view: `(algorithm, size)` to that point's aggregate.
pub type DetailAggregates = BTreeMap<(String, u32), Aggregate>;

/// Which view to build from a run's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Collapsed,
    Detailed,
}

/// Parsed output of one kernel run.
#[derive(Debug, Clone, PartialEq)]
pub enum Metrics {
    Collapsed(AlgorithmAggregates),
    Detailed(DetailAggregates),
}

fn samples(output: &str) -> impl Iterator<Item = Result<Sample>> + '_ {
    output
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| Sample::parse_line(line, index + 1))
}

/// Sums every sample per algorithm, ignoring size.
pub fn parse_collapsed(output: &str) -> Result<AlgorithmAggregates> {
    let mut aggregates = AlgorithmAggregates::new();
    for sample in samples(output) {
        let sample = sample?;
        match aggregates.get_mut(&sample.algorithm) {
            Some(aggregate) => aggregate.add_sample(&sample),
            None => {
                aggregates.insert(sample.algorithm.clone(), Aggregate::from_sample(&sample));
            }
        }
    }
    Ok(aggregates)
}

/// Keeps one sample per `(algorithm, size)`; a later line replaces an earlier one.
pub fn parse_detailed(output: &str) -> Result<DetailAggregates> {
    let mut aggregates = DetailAggregates::new();
    for sample in samples(output) {
        let sample = sample?;
        let aggregate = Aggregate::from_sample(&sample);
        aggregates.insert((sample.algorithm, sample.size), aggregate);
    }
    Ok(aggregates)
}

pub fn parse_output(output: &str, mode: ParseMode) -> Result<Metrics> {
    match mode {
        ParseMode::Collapsed => parse_collapsed(output).map(Metrics::Collapsed),
        ParseMode::Detailed => parse_detailed(output).map(Metrics::Detailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TuneError;

    const RUN: &str = "avx256_unroll,256,12,2.80\n\
                       avx256_unroll,320,20,3.28\n\
                       simple_unroll,256,40,0.84\n\
                       \n\
                       simple_unroll,320,81,0.81\n";

    #[test]
    fn test_parse_line() {
        let sample = Sample::parse_line("avx512_unroll_blocking,1024,85,25.26", 1).unwrap();
        assert_eq!(sample.algorithm, "avx512_unroll_blocking");
        assert_eq!(sample.size, 1024);
        assert_eq!(sample.elapsed_ms, 85.0);
        assert_eq!(sample.throughput_gflops, 25.26);
    }

    #[test]
    fn test_collapsed_averages_over_sizes() {
        let aggregates = parse_collapsed(RUN).unwrap();
        assert_eq!(aggregates.len(), 2);

        let avx = &aggregates["avx256_unroll"];
        assert_eq!(avx.count, 2);
        assert!((avx.ms_avg().unwrap() - 16.0).abs() < 1e-12);
        assert!((avx.gflops_avg().unwrap() - 3.04).abs() < 1e-12);

        let simple = &aggregates["simple_unroll"];
        assert_eq!(simple.count, 2);
        assert!((simple.gflops_avg().unwrap() - 0.825).abs() < 1e-12);
    }

    #[test]
    fn test_detailed_last_line_wins() {
        let output = "x,64,10,5\nx,128,30,6\nx,64,12,4\n";
        let aggregates = parse_detailed(output).unwrap();
        assert_eq!(aggregates.len(), 2);

        let point = &aggregates[&("x".to_string(), 64)];
        assert_eq!(point.count, 1);
        assert_eq!(point.ms_sum, 12.0);
        assert_eq!(point.gflops_sum, 4.0);
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let result = parse_collapsed("x,64,10,5\nx,64,notanumber\n");
        match result {
            Err(TuneError::MalformedOutput { line, text, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(text, "x,64,notanumber");
            }
            other => panic!("expected MalformedOutput, got {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_field_is_fatal() {
        assert!(matches!(
            parse_detailed("x,64,10,fast"),
            Err(TuneError::MalformedOutput { .. })
        ));
        assert!(matches!(
            parse_detailed("x,big,10,5"),
            Err(TuneError::MalformedOutput { .. })
        ));
        assert!(matches!(
            parse_detailed(",64,10,5"),
            Err(TuneError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_empty_output_gives_empty_maps() {
        assert!(parse_collapsed("").unwrap().is_empty());
        assert!(parse_detailed("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_empty_aggregate_average_fails() {
        let empty = Aggregate::default();
        assert!(matches!(
            empty.gflops_avg(),
            Err(TuneError::DivisionByEmptyAggregate(_))
        ));
        assert!(empty.ms_avg().is_err());
    }

    #[test]
    fn test_absorb_trial() {
        let mut a = Aggregate {
            ms_sum: 10.0,
            gflops_sum: 5.0,
            count: 1,
        };
        let b = Aggregate {
            ms_sum: 20.0,
            gflops_sum: 7.0,
            count: 1,
        };
        a.absorb_trial(&b);
        assert_eq!(
            a,
            Aggregate {
                ms_sum: 30.0,
                gflops_sum: 12.0,
                count: 2
            }
        );
        assert_eq!(a.ms_avg().unwrap(), 15.0);
        assert_eq!(a.gflops_avg().unwrap(), 6.0);
    }

    #[test]
    fn test_parse_output_modes() {
        assert!(matches!(
            parse_output(RUN, ParseMode::Collapsed),
            Ok(Metrics::Collapsed(_))
        ));
        assert!(matches!(
            parse_output(RUN, ParseMode::Detailed),
            Ok(Metrics::Detailed(ref d)) if d.len() == 4
        ));
    }
}
