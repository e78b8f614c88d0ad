//! The consolidated performance report and its text format.
//!
//! One line per `(algorithm, size)`: `algorithm,size,ms_avg,gflops_avg`, no
//! header, rows sorted by algorithm then size. The plotting scripts group the
//! lines by algorithm and put `size` on the x-axis.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{malformed_output, Result};
use crate::metrics::{Aggregate, DetailAggregates, Sample};

/// Averaged measurements for one report row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportEntry {
    pub ms_avg: f64,
    pub gflops_avg: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    rows: BTreeMap<(String, u32), ReportEntry>,
}

impl Report {
    /// Derives averages from merged trial aggregates.
    ///
    /// Fails with `DivisionByEmptyAggregate` if any key has a zero count.
    pub fn from_aggregates(aggregates: &DetailAggregates) -> Result<Report> {
        let mut rows = BTreeMap::new();
        for (key, aggregate) in aggregates {
            let entry = ReportEntry {
                ms_avg: aggregate.ms_avg()?,
                gflops_avg: aggregate.gflops_avg()?,
            };
            rows.insert(key.clone(), entry);
        }
        Ok(Report { rows })
    }

    /// Parses report text. Shares the sample line grammar with the kernel output.
    pub fn parse(text: &str) -> Result<Report> {
        let mut rows = BTreeMap::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let sample = Sample::parse_line(line, index + 1)?;
            let key = (sample.algorithm, sample.size);
            if rows.contains_key(&key) {
                return Err(malformed_output(index + 1, line, "duplicate report row"));
            }
            rows.insert(
                key,
                ReportEntry {
                    ms_avg: sample.elapsed_ms,
                    gflops_avg: sample.throughput_gflops,
                },
            );
        }
        Ok(Report { rows })
    }

    /// Reads a report file written by [`Report::write_to`].
    pub fn read_from(path: &Path) -> Result<Report> {
        Report::parse(&fs::read_to_string(path)?)
    }

    pub fn get(&self, algorithm: &str, size: u32) -> Option<&ReportEntry> {
        self.rows.get(&(algorithm.to_string(), size))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32, &ReportEntry)> {
        self.rows
            .iter()
            .map(|((algorithm, size), entry)| (algorithm.as_str(), *size, entry))
    }

    /// Each row as a single-sample aggregate holding the averages.
    pub fn to_aggregates(&self) -> DetailAggregates {
        self.rows
            .iter()
            .map(|(key, entry)| {
                let aggregate = Aggregate {
                    ms_sum: entry.ms_avg,
                    gflops_sum: entry.gflops_avg,
                    count: 1,
                };
                (key.clone(), aggregate)
            })
            .collect()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for (algorithm, size, entry) in self.iter() {
            // Writing into a String cannot fail.
            let _ = writeln!(out, "{algorithm},{size},{},{}", entry.ms_avg, entry.gflops_avg);
        }
        out
    }

    /// Writes the report, replacing any existing file.
    ///
    /// The text goes to a sibling temporary file first and is renamed over
    /// `path`, so a failed write never leaves a truncated report behind.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        fs::write(&staging, self.to_csv())?;
        fs::rename(&staging, path)?;
        Ok(())
    }
}
