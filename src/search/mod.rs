//! Doubling-then-bisection search over one integer build parameter.
//!
//! Throughput measurements are noisy and not monotonic in the parameter, so
//! the search never trusts a single pass. One *restart* works like this:
//!
//! 1. Evaluate the current candidate and score it against the best aggregate
//!    seen so far: the mean, over every algorithm in the new aggregate, of
//!    `new.gflops_avg / best.gflops_avg` (a first observation scores 1).
//! 2. A score of at least 1 accepts the candidate and doubles into
//!    unexplored territory: `lower = current`, `upper = current = 2 * current`.
//! 3. Anything lower bisects back towards the last accepted value:
//!    `current = upper = align(lower + (upper - lower) / 2)`.
//! 4. Repeat while `upper - lower > 1`.
//!
//! Several independent restarts are run and the most frequent terminal value
//! wins, so one noisy restart cannot pick the parameter on its own.

pub mod tuner;

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{empty_aggregate, invalid_config, Result};
use crate::metrics::AlgorithmAggregates;

pub use tuner::{block_size_space, unroll_space, Tuner, UNROLL_STEP};

/// Restarts per parameter when not configured otherwise.
pub const DEFAULT_RESTARTS: usize = 5;

/// Starting bounds and legal-value grid of one parameter search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchSpace {
    pub lower_bound: u32,
    pub upper_bound: u32,
    pub start: u32,
    /// Candidates are rounded down to a multiple of this.
    pub step: u32,
    /// Stop a restart once a candidate would be evaluated more than this many times.
    pub revisit_limit: Option<u32>,
}

impl SearchSpace {
    pub fn align(&self, candidate: u32) -> u32 {
        candidate - candidate % self.step
    }

    fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(invalid_config("search step must be positive"));
        }
        if self.start == 0 || self.lower_bound == 0 {
            return Err(invalid_config("search must start from a positive value"));
        }
        if self.lower_bound > self.upper_bound {
            return Err(invalid_config(format!(
                "search lower bound {} exceeds upper bound {}",
                self.lower_bound, self.upper_bound
            )));
        }
        let aligned = |value: u32| self.align(value) == value;
        if !aligned(self.start) || !aligned(self.lower_bound) {
            return Err(invalid_config(format!(
                "search start {} is not a multiple of step {}",
                self.start, self.step
            )));
        }
        Ok(())
    }
}

/// Mutable state of a single restart.
#[derive(Debug, Clone)]
pub struct SearchState {
    pub lower_bound: u32,
    pub upper_bound: u32,
    pub current: u32,
    pub best: Option<AlgorithmAggregates>,
    pub revisit_counts: HashMap<u32, u32>,
}

impl SearchState {
    pub fn new(space: &SearchSpace) -> Self {
        Self {
            lower_bound: space.lower_bound,
            upper_bound: space.upper_bound,
            current: space.start,
            best: None,
            revisit_counts: HashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.upper_bound.saturating_sub(self.lower_bound) > 1
    }

    /// Counts a visit to `current`; false once the limit is exceeded.
    fn visit(&mut self, limit: Option<u32>) -> bool {
        let Some(limit) = limit else {
            return true;
        };
        let visits = self.revisit_counts.entry(self.current).or_insert(0);
        *visits += 1;
        *visits <= limit
    }

    fn accept(&mut self, aggregates: AlgorithmAggregates) {
        self.best = Some(aggregates);
        self.lower_bound = self.current;
        // Doubling past u32::MAX closes the interval on the accepted value.
        self.current = self.current.checked_mul(2).unwrap_or(self.current);
        self.upper_bound = self.current;
    }

    fn bisect(&mut self, space: &SearchSpace) {
        let midpoint = self.lower_bound + (self.upper_bound - self.lower_bound) / 2;
        self.current = space.align(midpoint);
        self.upper_bound = self.current;
    }
}

/// Mean throughput ratio of `new` against `best`, per algorithm.
///
/// Algorithms missing from `best`, or whose best throughput is not positive
/// (a kernel printing `0.00`), count as a neutral ratio of 1.
pub fn relative_score(
    new: &AlgorithmAggregates,
    best: Option<&AlgorithmAggregates>,
) -> Result<f64> {
    if new.is_empty() {
        return Err(empty_aggregate("no algorithm produced samples for this candidate"));
    }

    let mut total = 0.0;
    for (algorithm, aggregate) in new {
        let current = aggregate.gflops_avg()?;
        let previous = match best.and_then(|b| b.get(algorithm)) {
            Some(previous) => previous.gflops_avg()?,
            None => current,
        };
        total += if previous > 0.0 { current / previous } else { 1.0 };
    }
    Ok(total / new.len() as f64)
}

/// Most frequent value, ties going to the value seen first.
pub fn modal_value(values: &[u32]) -> Option<u32> {
    let mut counts: Vec<(u32, usize)> = Vec::new();
    for &value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(u32, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

/// A named search with a fixed number of restarts.
#[derive(Debug, Clone)]
pub struct ParameterSearch {
    name: &'static str,
    space: SearchSpace,
    restarts: usize,
}

impl ParameterSearch {
    pub fn new(name: &'static str, space: SearchSpace, restarts: usize) -> Self {
        Self {
            name,
            space,
            restarts,
        }
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Runs every restart and returns the modal terminal value.
    pub fn run<F>(&self, mut evaluate: F) -> Result<u32>
    where
        F: FnMut(u32) -> Result<AlgorithmAggregates>,
    {
        let terminals = self.run_restarts(&mut evaluate)?;
        let chosen = modal_value(&terminals).ok_or_else(|| {
            invalid_config(format!("{} search needs at least one restart", self.name))
        })?;
        if terminals.iter().any(|&value| value != chosen) {
            warn!(parameter = self.name, ?terminals, chosen, "restarts disagree");
        }
        info!(parameter = self.name, ?terminals, chosen, "search finished");
        Ok(chosen)
    }

    /// Terminal value of each restart, in order.
    pub fn run_restarts<F>(&self, evaluate: &mut F) -> Result<Vec<u32>>
    where
        F: FnMut(u32) -> Result<AlgorithmAggregates>,
    {
        self.space.validate()?;
        (0..self.restarts)
            .map(|restart| -> Result<u32> {
                let value = self.run_once(evaluate)?;
                info!(parameter = self.name, restart, value, "restart converged");
                Ok(value)
            })
            .collect()
    }

    /// One doubling-then-bisection pass.
    pub fn run_once<F>(&self, evaluate: &mut F) -> Result<u32>
    where
        F: FnMut(u32) -> Result<AlgorithmAggregates>,
    {
        let mut state = SearchState::new(&self.space);

        while state.is_open() {
            if !state.visit(self.space.revisit_limit) {
                debug!(parameter = self.name, candidate = state.current, "revisit limit reached");
                break;
            }

            let aggregates = evaluate(state.current)?;
            let score = relative_score(&aggregates, state.best.as_ref())?;
            debug!(
                parameter = self.name,
                candidate = state.current,
                lower = state.lower_bound,
                upper = state.upper_bound,
                score,
                "evaluated candidate"
            );

            if score >= 1.0 {
                state.accept(aggregates);
            } else {
                state.bisect(&self.space);
            }
        }

        Ok(state.current)
    }
}
