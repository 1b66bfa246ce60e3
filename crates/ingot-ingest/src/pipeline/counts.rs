//! Success/failure tallies and the final run report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::outcome::Outcome;

/// Immutable success/failure tally.
///
/// Merging is plain addition, so it is commutative and associative and the
/// order in which batches report does not matter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counts {
    pub success: u64,
    pub failure: u64,
}

impl Counts {
    pub fn new(success: u64, failure: u64) -> Self {
        Self { success, failure }
    }

    /// Tally a batch of outcomes
    pub fn of<T>(outcomes: &[Outcome<T>]) -> Self {
        let success = outcomes.iter().filter(|o| o.is_success()).count() as u64;
        Self {
            success,
            failure: outcomes.len() as u64 - success,
        }
    }

    pub fn total(&self) -> u64 {
        self.success + self.failure
    }

    /// No item failed (vacuously true for an empty run)
    pub fn all_success(&self) -> bool {
        self.failure == 0
    }

    /// No item succeeded (vacuously true for an empty run)
    pub fn all_failed(&self) -> bool {
        self.success == 0
    }

    pub fn merge(self, other: Counts) -> Counts {
        self + other
    }
}

impl Add for Counts {
    type Output = Counts;

    fn add(self, other: Counts) -> Counts {
        Counts {
            success: self.success + other.success,
            failure: self.failure + other.failure,
        }
    }
}

impl AddAssign for Counts {
    fn add_assign(&mut self, other: Counts) {
        *self = *self + other;
    }
}

impl std::iter::Sum for Counts {
    fn sum<I: Iterator<Item = Counts>>(iter: I) -> Counts {
        iter.fold(Counts::default(), Add::add)
    }
}

/// Running totals that several batch workers may merge into concurrently
#[derive(Debug, Default)]
pub struct CountsAccumulator {
    success: AtomicU64,
    failure: AtomicU64,
}

impl CountsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, counts: Counts) {
        self.success.fetch_add(counts.success, Ordering::Relaxed);
        self.failure.fetch_add(counts.failure, Ordering::Relaxed);
    }

    pub fn record<T>(&self, outcomes: &[Outcome<T>]) {
        self.add(Counts::of(outcomes));
    }

    pub fn snapshot(&self) -> Counts {
        Counts {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
        }
    }
}

/// Final report of one job run.
///
/// Always produced, including for runs that stopped early; `aborted` then
/// carries the reason and the counts cover everything processed until then.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    run_id: Uuid,
    job: String,
    counts: Counts,
    batches: u64,
    batches_persisted: u64,
    persist_failures: u64,
    aborted: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl Statistics {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: Uuid,
        job: String,
        counts: Counts,
        batches: u64,
        batches_persisted: u64,
        persist_failures: u64,
        aborted: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            job,
            counts,
            batches,
            batches_persisted,
            persist_failures,
            aborted,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.total()
    }

    pub fn success(&self) -> u64 {
        self.counts.success
    }

    pub fn failure(&self) -> u64 {
        self.counts.failure
    }

    pub fn all_success(&self) -> bool {
        self.counts.all_success()
    }

    pub fn all_failed(&self) -> bool {
        self.counts.all_failed()
    }

    /// Batches handed to the processor
    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn batches_persisted(&self) -> u64 {
        self.batches_persisted
    }

    /// Batches whose persistence step failed
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn duration_secs(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Process exit status for the run: 0 when nothing failed, 2 when a
    /// non-empty run had no success at all, 1 otherwise. An aborted run is
    /// never 0.
    pub fn exit_code(&self) -> u8 {
        if self.total() > 0 && self.all_failed() {
            2
        } else if self.all_success() && self.aborted.is_none() {
            0
        } else {
            1
        }
    }

    /// One-line human summary for logs
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}: {} items, {} succeeded, {} failed in {} batches ({} persisted",
            self.job,
            self.total(),
            self.success(),
            self.failure(),
            self.batches,
            self.batches_persisted
        );
        if self.persist_failures > 0 {
            summary.push_str(&format!(", {} persistence failures", self.persist_failures));
        }
        summary.push(')');
        if let Some(ref reason) = self.aborted {
            summary.push_str(&format!(", aborted: {}", reason));
        }
        summary
    }
}
