/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-worker logical clocks and the table-wide minimum clock.
//!
//! ## Invariants
//!
//! 1. The min clock never decreases.
//! 2. The min clock moves forward by exactly 1, and only when the advancing worker was the *unique*
//!    holder of the previous minimum. If two or more workers are tied at the minimum, advancing one of
//!    them leaves the min clock unchanged.

use std::collections::BTreeMap;

use crate::types::{ClockValue, WorkerId};

/// Tracks the progress of every worker registered on one table.
pub struct ProgressTracker {
    progresses: BTreeMap<WorkerId, ClockValue>,
    min_clock: ClockValue,
}

impl ProgressTracker {
    /// Create a tracker with no registered workers.
    pub fn new() -> Self {
        Self { progresses: BTreeMap::new(), min_clock: ClockValue::init() }
    }

    /// Register exactly `workers`, all at clock 0, and reset the min clock to 0.
    pub fn init(&mut self, workers: &[WorkerId]) {
        self.progresses = workers.iter().map(|worker| (*worker, ClockValue::init())).collect();
        self.min_clock = ClockValue::init();
    }

    /// Move `worker`'s clock forward by one.
    ///
    /// Returns `Some(new_min_clock)` if this advanced the min clock, or `None` if the min clock is
    /// unchanged.
    pub fn advance(&mut self, worker: WorkerId) -> Result<Option<ClockValue>, ProgressError> {
        let is_unique_min = self.is_unique_min(worker)?;
        let progress = self
            .progresses
            .get_mut(&worker)
            .ok_or(ProgressError::InvalidWorker { worker })?;
        *progress += 1;

        if is_unique_min {
            self.min_clock += 1;
            Ok(Some(self.min_clock))
        } else {
            Ok(None)
        }
    }

    /// Get the current clock of `worker`.
    pub fn progress(&self, worker: WorkerId) -> Result<ClockValue, ProgressError> {
        self.progresses
            .get(&worker)
            .copied()
            .ok_or(ProgressError::InvalidWorker { worker })
    }

    pub fn min_clock(&self) -> ClockValue {
        self.min_clock
    }

    /// Check whether `worker` is the only worker whose clock equals the min clock.
    pub fn is_unique_min(&self, worker: WorkerId) -> Result<bool, ProgressError> {
        if self.progress(worker)? != self.min_clock {
            return Ok(false);
        }
        let holders = self.progresses.values().filter(|progress| **progress == self.min_clock).count();
        Ok(holders == 1)
    }

    /// Check whether `worker` is registered.
    pub fn is_valid(&self, worker: WorkerId) -> bool {
        self.progresses.contains_key(&worker)
    }

    /// Fail with [`ProgressError::InvalidWorker`] if `worker` is not registered.
    pub fn check_valid(&self, worker: WorkerId) -> Result<(), ProgressError> {
        if !self.is_valid(worker) {
            return Err(ProgressError::InvalidWorker { worker });
        }
        Ok(())
    }

    pub fn num_workers(&self) -> usize {
        self.progresses.len()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerates the ways a [`ProgressTracker`] query can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum ProgressError {
    /// `worker` is not registered on this table.
    InvalidWorker { worker: WorkerId },
}

#[test]
fn advance_unique_min_test() {
    let (w2, w7) = (WorkerId::new(2), WorkerId::new(7));
    let mut tracker = ProgressTracker::new();
    tracker.init(&[w2, w7]);
    assert_eq!(tracker.num_workers(), 2);
    assert_eq!(tracker.min_clock(), ClockValue::init());

    // 7 is still tied at the minimum.
    assert_eq!(tracker.advance(w2), Ok(None));
    assert_eq!(tracker.min_clock(), ClockValue::new(0));

    assert_eq!(tracker.advance(w7), Ok(Some(ClockValue::new(1))));
    assert_eq!(tracker.advance(w7), Ok(None));
    assert_eq!(tracker.advance(w7), Ok(None));
    assert_eq!(tracker.advance(w2), Ok(Some(ClockValue::new(2))));

    assert_eq!(tracker.progress(w2), Ok(ClockValue::new(2)));
    assert_eq!(tracker.progress(w7), Ok(ClockValue::new(3)));
    assert_eq!(tracker.is_unique_min(w2), Ok(true));
    assert_eq!(tracker.is_unique_min(w7), Ok(false));
}

#[test]
fn invalid_worker_test() {
    let mut tracker = ProgressTracker::new();
    tracker.init(&[WorkerId::new(1)]);
    let stranger = WorkerId::new(9);
    assert!(!tracker.is_valid(stranger));
    assert_eq!(tracker.advance(stranger), Err(ProgressError::InvalidWorker { worker: stranger }));
    assert_eq!(tracker.progress(stranger), Err(ProgressError::InvalidWorker { worker: stranger }));

    // Re-initializing replaces the registry wholesale.
    tracker.advance(WorkerId::new(1)).unwrap();
    tracker.init(&[stranger]);
    assert!(tracker.is_valid(stranger));
    assert!(!tracker.is_valid(WorkerId::new(1)));
    assert_eq!(tracker.min_clock(), ClockValue::init());
}

#[test]
fn min_clock_is_non_decreasing_test() {
    use rand::Rng;

    let workers: Vec<WorkerId> = (0..5).map(WorkerId::new).collect();
    let mut tracker = ProgressTracker::new();
    tracker.init(&workers);
    let mut rng = rand::thread_rng();

    for _ in 0..500 {
        let worker = workers[rng.gen_range(0, workers.len())];
        let previous_min = tracker.min_clock();
        let was_unique_min = tracker.is_unique_min(worker).unwrap();
        let changed = tracker.advance(worker).unwrap();

        assert!(tracker.min_clock() >= previous_min);
        if was_unique_min {
            assert_eq!(changed, Some(previous_min + 1));
            assert_eq!(tracker.min_clock(), previous_min + 1);
        } else {
            assert_eq!(changed, None);
            assert_eq!(tracker.min_clock(), previous_min);
        }
        let true_min = workers.iter().map(|w| tracker.progress(*w).unwrap()).min().unwrap();
        assert_eq!(tracker.min_clock(), true_min);
    }
}
