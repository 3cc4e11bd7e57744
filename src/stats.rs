//! Counters describing a running topology.
//!
//! Updated with relaxed atomics from every task; read with [`TopologyStats::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by all tasks of one topology.
#[derive(Debug, Default)]
pub struct TopologyStats {
  emitted: AtomicU64,
  processed: AtomicU64,
  completed: AtomicU64,
  failed: AtomicU64,
  timed_out: AtomicU64,
  stage_errors: AtomicU64,
}

/// Point-in-time copy of [`TopologyStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  /// Records emitted by sources.
  pub emitted: u64,
  /// Records handed to `process`.
  pub processed: u64,
  /// Tracked trees that completed.
  pub completed: u64,
  /// Tracked trees that failed (timeouts excluded).
  pub failed: u64,
  /// Tracked trees failed by the message timeout.
  pub timed_out: u64,
  /// Errors and panics raised by stage code.
  pub stage_errors: u64,
}

impl TopologyStats {
  /// Creates zeroed counters.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn record_emitted(&self) {
    self.emitted.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_processed(&self) {
    self.processed.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_completed(&self) {
    self.completed.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_failed(&self) {
    self.failed.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_timed_out(&self) {
    self.timed_out.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_stage_error(&self) {
    self.stage_errors.fetch_add(1, Ordering::Relaxed);
  }

  /// Copies the current values.
  #[must_use]
  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      emitted: self.emitted.load(Ordering::Relaxed),
      processed: self.processed.load(Ordering::Relaxed),
      completed: self.completed.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      timed_out: self.timed_out.load(Ordering::Relaxed),
      stage_errors: self.stage_errors.load(Ordering::Relaxed),
    }
  }
}
