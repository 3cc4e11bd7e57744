//! # Acker
//!
//! Delivery tracking for at-least-once semantics. Every tracked root emission
//! gets a [`DeliveryRecord`] keyed by its [`TrackingId`]; the record counts the
//! deliveries still outstanding in the tree derived from that root and
//! resolves the originating source task once the tree completes or any branch
//! fails.
//!
//! ## Protocol
//!
//! - [`Acker::register_root`]: pending count starts at 1 for the root copy.
//! - [`Acker::register_spawn`]: adds one per derived delivery. Must be called
//!   before those deliveries are dispatched, so an early ack can never drive
//!   the count to zero while spawns are still on their way.
//! - [`Acker::ack`]: subtracts one. At zero the tree is complete.
//! - [`Acker::fail`]: resolves the tree as failed, at most once.
//!
//! ## Checksum Guard
//!
//! Each delivered copy carries a random edge id. Registering a copy XORs its
//! edge into the record's checksum and acking it XORs the edge out again, so a
//! correctly acked tree reaches a zero count with a zero checksum. A non-zero
//! checksum at count zero means a copy was acked twice or with the wrong
//! anchor; the tree is then resolved as failed instead of complete.
//!
//! ## Callbacks
//!
//! Resolution is reported as a [`Completion`] message on the origin task's
//! channel; the source task invokes its own `on_complete` / `on_failed`, so
//! source state never leaves its task.
//!
//! ## Concurrency
//!
//! Records live in a sharded concurrent map; each update runs under the
//! entry's shard lock, which serializes all mutations of one tracking id.
//! Acks and fails for unknown ids are soft errors: logged and returned, never
//! escalated.

use crate::error::TrackerError;
use crate::record::{Anchor, TrackingId};
use crate::stats::TopologyStats;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How a tracked tree was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Completion {
  /// Every delivery in the tree was acked.
  Acked(TrackingId),
  /// A delivery was failed, or the checksum guard tripped.
  Failed(TrackingId),
  /// The tree exceeded the message timeout.
  TimedOut(TrackingId),
}

impl Completion {
  /// The resolved tree.
  #[must_use]
  pub const fn tracking_id(&self) -> TrackingId {
    match self {
      Completion::Acked(id) | Completion::Failed(id) | Completion::TimedOut(id) => *id,
    }
  }

  /// True for [`Completion::Acked`].
  #[must_use]
  pub const fn is_acked(&self) -> bool {
    matches!(self, Completion::Acked(_))
  }
}

/// Channel on which the originating source task receives resolutions.
pub type CompletionSender = mpsc::UnboundedSender<Completion>;

/// Tracking state of one root emission.
#[derive(Debug)]
pub struct DeliveryRecord {
  tracking_id: TrackingId,
  pending: i64,
  failed: bool,
  checksum: u64,
  origin: CompletionSender,
  created_at: Instant,
}

impl DeliveryRecord {
  /// Deliveries still outstanding.
  #[must_use]
  pub fn pending_count(&self) -> i64 {
    self.pending
  }

  /// Whether a failure was reported.
  #[must_use]
  pub fn is_failed(&self) -> bool {
    self.failed
  }

  /// XOR of the edge ids still outstanding.
  #[must_use]
  pub fn checksum(&self) -> u64 {
    self.checksum
  }
}

/// Per-topology delivery tracker.
#[derive(Debug)]
pub struct Acker {
  records: DashMap<TrackingId, DeliveryRecord>,
  stats: Arc<TopologyStats>,
}

impl Default for Acker {
  fn default() -> Self {
    Self::new()
  }
}

impl Acker {
  /// Creates an empty tracker with its own counters.
  #[must_use]
  pub fn new() -> Self {
    Self::with_stats(Arc::new(TopologyStats::new()))
  }

  /// Creates an empty tracker reporting into shared counters.
  #[must_use]
  pub fn with_stats(stats: Arc<TopologyStats>) -> Self {
    Self {
      records: DashMap::new(),
      stats,
    }
  }

  /// Number of unresolved trees.
  #[must_use]
  pub fn pending(&self) -> usize {
    self.records.len()
  }

  /// Outstanding deliveries of a tree, `None` once resolved.
  #[must_use]
  pub fn pending_count(&self, id: TrackingId) -> Option<i64> {
    self.records.get(&id).map(|r| r.pending)
  }

  /// Starts tracking a root emission whose first copy is `anchor`.
  ///
  /// # Errors
  ///
  /// [`TrackerError::DuplicateRoot`] if the id is already tracked; the
  /// existing record is left untouched.
  pub fn register_root(&self, anchor: Anchor, origin: CompletionSender) -> Result<(), TrackerError> {
    let id = anchor.tracking_id();
    match self.records.entry(id) {
      Entry::Occupied(_) => {
        warn!(tracking_id = %id, "root registered twice");
        Err(TrackerError::DuplicateRoot(id))
      }
      Entry::Vacant(slot) => {
        slot.insert(DeliveryRecord {
          tracking_id: id,
          pending: 1,
          failed: false,
          checksum: anchor.edge(),
          origin,
          created_at: Instant::now(),
        });
        trace!(tracking_id = %id, "Acker::register_root()");
        Ok(())
      }
    }
  }

  /// Adds one outstanding delivery per edge to the tree `id`.
  ///
  /// # Errors
  ///
  /// [`TrackerError::UnknownTrackingId`] if the tree is already resolved.
  pub fn register_spawn(&self, id: TrackingId, edges: &[u64]) -> Result<(), TrackerError> {
    match self.records.get_mut(&id) {
      Some(mut record) => {
        record.pending += edges.len() as i64;
        for edge in edges {
          record.checksum ^= edge;
        }
        trace!(tracking_id = %id, spawned = edges.len(), pending = record.pending, "Acker::register_spawn()");
        Ok(())
      }
      None => Err(unknown(id, "spawn")),
    }
  }

  /// Acknowledges one delivered copy.
  ///
  /// Returns the resolution if this ack resolved the tree.
  ///
  /// # Errors
  ///
  /// [`TrackerError::UnknownTrackingId`] if the tree is already resolved.
  pub fn ack(&self, anchor: Anchor) -> Result<Option<Completion>, TrackerError> {
    let id = anchor.tracking_id();
    let Entry::Occupied(mut slot) = self.records.entry(id) else {
      return Err(unknown(id, "ack"));
    };

    let record = slot.get_mut();
    record.pending -= 1;
    record.checksum ^= anchor.edge();
    trace!(tracking_id = %id, pending = record.pending, "Acker::ack()");
    if record.pending > 0 {
      return Ok(None);
    }

    let record = slot.remove();
    let completion = if record.checksum == 0 {
      self.stats.record_completed();
      Completion::Acked(id)
    } else {
      warn!(
        tracking_id = %id,
        checksum = record.checksum,
        "tree drained with a non-zero checksum; failing it"
      );
      self.stats.record_failed();
      Completion::Failed(id)
    };
    notify(&record, completion);
    Ok(Some(completion))
  }

  /// Fails the tree `id`.
  ///
  /// # Errors
  ///
  /// [`TrackerError::UnknownTrackingId`] if the tree is already resolved;
  /// no second callback fires.
  pub fn fail(&self, id: TrackingId) -> Result<Completion, TrackerError> {
    let Some((_, mut record)) = self.records.remove(&id) else {
      return Err(unknown(id, "fail"));
    };
    record.failed = true;
    self.stats.record_failed();
    let completion = Completion::Failed(id);
    debug!(tracking_id = %id, pending = record.pending, "tree failed");
    notify(&record, completion);
    Ok(completion)
  }

  /// Drops the tree `id` without resolving it: no callback fires and no
  /// counter moves. Later acks for its copies are unknown-id soft errors.
  ///
  /// Returns whether the tree was still tracked.
  pub fn discard(&self, id: TrackingId) -> bool {
    let removed = self.records.remove(&id).is_some();
    if removed {
      debug!(tracking_id = %id, "tree discarded");
    }
    removed
  }

  /// Fails every tree registered more than `timeout` ago.
  ///
  /// Returns the ids that expired.
  pub fn expire(&self, timeout: Duration) -> Vec<TrackingId> {
    let now = Instant::now();
    let stale: Vec<TrackingId> = self
      .records
      .iter()
      .filter(|r| now.duration_since(r.created_at) >= timeout)
      .map(|r| *r.key())
      .collect();

    let mut expired = Vec::with_capacity(stale.len());
    for id in stale {
      // Re-checked under the entry lock; the tree may have resolved meanwhile.
      if let Some((_, mut record)) = self
        .records
        .remove_if(&id, |_, r| now.duration_since(r.created_at) >= timeout)
      {
        record.failed = true;
        self.stats.record_timed_out();
        warn!(tracking_id = %id, pending = record.pending, "tree timed out");
        notify(&record, Completion::TimedOut(id));
        expired.push(id);
      }
    }
    expired
  }
}

fn unknown(id: TrackingId, op: &str) -> TrackerError {
  debug!(tracking_id = %id, op, "ignoring unknown tracking id");
  TrackerError::UnknownTrackingId(id)
}

fn notify(record: &DeliveryRecord, completion: Completion) {
  if record.origin.send(completion).is_err() {
    debug!(
      tracking_id = %record.tracking_id,
      "origin task is gone; dropping resolution"
    );
  }
}
