//! # Router
//!
//! Maps an emission `(emitting stage, destination stage, record)` to the
//! concrete destination task indices chosen by the link's [`Grouping`], and
//! enqueues records on those tasks' inboxes.
//!
//! ## Grouping Strategies
//!
//! - **Shuffle**: exactly one task, round-robin per emitting task. Each
//!   emitting task starts at a random offset so sibling emitters do not pile
//!   onto task 0; over N emissions the per-task counts differ by at most one.
//! - **Direct**: the emitter names the task index; an index outside the
//!   destination's task set is [`RouteError::InvalidTaskIndex`].
//! - **Broadcast**: every task of the destination stage.
//! - **Fields**: hash of the grouping key values, modulo the task count.
//! - **Global**: always task 0.
//!
//! Selection ([`Router::select`]) is separate from delivery
//! ([`Router::deliver`]) so callers can resolve every destination of an
//! emission, register it with the acker, and only then dispatch.
//!
//! Routing never mutates records or tracker state.

use crate::error::RouteError;
use crate::record::Record;
use crate::topology::{Grouping, StageKind, TopologyDefinition};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// Sending half of a task inbox.
pub type Inbox = mpsc::UnboundedSender<Record>;

/// Receiving half of a task inbox.
pub type InboxReceiver = mpsc::UnboundedReceiver<Record>;

/// Which task(s) of the destination stage an emission asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
  /// Let the link's grouping decide.
  Grouped,
  /// Direct emission to one task index.
  Task(usize),
}

/// Number of records queued or being processed anywhere in the topology.
///
/// Incremented on enqueue, decremented once the receiving task has finished
/// processing the record (after any records it emitted were enqueued), so a
/// zero reading means the topology is quiescent.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
  count: AtomicUsize,
  idle: Notify,
}

impl InFlight {
  pub(crate) fn begin(&self) {
    self.count.fetch_add(1, Ordering::AcqRel);
  }

  pub(crate) fn end(&self) {
    if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.idle.notify_waiters();
    }
  }

  pub(crate) fn current(&self) -> usize {
    self.count.load(Ordering::Acquire)
  }

  /// Resolves once the count reaches zero.
  pub(crate) async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      if self.current() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// Round-robin positions of one emitting task, per destination stage.
#[derive(Debug, Default)]
pub struct ShuffleCursor {
  next: HashMap<String, usize>,
}

impl ShuffleCursor {
  /// Creates an empty cursor.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Picks the next of `tasks` destination tasks of `stage`.
  pub fn next(&mut self, stage: &str, tasks: usize) -> usize {
    let slot = self
      .next
      .entry(stage.to_string())
      .or_insert_with(|| rand::thread_rng().gen_range(0..tasks.max(1)));
    let chosen = *slot % tasks.max(1);
    *slot = (chosen + 1) % tasks.max(1);
    chosen
  }
}

#[derive(Debug)]
struct LinkRoute {
  to: String,
  grouping: Grouping,
  key_indexes: Vec<usize>,
}

/// Routing table of one running topology.
#[derive(Debug)]
pub struct Router {
  inboxes: HashMap<String, Vec<Inbox>>,
  links: HashMap<String, Vec<LinkRoute>>,
  parallelism: HashMap<String, usize>,
  in_flight: Arc<InFlight>,
}

impl Router {
  /// Builds the routing table and one inbox per processor task.
  ///
  /// Returns the router and, per processor stage, the receivers indexed by
  /// task index.
  #[must_use]
  pub fn with_inboxes(
    definition: &TopologyDefinition,
  ) -> (Self, HashMap<String, Vec<InboxReceiver>>) {
    let mut inboxes = HashMap::new();
    let mut receivers = HashMap::new();
    let mut parallelism = HashMap::new();

    for stage in definition.stages() {
      parallelism.insert(stage.name.clone(), stage.parallelism);
      if stage.kind == StageKind::Processor {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..stage.parallelism)
          .map(|_| mpsc::unbounded_channel())
          .unzip();
        inboxes.insert(stage.name.clone(), txs);
        receivers.insert(stage.name.clone(), rxs);
      }
    }

    let mut links: HashMap<String, Vec<LinkRoute>> = HashMap::new();
    for link in definition.links() {
      let key_indexes = match (&link.grouping, definition.stage(&link.from)) {
        (Grouping::Fields(keys), Some(from)) => keys
          .iter()
          .filter_map(|k| from.output_fields.index_of(k))
          .collect(),
        _ => Vec::new(),
      };
      links.entry(link.from.clone()).or_default().push(LinkRoute {
        to: link.to.clone(),
        grouping: link.grouping.clone(),
        key_indexes,
      });
    }

    let router = Self {
      inboxes,
      links,
      parallelism,
      in_flight: Arc::new(InFlight::default()),
    };
    (router, receivers)
  }

  pub(crate) fn in_flight(&self) -> &Arc<InFlight> {
    &self.in_flight
  }

  /// Stages `from` emits to, in link declaration order.
  pub fn destinations<'a>(&'a self, from: &str) -> impl Iterator<Item = &'a str> + use<'a> {
    self
      .links
      .get(from)
      .into_iter()
      .flatten()
      .map(|l| l.to.as_str())
  }

  /// Resolves the destination task indices for one emission.
  ///
  /// # Errors
  ///
  /// [`RouteError::UnknownStage`], [`RouteError::NotLinked`],
  /// [`RouteError::InvalidTaskIndex`], [`RouteError::DirectEmitRequired`] or
  /// [`RouteError::NotDirect`]. Nothing is delivered in any of these cases.
  pub fn select(
    &self,
    from: &str,
    to: &str,
    record: &Record,
    target: Target,
    cursor: &mut ShuffleCursor,
  ) -> Result<Vec<usize>, RouteError> {
    let tasks = *self
      .parallelism
      .get(to)
      .ok_or_else(|| RouteError::UnknownStage(to.to_string()))?;
    let link = self
      .links
      .get(from)
      .and_then(|routes| routes.iter().find(|l| l.to == to))
      .ok_or_else(|| RouteError::NotLinked {
        from: from.to_string(),
        to: to.to_string(),
      })?;

    let chosen = match (&link.grouping, target) {
      (Grouping::Direct, Target::Task(index)) if index < tasks => vec![index],
      (Grouping::Direct, Target::Task(index)) => {
        return Err(RouteError::InvalidTaskIndex {
          stage: to.to_string(),
          index,
          parallelism: tasks,
        })
      }
      (Grouping::Direct, Target::Grouped) => {
        return Err(RouteError::DirectEmitRequired {
          from: from.to_string(),
          to: to.to_string(),
        })
      }
      (_, Target::Task(_)) => {
        return Err(RouteError::NotDirect {
          from: from.to_string(),
          to: to.to_string(),
        })
      }
      (Grouping::Shuffle, Target::Grouped) => vec![cursor.next(to, tasks)],
      (Grouping::Broadcast, Target::Grouped) => (0..tasks).collect(),
      (Grouping::Fields(_), Target::Grouped) => {
        vec![key_hash(record, &link.key_indexes) % tasks]
      }
      (Grouping::Global, Target::Grouped) => vec![0],
    };
    trace!(from = %from, to = %to, tasks = ?chosen, "Router::select()");
    Ok(chosen)
  }

  /// Enqueues a record on one task's inbox.
  ///
  /// # Errors
  ///
  /// [`RouteError::UnknownStage`] / [`RouteError::InvalidTaskIndex`] for a bad
  /// address, [`RouteError::Closed`] if the task has shut down.
  pub fn deliver(&self, to: &str, index: usize, record: Record) -> Result<(), RouteError> {
    let inboxes = self
      .inboxes
      .get(to)
      .ok_or_else(|| RouteError::UnknownStage(to.to_string()))?;
    let inbox = inboxes.get(index).ok_or_else(|| RouteError::InvalidTaskIndex {
      stage: to.to_string(),
      index,
      parallelism: inboxes.len(),
    })?;
    self.in_flight.begin();
    if inbox.send(record).is_err() {
      self.in_flight.end();
      return Err(RouteError::Closed {
        stage: to.to_string(),
        index,
      });
    }
    Ok(())
  }
}

fn key_hash(record: &Record, key_indexes: &[usize]) -> usize {
  let mut hasher = DefaultHasher::new();
  for &i in key_indexes {
    record.value(i).hash(&mut hasher);
  }
  hasher.finish() as usize
}
