//! # Output Collectors
//!
//! The handles stage code uses to emit records and to ack or fail inputs.
//!
//! Every emission is planned in full before anything is dispatched: all
//! destination tasks are resolved through the [`Router`], the deliveries are
//! registered with the [`Acker`], and only then are the copies enqueued. A
//! routing error therefore drops the whole emission and nobody receives it,
//! and an early ack can never race ahead of the spawn registration.

use crate::acker::{Acker, CompletionSender};
use crate::error::RouteError;
use crate::record::{Anchor, Fields, Record, TrackingId, TrackingIdGenerator, Values};
use crate::router::{Router, ShuffleCursor, Target};
use crate::stats::TopologyStats;
use std::sync::Arc;
use tracing::{debug, trace};

/// Everything a task needs to emit: shared routing/tracking state plus its
/// own shuffle cursor.
pub(crate) struct TaskRuntime {
  pub(crate) stage: Arc<str>,
  pub(crate) task_index: usize,
  pub(crate) fields: Arc<Fields>,
  pub(crate) router: Arc<Router>,
  pub(crate) acker: Arc<Acker>,
  pub(crate) ids: Arc<TrackingIdGenerator>,
  pub(crate) stats: Arc<TopologyStats>,
  pub(crate) reliable: bool,
  pub(crate) cursor: ShuffleCursor,
}

impl TaskRuntime {
  fn build_record(&self, values: Values) -> Result<Record, RouteError> {
    let record = Record::from_shared(Arc::clone(&self.fields), values)?;
    Ok(record.with_origin(Arc::clone(&self.stage), self.task_index))
  }

  /// Resolves every `(stage, task)` an emission reaches.
  fn plan(
    &mut self,
    to: Option<&str>,
    target: Target,
    record: &Record,
  ) -> Result<Vec<(String, usize)>, RouteError> {
    let stages: Vec<String> = match to {
      Some(stage) => vec![stage.to_string()],
      None => self
        .router
        .destinations(&self.stage)
        .map(str::to_string)
        .collect(),
    };
    let mut plan = Vec::new();
    for stage in stages {
      let tasks = self
        .router
        .select(&self.stage, &stage, record, target, &mut self.cursor)?;
      plan.extend(tasks.into_iter().map(|t| (stage.clone(), t)));
    }
    Ok(plan)
  }

  /// Enqueues the planned copies; the i-th copy carries `anchors[i]`.
  fn dispatch(
    &self,
    record: &Record,
    plan: Vec<(String, usize)>,
    anchors: &[Option<Anchor>],
  ) -> Result<(), RouteError> {
    for ((stage, task), anchor) in plan.into_iter().zip(anchors) {
      trace!(from = %self.stage, to = %stage, task, "dispatch");
      self.router.deliver(&stage, task, record.with_anchor(*anchor))?;
    }
    Ok(())
  }

  fn emit_root(
    &mut self,
    to: Option<&str>,
    target: Target,
    values: Values,
    origin: &CompletionSender,
  ) -> Result<Option<TrackingId>, RouteError> {
    let record = self.build_record(values)?;
    let plan = self.plan(to, target, &record)?;

    if !self.reliable {
      let anchors = vec![None; plan.len()];
      self.dispatch(&record, plan, &anchors)?;
      self.stats.record_emitted();
      return Ok(None);
    }

    let id = self.ids.next_id();
    let anchors: Vec<Anchor> = if plan.is_empty() {
      vec![Anchor::fresh(id)]
    } else {
      plan.iter().map(|_| Anchor::fresh(id)).collect()
    };
    let edges: Vec<u64> = anchors[1..].iter().map(Anchor::edge).collect();
    self.acker.register_root(anchors[0], origin.clone())?;
    if let Err(e) = self.acker.register_spawn(id, &edges) {
      self.acker.discard(id);
      return Err(e.into());
    }

    if plan.is_empty() {
      // Nobody subscribes: the tree is complete as soon as it exists.
      self.acker.ack(anchors[0])?;
      self.stats.record_emitted();
      return Ok(Some(id));
    }

    let anchors: Vec<Option<Anchor>> = anchors.into_iter().map(Some).collect();
    if let Err(e) = self.dispatch(&record, plan, &anchors) {
      // The caller never learns this id, so the tree resolves silently.
      self.acker.discard(id);
      return Err(e);
    }
    self.stats.record_emitted();
    Ok(Some(id))
  }

  fn emit_anchored(
    &mut self,
    parent: Option<Anchor>,
    to: Option<&str>,
    target: Target,
    values: Values,
  ) -> Result<(), RouteError> {
    let record = self.build_record(values)?;
    let plan = self.plan(to, target, &record)?;

    let anchors: Vec<Option<Anchor>> = match parent {
      Some(parent) if self.reliable => {
        let id = parent.tracking_id();
        let anchors: Vec<Anchor> = plan.iter().map(|_| Anchor::fresh(id)).collect();
        let edges: Vec<u64> = anchors.iter().map(Anchor::edge).collect();
        self
          .acker
          .register_spawn(id, &edges)
          .map_err(|_| RouteError::InputResolved(id))?;
        anchors.into_iter().map(Some).collect()
      }
      _ => vec![None; plan.len()],
    };

    let result = self.dispatch(&record, plan, &anchors);
    if let (Err(_), Some(parent)) = (&result, parent) {
      let _ = self.acker.fail(parent.tracking_id());
    }
    result
  }
}

/// Emission handle passed to [`Source::produce`](crate::stage::Source::produce).
///
/// Every emission starts a new tracked tree (when the topology is reliable).
pub struct SourceOutput<'a> {
  runtime: &'a mut TaskRuntime,
  origin: &'a CompletionSender,
}

impl<'a> SourceOutput<'a> {
  pub(crate) fn new(runtime: &'a mut TaskRuntime, origin: &'a CompletionSender) -> Self {
    Self { runtime, origin }
  }

  /// Emits to every subscribed stage using each link's grouping.
  ///
  /// Returns the tracking id assigned to the emission, or `None` when the
  /// topology runs untracked.
  ///
  /// # Errors
  ///
  /// A [`RouteError`]; nothing is delivered in that case.
  pub fn emit(&mut self, values: Values) -> Result<Option<TrackingId>, RouteError> {
    self.runtime.emit_root(None, Target::Grouped, values, self.origin)
  }

  /// Emits to one subscribed stage.
  ///
  /// # Errors
  ///
  /// A [`RouteError`]; nothing is delivered in that case.
  pub fn emit_to(&mut self, stage: &str, values: Values) -> Result<Option<TrackingId>, RouteError> {
    self
      .runtime
      .emit_root(Some(stage), Target::Grouped, values, self.origin)
  }

  /// Emits to one task of a direct-grouped stage.
  ///
  /// # Errors
  ///
  /// [`RouteError::InvalidTaskIndex`] if `task` is not one of the stage's
  /// tasks; nothing is delivered in that case.
  pub fn emit_direct(
    &mut self,
    stage: &str,
    task: usize,
    values: Values,
  ) -> Result<Option<TrackingId>, RouteError> {
    self
      .runtime
      .emit_root(Some(stage), Target::Task(task), values, self.origin)
  }

  /// Name of the emitting stage.
  #[must_use]
  pub fn stage_name(&self) -> &str {
    &self.runtime.stage
  }

  /// Index of the emitting task.
  #[must_use]
  pub fn task_index(&self) -> usize {
    self.runtime.task_index
  }
}

/// Emission and acknowledgment handle passed to
/// [`Processor::process`](crate::stage::Processor::process).
///
/// Emissions are anchored to the current input, so they join its tree.
/// `ack` and `fail` act on the current input and take effect at most once.
/// Once a tracked input is resolved, further emissions are rejected with
/// [`RouteError::InputResolved`].
pub struct ProcessorOutput<'a> {
  runtime: &'a mut TaskRuntime,
  anchor: Option<Anchor>,
  resolved: bool,
}

impl<'a> ProcessorOutput<'a> {
  pub(crate) fn new(runtime: &'a mut TaskRuntime, input: &Record) -> Self {
    Self {
      runtime,
      anchor: input.anchor(),
      resolved: false,
    }
  }

  /// Emits a derived record to every subscribed stage.
  ///
  /// # Errors
  ///
  /// A [`RouteError`]; nothing is delivered in that case.
  pub fn emit(&mut self, values: Values) -> Result<(), RouteError> {
    self.ensure_open()?;
    self
      .runtime
      .emit_anchored(self.anchor, None, Target::Grouped, values)
  }

  /// Emits a derived record to one subscribed stage.
  ///
  /// # Errors
  ///
  /// A [`RouteError`]; nothing is delivered in that case.
  pub fn emit_to(&mut self, stage: &str, values: Values) -> Result<(), RouteError> {
    self.ensure_open()?;
    self
      .runtime
      .emit_anchored(self.anchor, Some(stage), Target::Grouped, values)
  }

  /// Emits a derived record to one task of a direct-grouped stage.
  ///
  /// # Errors
  ///
  /// [`RouteError::InvalidTaskIndex`] if `task` is not one of the stage's
  /// tasks; nothing is delivered in that case.
  pub fn emit_direct(&mut self, stage: &str, task: usize, values: Values) -> Result<(), RouteError> {
    self.ensure_open()?;
    self
      .runtime
      .emit_anchored(self.anchor, Some(stage), Target::Task(task), values)
  }

  /// Acknowledges the current input.
  pub fn ack(&mut self) {
    if std::mem::replace(&mut self.resolved, true) {
      return;
    }
    if let Some(anchor) = self.anchor {
      let _ = self.runtime.acker.ack(anchor);
    }
  }

  /// Fails the tree of the current input.
  pub fn fail(&mut self) {
    if std::mem::replace(&mut self.resolved, true) {
      return;
    }
    self.fail_tree();
  }

  /// Tracking id of the current input, if tracked.
  #[must_use]
  pub fn tracking_id(&self) -> Option<TrackingId> {
    self.anchor.map(|a| a.tracking_id())
  }

  /// Name of the processing stage.
  #[must_use]
  pub fn stage_name(&self) -> &str {
    &self.runtime.stage
  }

  /// Index of the processing task.
  #[must_use]
  pub fn task_index(&self) -> usize {
    self.runtime.task_index
  }

  /// Tracked inputs accept derived records only until they are acked or failed.
  fn ensure_open(&self) -> Result<(), RouteError> {
    match self.anchor {
      Some(anchor) if self.resolved => Err(RouteError::InputResolved(anchor.tracking_id())),
      _ => Ok(()),
    }
  }

  pub(crate) fn is_resolved(&self) -> bool {
    self.resolved
  }

  /// Fails the input's tree regardless of an earlier ack.
  pub(crate) fn fail_tree(&mut self) {
    self.resolved = true;
    if let Some(anchor) = self.anchor {
      debug!(stage = %self.runtime.stage, tracking_id = %anchor.tracking_id(), "failing tree");
      let _ = self.runtime.acker.fail(anchor.tracking_id());
    }
  }
}
