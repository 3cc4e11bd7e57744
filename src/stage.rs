//! # Stage Interfaces
//!
//! The traits user code implements. A [`Source`] originates records; a
//! [`Processor`] consumes them and may emit derived records, ack, or fail.
//!
//! Every task owns its stage instance exclusively: the scheduler creates one
//! instance per task through the stage's factory, and calls its methods only
//! from that task's execution unit. Per-task accumulators (a running sum, a
//! counter) are therefore plain struct fields.
//!
//! ## Lifecycle
//!
//! 1. `open` / `prepare` once, before the task starts, with a [`TaskContext`].
//! 2. `produce` repeatedly (sources) or `process` once per input (processors).
//! 3. `on_complete` / `on_failed` whenever a tracked tree resolves (sources).
//! 4. `close` once at shutdown.
//!
//! ## Failures
//!
//! Returning `Err` from `process`, or panicking inside it, fails the input's
//! record tree; the task keeps running. Errors and panics in `produce` are
//! logged and the source keeps producing.

use crate::error::StageError;
use crate::record::{Record, TrackingId};
use crate::topology::TopologyDefinition;
use std::sync::Arc;

pub use crate::collector::{ProcessorOutput, SourceOutput};

/// Read-only view of the running topology handed to each task at start.
#[derive(Clone, Debug)]
pub struct TaskContext {
  topology_name: Arc<str>,
  stage: Arc<str>,
  task_index: usize,
  definition: Arc<TopologyDefinition>,
}

impl TaskContext {
  pub(crate) fn new(
    topology_name: Arc<str>,
    stage: Arc<str>,
    task_index: usize,
    definition: Arc<TopologyDefinition>,
  ) -> Self {
    Self {
      topology_name,
      stage,
      task_index,
      definition,
    }
  }

  /// Name of the running topology.
  #[must_use]
  pub fn topology_name(&self) -> &str {
    &self.topology_name
  }

  /// Stage this task belongs to.
  #[must_use]
  pub fn stage_name(&self) -> &str {
    &self.stage
  }

  /// Index of this task within its stage.
  #[must_use]
  pub fn task_index(&self) -> usize {
    self.task_index
  }

  /// Task indices of any stage, e.g. to address direct emissions.
  #[must_use]
  pub fn tasks_of(&self, stage: &str) -> Option<Vec<usize>> {
    self.definition.tasks_of(stage)
  }

  /// The topology structure.
  #[must_use]
  pub fn definition(&self) -> &TopologyDefinition {
    &self.definition
  }
}

/// A stage that originates records.
pub trait Source: Send + 'static {
  /// Called once before the first `produce`.
  ///
  /// # Errors
  ///
  /// An error aborts topology submission.
  fn open(&mut self, _ctx: &TaskContext) -> Result<(), StageError> {
    Ok(())
  }

  /// Emits zero or more records through `out`.
  ///
  /// Called repeatedly, at most once per configured emit interval, until the
  /// topology stops.
  ///
  /// # Errors
  ///
  /// Errors are logged; the source keeps running.
  fn produce(&mut self, out: &mut SourceOutput<'_>) -> Result<(), StageError>;

  /// Every record derived from the emission tracked as `id` was acked.
  fn on_complete(&mut self, _id: TrackingId) {}

  /// Some record derived from the emission tracked as `id` failed or timed out.
  ///
  /// Re-emitting the original data is up to the implementation.
  fn on_failed(&mut self, _id: TrackingId) {}

  /// Called once at shutdown.
  fn close(&mut self) {}
}

/// A stage that consumes records.
pub trait Processor: Send + 'static {
  /// Called once before the first `process`.
  ///
  /// # Errors
  ///
  /// An error aborts topology submission.
  fn prepare(&mut self, _ctx: &TaskContext) -> Result<(), StageError> {
    Ok(())
  }

  /// Handles one input record.
  ///
  /// Use `out` to emit derived records (anchored to `input`) and to ack or
  /// fail `input`. A tracked input that is never acked or failed keeps its
  /// tree pending.
  ///
  /// # Errors
  ///
  /// An error fails the input's tree.
  fn process(&mut self, input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError>;

  /// Called once at shutdown.
  fn close(&mut self) {}
}
