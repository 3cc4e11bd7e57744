//! # Error Types
//!
//! Errors raised while building a topology, routing records, reading record
//! fields, tracking deliveries, and running stage code.
//!
//! ## Overview
//!
//! - **TopologyError**: the static definition is malformed (raised by
//!   [`TopologyBuilder::build`](crate::topology::TopologyBuilder::build)).
//! - **RouteError**: an emission could not be routed. Raised synchronously to
//!   the emitting stage; the emission is dropped and never retried.
//! - **RecordError**: a field lookup or a value list did not match the
//!   declared fields.
//! - **TrackerError**: soft errors from the acker. These are logged and
//!   ignored by the engine and only returned for inspection.
//! - **StageError**: what user stage code returns from `produce`/`process`.
//!   A processor returning it fails the input's record tree.

use crate::record::TrackingId;
use std::error::Error;

/// Errors raised while validating a topology definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
  /// Two stages were declared with the same name.
  #[error("stage '{0}' is declared more than once")]
  DuplicateStage(String),

  /// A stage was declared with a parallelism of zero.
  #[error("stage '{0}' must have a parallelism of at least 1")]
  ZeroParallelism(String),

  /// A link references a stage that was never declared.
  #[error("link references unknown stage '{0}'")]
  UnknownStage(String),

  /// A link targets a source; sources have no inputs.
  #[error("stage '{0}' is a source and cannot subscribe to '{1}'")]
  SourceSubscription(String, String),

  /// The same upstream/downstream pair was linked twice.
  #[error("stage '{to}' subscribes to '{from}' more than once")]
  DuplicateLink {
    /// Upstream stage.
    from: String,
    /// Downstream stage.
    to: String,
  },

  /// A fields grouping names a field the upstream stage does not declare.
  #[error("fields grouping on '{field}' but stage '{stage}' does not declare it")]
  UndeclaredGroupingField {
    /// Upstream stage.
    stage: String,
    /// The missing field name.
    field: String,
  },

  /// A stage declared the same output field name twice.
  #[error("stage '{stage}' declares output field '{field}' more than once")]
  DuplicateField {
    /// The declaring stage.
    stage: String,
    /// The repeated field name.
    field: String,
  },

  /// A topology without any source cannot produce records.
  #[error("topology declares no source stage")]
  NoSource,

  /// A stage's `open` / `prepare` hook failed during submission.
  #[error("stage '{stage}' task {task} failed to start: {message}")]
  Prepare {
    /// The failing stage.
    stage: String,
    /// The failing task index.
    task: usize,
    /// The stage's error message.
    message: String,
  },
}

/// Errors raised while routing an emission to destination tasks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
  /// The destination stage does not exist.
  #[error("unknown destination stage '{0}'")]
  UnknownStage(String),

  /// The emitting stage has no link to the destination stage.
  #[error("stage '{from}' is not linked to '{to}'")]
  NotLinked {
    /// Emitting stage.
    from: String,
    /// Destination stage.
    to: String,
  },

  /// A direct emission named a task index outside the destination's task set.
  #[error("task index {index} does not belong to stage '{stage}' ({parallelism} tasks)")]
  InvalidTaskIndex {
    /// Destination stage.
    stage: String,
    /// Requested index.
    index: usize,
    /// Number of tasks the destination stage has.
    parallelism: usize,
  },

  /// A plain emission was sent over a direct-grouped link.
  #[error("link '{from}' -> '{to}' uses direct grouping; emit_direct is required")]
  DirectEmitRequired {
    /// Emitting stage.
    from: String,
    /// Destination stage.
    to: String,
  },

  /// A direct emission was sent over a link that is not direct-grouped.
  #[error("link '{from}' -> '{to}' is not direct-grouped")]
  NotDirect {
    /// Emitting stage.
    from: String,
    /// Destination stage.
    to: String,
  },

  /// The emitted values do not fit the emitting stage's declared fields.
  #[error(transparent)]
  Record(#[from] RecordError),

  /// The destination task is no longer accepting records.
  #[error("task {index} of stage '{stage}' has shut down")]
  Closed {
    /// Destination stage.
    stage: String,
    /// Destination task index.
    index: usize,
  },

  /// The anchoring input was already acked or failed, so its tree can no
  /// longer grow.
  #[error("input of tree {0} is already resolved; derived records cannot join it")]
  InputResolved(TrackingId),

  /// The emission could not be registered for tracking.
  #[error(transparent)]
  Tracker(#[from] TrackerError),
}

/// Errors raised by record construction and field access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
  /// The number of values differs from the number of declared fields.
  #[error("expected {expected} values for fields {fields:?}, got {actual}")]
  Arity {
    /// Declared field names.
    fields: Vec<String>,
    /// Number of declared fields.
    expected: usize,
    /// Number of values supplied.
    actual: usize,
  },

  /// The record has no field with this name.
  #[error("record has no field '{0}'")]
  MissingField(String),

  /// The field exists but holds a different type.
  #[error("field '{field}' holds a {actual}, not a {expected}")]
  TypeMismatch {
    /// Field name.
    field: String,
    /// Requested type.
    expected: &'static str,
    /// Stored type.
    actual: &'static str,
  },
}

/// Soft errors reported by the acker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
  /// The tracking id was never registered or its tree is already resolved.
  #[error("unknown or already resolved tracking id {0}")]
  UnknownTrackingId(TrackingId),

  /// A root was registered twice with the same tracking id.
  #[error("tracking id {0} is already registered")]
  DuplicateRoot(TrackingId),
}

/// Error returned by user stage code.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
  /// A record field could not be read.
  #[error(transparent)]
  Record(#[from] RecordError),

  /// An emission could not be routed.
  #[error(transparent)]
  Route(#[from] RouteError),

  /// Free-form failure message.
  #[error("{0}")]
  Message(String),

  /// Any other error raised by stage code.
  #[error(transparent)]
  Other(Box<dyn Error + Send + Sync>),
}

impl StageError {
  /// Creates a free-form stage error.
  pub fn msg(message: impl Into<String>) -> Self {
    StageError::Message(message.into())
  }

  /// Wraps an arbitrary error raised by stage code.
  pub fn other<E>(error: E) -> Self
  where
    E: Error + Send + Sync + 'static,
  {
    StageError::Other(Box::new(error))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_task_index_message() {
    let err = RouteError::InvalidTaskIndex {
      stage: "SumBolt".to_string(),
      index: 7,
      parallelism: 3,
    };
    assert_eq!(
      err.to_string(),
      "task index 7 does not belong to stage 'SumBolt' (3 tasks)"
    );
  }

  #[test]
  fn test_stage_error_from_record_error() {
    let err: StageError = RecordError::MissingField("num".to_string()).into();
    assert!(matches!(err, StageError::Record(RecordError::MissingField(_))));
    assert_eq!(err.to_string(), "record has no field 'num'");
  }

  #[test]
  fn test_stage_error_wraps_io_error() {
    let err = StageError::other(std::io::Error::new(
      std::io::ErrorKind::Other,
      "disk unplugged",
    ));
    assert_eq!(err.to_string(), "disk unplugged");
  }
}
