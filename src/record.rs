//! # Records
//!
//! The unit of data flowing through a topology. A [`Record`] is an immutable
//! tuple of typed [`Value`]s paired with the emitting stage's declared
//! [`Fields`], plus an optional [`Anchor`] that ties it to a tracked record
//! tree.
//!
//! ## Zero-Copy Fan-Out
//!
//! Field names and values are held behind `Arc`, so the copies a broadcast or
//! multi-stage emission produces only bump reference counts. The engine
//! attaches a fresh anchor to each delivered copy; the payload itself is never
//! mutated after construction.
//!
//! ## Example
//!
//! ```rust
//! use topoflow::record::{Fields, Record};
//! use topoflow::values;
//!
//! let fields = Fields::new(["num", "label"]);
//! let record = Record::new(fields, values![7, "seven"]).unwrap();
//!
//! assert_eq!(record.get_int("num").unwrap(), 7);
//! assert_eq!(record.get_str("label").unwrap(), "seven");
//! assert!(record.tracking_id().is_none());
//! ```

use crate::error::RecordError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single field value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum Value {
  /// A signed integer.
  Int(i64),
  /// A UTF-8 string.
  Str(String),
  /// A boolean.
  Bool(bool),
}

impl Value {
  /// Returns the name of the stored type, used in error messages.
  #[must_use]
  pub const fn type_name(&self) -> &'static str {
    match self {
      Value::Int(_) => "integer",
      Value::Str(_) => "string",
      Value::Bool(_) => "boolean",
    }
  }

  /// Returns the integer if this is an [`Value::Int`].
  #[must_use]
  pub const fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(v) => Some(*v),
      _ => None,
    }
  }

  /// Returns the string if this is a [`Value::Str`].
  #[must_use]
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(v) => Some(v),
      _ => None,
    }
  }

  /// Returns the boolean if this is a [`Value::Bool`].
  #[must_use]
  pub const fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(v) => Some(*v),
      _ => None,
    }
  }
}

impl Display for Value {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Value::Int(v) => write!(f, "{}", v),
      Value::Str(v) => write!(f, "{}", v),
      Value::Bool(v) => write!(f, "{}", v),
    }
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Int(v)
  }
}

impl From<i32> for Value {
  fn from(v: i32) -> Self {
    Value::Int(i64::from(v))
  }
}

impl From<u32> for Value {
  fn from(v: u32) -> Self {
    Value::Int(i64::from(v))
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::Str(v)
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::Str(v.to_string())
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Bool(v)
  }
}

/// Ordered set of field names a stage declares for its output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(Vec<String>);

impl Fields {
  /// Creates a field list from names, in order.
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(names.into_iter().map(Into::into).collect())
  }

  /// Position of a field, if declared.
  #[must_use]
  pub fn index_of(&self, name: &str) -> Option<usize> {
    self.0.iter().position(|f| f == name)
  }

  /// Whether a field with this name is declared.
  #[must_use]
  pub fn contains(&self, name: &str) -> bool {
    self.index_of(name).is_some()
  }

  /// Number of declared fields.
  #[must_use]
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// True when no field is declared.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Iterates over the field names in declaration order.
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  /// Field names as a slice.
  #[must_use]
  pub fn names(&self) -> &[String] {
    &self.0
  }
}

/// Positional values a stage emits; paired with the stage's declared fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values(Vec<Value>);

impl Values {
  /// Creates a value list.
  #[must_use]
  pub fn new(values: Vec<Value>) -> Self {
    Self(values)
  }

  /// Number of values.
  #[must_use]
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// True when the list is empty.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Consumes the list and returns the values.
  #[must_use]
  pub fn into_inner(self) -> Vec<Value> {
    self.0
  }
}

impl From<Vec<Value>> for Values {
  fn from(values: Vec<Value>) -> Self {
    Self(values)
  }
}

impl FromIterator<Value> for Values {
  fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// Builds [`Values`] from a list of expressions convertible into [`Value`].
///
/// ```rust
/// use topoflow::values;
///
/// let v = values![1, "two", true];
/// assert_eq!(v.len(), 3);
/// ```
#[macro_export]
macro_rules! values {
  ($($value:expr),* $(,)?) => {
    $crate::record::Values::new(vec![$($crate::record::Value::from($value)),*])
  };
}

/// Identifier linking a root record to every record derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(u64);

impl TrackingId {
  /// Wraps a raw identifier.
  #[must_use]
  pub const fn new(raw: u64) -> Self {
    Self(raw)
  }

  /// The raw identifier.
  #[must_use]
  pub const fn as_u64(self) -> u64 {
    self.0
  }
}

impl Display for TrackingId {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hands out tracking ids unique within one running topology.
///
/// Monotonically increasing and thread-safe.
#[derive(Debug)]
pub struct TrackingIdGenerator {
  counter: AtomicU64,
}

impl TrackingIdGenerator {
  /// Creates a generator whose first id is 1.
  #[must_use]
  pub fn new() -> Self {
    Self::starting_at(1)
  }

  /// Creates a generator whose first id is `start`.
  #[must_use]
  pub fn starting_at(start: u64) -> Self {
    Self {
      counter: AtomicU64::new(start),
    }
  }

  /// Returns the next unused id.
  pub fn next_id(&self) -> TrackingId {
    TrackingId(self.counter.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for TrackingIdGenerator {
  fn default() -> Self {
    Self::new()
  }
}

/// Random, non-zero id for one delivered copy of a tracked record.
///
/// Edge ids feed the acker's XOR checksum: every id is XORed in when the copy
/// is registered and XORed out again when it is acked.
pub(crate) fn new_edge_id() -> u64 {
  loop {
    let edge = rand::random::<u64>();
    if edge != 0 {
      return edge;
    }
  }
}

/// Ties one delivered record copy to its tracked tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Anchor {
  tracking_id: TrackingId,
  edge: u64,
}

impl Anchor {
  /// Creates an anchor for a copy with the given edge id.
  #[must_use]
  pub const fn new(tracking_id: TrackingId, edge: u64) -> Self {
    Self { tracking_id, edge }
  }

  /// Anchor with a freshly drawn edge id.
  pub(crate) fn fresh(tracking_id: TrackingId) -> Self {
    Self::new(tracking_id, new_edge_id())
  }

  /// The tree this copy belongs to.
  #[must_use]
  pub const fn tracking_id(&self) -> TrackingId {
    self.tracking_id
  }

  /// The edge id of this copy.
  #[must_use]
  pub const fn edge(&self) -> u64 {
    self.edge
  }
}

/// Where a record was emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Origin {
  stage: Arc<str>,
  task: usize,
}

/// An immutable tuple of named values.
#[derive(Clone, Debug)]
pub struct Record {
  fields: Arc<Fields>,
  values: Arc<[Value]>,
  origin: Option<Origin>,
  anchor: Option<Anchor>,
}

impl Record {
  /// Pairs values with field names.
  ///
  /// # Errors
  ///
  /// Returns [`RecordError::Arity`] when the counts differ.
  pub fn new(fields: Fields, values: Values) -> Result<Self, RecordError> {
    Self::from_shared(Arc::new(fields), values)
  }

  /// Like [`Record::new`] but reuses an already shared field list.
  ///
  /// # Errors
  ///
  /// Returns [`RecordError::Arity`] when the counts differ.
  pub fn from_shared(fields: Arc<Fields>, values: Values) -> Result<Self, RecordError> {
    if fields.len() != values.len() {
      return Err(RecordError::Arity {
        fields: fields.names().to_vec(),
        expected: fields.len(),
        actual: values.len(),
      });
    }
    Ok(Self {
      fields,
      values: values.into_inner().into(),
      origin: None,
      anchor: None,
    })
  }

  /// Stamps the emitting stage and task.
  pub(crate) fn with_origin(mut self, stage: Arc<str>, task: usize) -> Self {
    self.origin = Some(Origin { stage, task });
    self
  }

  /// A copy of this record bound to another tracked edge.
  pub(crate) fn with_anchor(&self, anchor: Option<Anchor>) -> Self {
    Self {
      fields: Arc::clone(&self.fields),
      values: Arc::clone(&self.values),
      origin: self.origin.clone(),
      anchor,
    }
  }

  /// The declared field names.
  #[must_use]
  pub fn fields(&self) -> &Fields {
    &self.fields
  }

  /// The values, in field order.
  #[must_use]
  pub fn values(&self) -> &[Value] {
    &self.values
  }

  /// Number of fields.
  #[must_use]
  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// True for a record without fields.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Value at a position.
  #[must_use]
  pub fn value(&self, index: usize) -> Option<&Value> {
    self.values.get(index)
  }

  /// Value of a named field.
  #[must_use]
  pub fn get(&self, name: &str) -> Option<&Value> {
    self.fields.index_of(name).and_then(|i| self.values.get(i))
  }

  fn require(&self, name: &str) -> Result<&Value, RecordError> {
    self
      .get(name)
      .ok_or_else(|| RecordError::MissingField(name.to_string()))
  }

  fn mismatch(name: &str, expected: &'static str, actual: &Value) -> RecordError {
    RecordError::TypeMismatch {
      field: name.to_string(),
      expected,
      actual: actual.type_name(),
    }
  }

  /// Integer value of a named field.
  ///
  /// # Errors
  ///
  /// Missing field or a field holding another type.
  pub fn get_int(&self, name: &str) -> Result<i64, RecordError> {
    let value = self.require(name)?;
    value
      .as_int()
      .ok_or_else(|| Self::mismatch(name, "integer", value))
  }

  /// String value of a named field.
  ///
  /// # Errors
  ///
  /// Missing field or a field holding another type.
  pub fn get_str(&self, name: &str) -> Result<&str, RecordError> {
    let value = self.require(name)?;
    value
      .as_str()
      .ok_or_else(|| Self::mismatch(name, "string", value))
  }

  /// Boolean value of a named field.
  ///
  /// # Errors
  ///
  /// Missing field or a field holding another type.
  pub fn get_bool(&self, name: &str) -> Result<bool, RecordError> {
    let value = self.require(name)?;
    value
      .as_bool()
      .ok_or_else(|| Self::mismatch(name, "boolean", value))
  }

  /// Stage that emitted this record, if it came through a topology.
  #[must_use]
  pub fn source_stage(&self) -> Option<&str> {
    self.origin.as_ref().map(|o| &*o.stage)
  }

  /// Task index that emitted this record, if it came through a topology.
  #[must_use]
  pub fn source_task(&self) -> Option<usize> {
    self.origin.as_ref().map(|o| o.task)
  }

  /// Tracking id of the tree this record belongs to, if tracked.
  #[must_use]
  pub fn tracking_id(&self) -> Option<TrackingId> {
    self.anchor.map(|a| a.tracking_id())
  }

  /// The anchor of this copy, if tracked.
  #[must_use]
  pub fn anchor(&self) -> Option<Anchor> {
    self.anchor
  }
}

/// Records are equal when their fields and values are equal; provenance and
/// tracking are ignored.
impl PartialEq for Record {
  fn eq(&self, other: &Self) -> bool {
    self.fields == other.fields && self.values == other.values
  }
}

impl Eq for Record {}
