//! # Topology
//!
//! The static structure of a streaming job: named stages (sources and
//! processors), the fields each stage emits, how many parallel tasks each
//! stage runs, and the grouping strategy on every upstream link.
//!
//! ## Building
//!
//! [`TopologyBuilder`] declares stages with a factory closure (called once per
//! task, so every task owns its own state) and a parallelism hint, then wires
//! each processor to its upstream stages with a grouping. [`TopologyBuilder::build`]
//! validates the whole graph at once.
//!
//! ```rust
//! use topoflow::stage::{Processor, ProcessorOutput, Source, SourceOutput};
//! use topoflow::{Record, StageError, TopologyBuilder};
//! use topoflow::values;
//!
//! #[derive(Default)]
//! struct Numbers(i64);
//!
//! impl Source for Numbers {
//!   fn produce(&mut self, out: &mut SourceOutput<'_>) -> Result<(), StageError> {
//!     self.0 += 1;
//!     out.emit(values![self.0])?;
//!     Ok(())
//!   }
//! }
//!
//! #[derive(Default)]
//! struct Sum(i64);
//!
//! impl Processor for Sum {
//!   fn process(&mut self, input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
//!     self.0 += input.get_int("num")?;
//!     out.ack();
//!     Ok(())
//!   }
//! }
//!
//! let mut builder = TopologyBuilder::new();
//! builder
//!   .set_source("DataSourceSpout", Numbers::default, 2)
//!   .output_fields(["num"]);
//! builder
//!   .set_processor("SumBolt", Sum::default, 2)
//!   .shuffle_grouping("DataSourceSpout");
//! let topology = builder.build().unwrap();
//!
//! assert_eq!(topology.definition().tasks_of("SumBolt"), Some(vec![0, 1]));
//! ```

use crate::error::TopologyError;
use crate::record::Fields;
use crate::stage::{Processor, Source};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Whether a stage originates records or consumes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
  /// Emits root records; has no inputs.
  Source,
  /// Consumes records from upstream stages.
  Processor,
}

/// How records on a link are spread over the destination stage's tasks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
  /// One task per record, load-balanced round-robin per emitting task.
  Shuffle,
  /// The emitting task names the destination task index.
  Direct,
  /// Every task receives a copy.
  Broadcast,
  /// Records with equal values in these fields go to the same task.
  Fields(Vec<String>),
  /// Every record goes to the lowest-indexed task.
  Global,
}

/// Declaration of one logical stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
  /// Unique stage name.
  pub name: String,
  /// Source or processor.
  pub kind: StageKind,
  /// Number of tasks.
  pub parallelism: usize,
  /// Names of the fields this stage emits.
  pub output_fields: Fields,
  /// Processors only: ack each input automatically after a successful `process`.
  pub auto_ack: bool,
}

/// A subscription of `to` to the records emitted by `from`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
  /// Upstream stage.
  pub from: String,
  /// Downstream stage.
  pub to: String,
  /// Grouping applied to records flowing over this link.
  pub grouping: Grouping,
}

/// The validated, immutable structure of a topology.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDefinition {
  stages: Vec<StageSpec>,
  links: Vec<Link>,
}

impl TopologyDefinition {
  /// All stages in declaration order.
  #[must_use]
  pub fn stages(&self) -> &[StageSpec] {
    &self.stages
  }

  /// All links in declaration order.
  #[must_use]
  pub fn links(&self) -> &[Link] {
    &self.links
  }

  /// Looks up a stage by name.
  #[must_use]
  pub fn stage(&self, name: &str) -> Option<&StageSpec> {
    self.stages.iter().find(|s| s.name == name)
  }

  /// Task indices of a stage, in order. `None` for an unknown stage.
  #[must_use]
  pub fn tasks_of(&self, name: &str) -> Option<Vec<usize>> {
    self.stage(name).map(|s| (0..s.parallelism).collect())
  }

  /// Links leaving a stage.
  pub fn links_from<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
    self.links.iter().filter(move |l| l.from == name)
  }

  /// Links entering a stage.
  pub fn links_into<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
    self.links.iter().filter(move |l| l.to == name)
  }

  /// The link between two stages, if any.
  #[must_use]
  pub fn link(&self, from: &str, to: &str) -> Option<&Link> {
    self.links.iter().find(|l| l.from == from && l.to == to)
  }

  /// Renders the definition as pretty-printed JSON.
  ///
  /// # Errors
  ///
  /// Propagates the `serde_json` error (not expected for this type).
  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(self)
  }

  fn validate(&self) -> Result<(), TopologyError> {
    let mut names = HashSet::new();
    for stage in &self.stages {
      if !names.insert(stage.name.as_str()) {
        return Err(TopologyError::DuplicateStage(stage.name.clone()));
      }
      if stage.parallelism == 0 {
        return Err(TopologyError::ZeroParallelism(stage.name.clone()));
      }
      let mut fields = HashSet::new();
      for field in stage.output_fields.iter() {
        if !fields.insert(field) {
          return Err(TopologyError::DuplicateField {
            stage: stage.name.clone(),
            field: field.to_string(),
          });
        }
      }
    }

    if !self.stages.iter().any(|s| s.kind == StageKind::Source) {
      return Err(TopologyError::NoSource);
    }

    let mut pairs = HashSet::new();
    for link in &self.links {
      let from = self
        .stage(&link.from)
        .ok_or_else(|| TopologyError::UnknownStage(link.from.clone()))?;
      let to = self
        .stage(&link.to)
        .ok_or_else(|| TopologyError::UnknownStage(link.to.clone()))?;
      if to.kind == StageKind::Source {
        return Err(TopologyError::SourceSubscription(
          to.name.clone(),
          from.name.clone(),
        ));
      }
      if !pairs.insert((link.from.as_str(), link.to.as_str())) {
        return Err(TopologyError::DuplicateLink {
          from: link.from.clone(),
          to: link.to.clone(),
        });
      }
      if let Grouping::Fields(keys) = &link.grouping {
        if let Some(missing) = keys.iter().find(|k| !from.output_fields.contains(k)) {
          return Err(TopologyError::UndeclaredGroupingField {
            stage: from.name.clone(),
            field: missing.clone(),
          });
        }
      }
    }
    Ok(())
  }
}

/// Creates one source instance per task.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn Source> + Send + Sync>;

/// Creates one processor instance per task.
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

/// Per-stage instance factory.
#[derive(Clone)]
pub(crate) enum StageFactory {
  Source(SourceFactory),
  Processor(ProcessorFactory),
}

/// A validated definition plus the factories that instantiate its tasks.
#[derive(Clone)]
pub struct Topology {
  definition: Arc<TopologyDefinition>,
  factories: HashMap<String, StageFactory>,
}

impl Topology {
  /// The static structure.
  #[must_use]
  pub fn definition(&self) -> &Arc<TopologyDefinition> {
    &self.definition
  }

  pub(crate) fn factory(&self, stage: &str) -> Option<&StageFactory> {
    self.factories.get(stage)
  }
}

impl std::fmt::Debug for Topology {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Topology")
      .field("definition", &self.definition)
      .finish_non_exhaustive()
  }
}

/// Fluent builder for a [`Topology`].
#[derive(Default)]
pub struct TopologyBuilder {
  definition: TopologyDefinition,
  factories: HashMap<String, StageFactory>,
}

impl TopologyBuilder {
  /// Creates an empty builder.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Declares a source stage with `parallelism` tasks.
  pub fn set_source<F, S>(
    &mut self,
    name: impl Into<String>,
    factory: F,
    parallelism: usize,
  ) -> SourceDeclarer<'_>
  where
    F: Fn() -> S + Send + Sync + 'static,
    S: Source,
  {
    let name = name.into();
    let factory: SourceFactory = Arc::new(move || Box::new(factory()) as Box<dyn Source>);
    self
      .factories
      .entry(name.clone())
      .or_insert(StageFactory::Source(factory));
    let index = self.push_stage(name, StageKind::Source, parallelism);
    SourceDeclarer {
      builder: self,
      index,
    }
  }

  /// Declares a processor stage with `parallelism` tasks.
  pub fn set_processor<F, P>(
    &mut self,
    name: impl Into<String>,
    factory: F,
    parallelism: usize,
  ) -> ProcessorDeclarer<'_>
  where
    F: Fn() -> P + Send + Sync + 'static,
    P: Processor,
  {
    let name = name.into();
    let factory: ProcessorFactory = Arc::new(move || Box::new(factory()) as Box<dyn Processor>);
    self
      .factories
      .entry(name.clone())
      .or_insert(StageFactory::Processor(factory));
    let index = self.push_stage(name, StageKind::Processor, parallelism);
    ProcessorDeclarer {
      builder: self,
      index,
    }
  }

  fn push_stage(&mut self, name: String, kind: StageKind, parallelism: usize) -> usize {
    self.definition.stages.push(StageSpec {
      name,
      kind,
      parallelism,
      output_fields: Fields::default(),
      auto_ack: false,
    });
    self.definition.stages.len() - 1
  }

  /// Validates the declarations and produces a runnable topology.
  ///
  /// # Errors
  ///
  /// Any [`TopologyError`] describing the first problem found.
  pub fn build(self) -> Result<Topology, TopologyError> {
    self.definition.validate()?;
    Ok(Topology {
      definition: Arc::new(self.definition),
      factories: self.factories,
    })
  }
}

/// Returned by [`TopologyBuilder::set_source`] to finish the declaration.
pub struct SourceDeclarer<'a> {
  builder: &'a mut TopologyBuilder,
  index: usize,
}

impl SourceDeclarer<'_> {
  /// Declares the names of the fields this source emits.
  pub fn output_fields<I, S>(self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.builder.definition.stages[self.index].output_fields = Fields::new(names);
    self
  }
}

/// Returned by [`TopologyBuilder::set_processor`] to declare subscriptions.
pub struct ProcessorDeclarer<'a> {
  builder: &'a mut TopologyBuilder,
  index: usize,
}

impl ProcessorDeclarer<'_> {
  /// Declares the names of the fields this processor emits.
  pub fn output_fields<I, S>(self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.builder.definition.stages[self.index].output_fields = Fields::new(names);
    self
  }

  /// Acks every input after `process` returns `Ok` without an explicit ack or fail.
  pub fn auto_ack(self) -> Self {
    self.builder.definition.stages[self.index].auto_ack = true;
    self
  }

  /// Subscribes to `from` with the given grouping.
  pub fn grouping(self, from: impl Into<String>, grouping: Grouping) -> Self {
    let to = self.builder.definition.stages[self.index].name.clone();
    self.builder.definition.links.push(Link {
      from: from.into(),
      to,
      grouping,
    });
    self
  }

  /// Subscribes to `from`, load-balancing records over this stage's tasks.
  pub fn shuffle_grouping(self, from: impl Into<String>) -> Self {
    self.grouping(from, Grouping::Shuffle)
  }

  /// Subscribes to `from`; the emitter picks the receiving task.
  pub fn direct_grouping(self, from: impl Into<String>) -> Self {
    self.grouping(from, Grouping::Direct)
  }

  /// Subscribes to `from`; every task receives every record.
  pub fn all_grouping(self, from: impl Into<String>) -> Self {
    self.grouping(from, Grouping::Broadcast)
  }

  /// Subscribes to `from`, partitioning by the values of `keys`.
  pub fn fields_grouping<I, S>(self, from: impl Into<String>, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let keys = keys.into_iter().map(Into::into).collect();
    self.grouping(from, Grouping::Fields(keys))
  }

  /// Subscribes to `from`; task 0 receives every record.
  pub fn global_grouping(self, from: impl Into<String>) -> Self {
    self.grouping(from, Grouping::Global)
  }
}
