//! # Topoflow
//!
//! A local, in-process streaming dataflow engine.
//!
//! A topology is a directed graph of named stages. **Sources** produce root
//! records; **processors** consume records, may emit derived records, and
//! acknowledge or fail their inputs. Each stage runs as N parallel tasks, and
//! every link between stages carries a grouping that decides which task of
//! the downstream stage receives each record.
//!
//! ## Key Features
//!
//! - **Groupings**: shuffle, direct, broadcast, fields and global routing
//! - **At-least-once tracking**: every root emission is tracked through its
//!   whole derived tree; the originating source learns whether it completed,
//!   failed or timed out
//! - **Isolation**: a failing or panicking stage fails the tree of the record
//!   it was processing; the task keeps running
//! - **Cooperative shutdown**: sources stop, queues drain, tasks close
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use topoflow::stage::{Processor, ProcessorOutput, Source, SourceOutput};
//! use topoflow::{values, LocalCluster, Record, StageError, TopologyBuilder, TopologyConfig};
//!
//! struct Counter(i64);
//!
//! impl Source for Counter {
//!   fn produce(&mut self, out: &mut SourceOutput<'_>) -> Result<(), StageError> {
//!     self.0 += 1;
//!     out.emit(values![self.0])?;
//!     Ok(())
//!   }
//! }
//!
//! struct Print;
//!
//! impl Processor for Print {
//!   fn process(&mut self, input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
//!     println!("{}", input.get_int("num")?);
//!     out.ack();
//!     Ok(())
//!   }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = TopologyBuilder::new();
//! builder.set_source("numbers", || Counter(0), 1).output_fields(["num"]);
//! builder.set_processor("print", || Print, 2).shuffle_grouping("numbers");
//!
//! let running = LocalCluster::submit(builder.build()?, TopologyConfig::new("demo")).await?;
//! let report = running.shutdown().await;
//! assert!(report.drained);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

/// Delivery tracking of root emissions and their derived trees.
pub mod acker;
mod collector;
/// Topology runtime settings.
pub mod config;
/// Error types.
pub mod error;
/// Records, field schemas and tracking identifiers.
pub mod record;
/// Grouping-based task selection and inbox delivery.
pub mod router;
/// Task loops, submission and shutdown.
pub mod scheduler;
/// The traits implemented by user stages.
pub mod stage;
/// Runtime counters.
pub mod stats;
/// Topology definition and builder.
pub mod topology;

#[cfg(test)]
mod router_test;
#[cfg(test)]
mod scheduler_test;

pub use acker::{Acker, Completion};
pub use config::TopologyConfig;
pub use error::{RecordError, RouteError, StageError, TopologyError, TrackerError};
pub use record::{Anchor, Fields, Record, TrackingId, Value, Values};
pub use scheduler::{LocalCluster, RunningTopology, ShutdownReport};
pub use stage::{Processor, ProcessorOutput, Source, SourceOutput, TaskContext};
pub use stats::StatsSnapshot;
pub use topology::{Grouping, Topology, TopologyBuilder, TopologyDefinition};
