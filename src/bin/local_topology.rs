//! Runs one of the bundled demo topologies in-process for a fixed duration.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::time::Duration;
use topoflow::{
  values, LocalCluster, Processor, ProcessorOutput, Record, Source, SourceOutput, StageError,
  TaskContext, Topology, TopologyBuilder, TopologyConfig, TrackingId,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Local streaming topology runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  #[command(subcommand)]
  topology: Demo,

  /// How long to run before shutting down, in seconds
  #[arg(long, default_value_t = 10)]
  duration_secs: u64,

  /// Minimum delay between two `produce` calls of a source, in milliseconds
  #[arg(long)]
  emit_interval_ms: Option<u64>,

  /// JSON file with topology settings
  #[arg(long, value_name = "PATH")]
  config: Option<String>,

  /// Log level used when RUST_LOG is unset
  #[arg(long, default_value = "info")]
  log_level: String,
}

#[derive(Subcommand, Debug)]
enum Demo {
  /// Sums increasing integers over parallel shuffle-grouped tasks, untracked
  Sum {
    /// Source tasks
    #[arg(long, default_value_t = 2)]
    sources: usize,
    /// Summing tasks
    #[arg(long, default_value_t = 2)]
    sums: usize,
  },
  /// Acks 1..=10 and fails every other number
  Acker,
  /// Alternates direct emissions between two summing tasks
  Direct,
}

/// Emits 1, 2, 3, ... and logs how each tree resolved.
#[derive(Default)]
struct DataSource {
  number: i64,
}

impl Source for DataSource {
  fn open(&mut self, ctx: &TaskContext) -> Result<(), StageError> {
    info!(stage = ctx.stage_name(), task = ctx.task_index(), "source opened");
    Ok(())
  }

  fn produce(&mut self, out: &mut SourceOutput<'_>) -> Result<(), StageError> {
    self.number += 1;
    let id = out.emit(values![self.number])?;
    info!(task = out.task_index(), num = self.number, tracking_id = ?id, "emitted");
    Ok(())
  }

  fn on_complete(&mut self, id: TrackingId) {
    info!(tracking_id = %id, "ack");
  }

  fn on_failed(&mut self, id: TrackingId) {
    info!(tracking_id = %id, "fail");
  }
}

/// Running sum of the `num` field, per task.
#[derive(Default)]
struct Sum {
  sum: i64,
}

impl Processor for Sum {
  fn prepare(&mut self, ctx: &TaskContext) -> Result<(), StageError> {
    info!(stage = ctx.stage_name(), task = ctx.task_index(), "sum task prepared");
    Ok(())
  }

  fn process(&mut self, input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    let num = input.get_int("num")?;
    self.sum += num;
    info!(task = out.task_index(), num, sum = self.sum, "received");
    out.ack();
    Ok(())
  }
}

/// Acks numbers in 1..=10, fails the rest.
struct RangeCheck;

impl Processor for RangeCheck {
  fn process(&mut self, input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    let num = input.get_int("num")?;
    if num > 0 && num < 11 {
      info!(num, "in range");
      out.ack();
    } else {
      info!(num, "out of range");
      out.fail();
    }
    Ok(())
  }
}

/// Sends even-indexed numbers to the first `SumBolt` task, odd ones to the second.
#[derive(Default)]
struct DirectSource {
  number: i64,
  tasks: Vec<usize>,
}

impl Source for DirectSource {
  fn open(&mut self, ctx: &TaskContext) -> Result<(), StageError> {
    self.tasks = ctx
      .tasks_of("SumBolt")
      .ok_or_else(|| StageError::msg("SumBolt is not part of the topology"))?;
    info!(tasks = ?self.tasks, "SumBolt tasks");
    Ok(())
  }

  fn produce(&mut self, out: &mut SourceOutput<'_>) -> Result<(), StageError> {
    let task = match self.tasks.as_slice() {
      [only] => *only,
      [first, second, ..] => {
        if self.number % 2 == 0 {
          *first
        } else {
          *second
        }
      }
      [] => return Ok(()),
    };
    self.number += 1;
    out.emit_direct("SumBolt", task, values![self.number])?;
    info!(num = self.number, task, "emitted direct");
    Ok(())
  }
}

fn build(demo: &Demo) -> Result<(Topology, &'static str), Box<dyn Error>> {
  let mut builder = TopologyBuilder::new();
  let name = match demo {
    Demo::Sum { sources, sums } => {
      builder
        .set_source("DataSourceSpout", DataSource::default, *sources)
        .output_fields(["num"]);
      builder
        .set_processor("SumBolt", Sum::default, *sums)
        .shuffle_grouping("DataSourceSpout");
      "cluster-sum"
    }
    Demo::Acker => {
      builder
        .set_source("DataSourceSpout", DataSource::default, 1)
        .output_fields(["num"]);
      builder
        .set_processor("SumBolt", || RangeCheck, 1)
        .shuffle_grouping("DataSourceSpout");
      "local-acker"
    }
    Demo::Direct => {
      builder
        .set_source("DataSourceSpout", DirectSource::default, 1)
        .output_fields(["num"]);
      builder
        .set_processor("SumBolt", Sum::default, 3)
        .direct_grouping("DataSourceSpout");
      "local-direct-grouping"
    }
  };
  Ok((builder.build()?, name))
}

/// Settings used when no config file is given.
fn demo_config(demo: &Demo, name: &str) -> TopologyConfig {
  let config = TopologyConfig::new(name);
  match demo {
    // Throughput demo: nothing is tracked, acks are no-ops.
    Demo::Sum { .. } => config.with_reliable(false),
    Demo::Acker => config,
    Demo::Direct => config.with_emit_interval(Duration::from_secs(2)),
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  let args = Args::parse();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let (topology, name) = build(&args.topology)?;
  let config = match &args.config {
    Some(path) => TopologyConfig::from_json_str(&std::fs::read_to_string(path)?)?,
    None => demo_config(&args.topology, name),
  };
  let config = match args.emit_interval_ms {
    Some(ms) => config.with_emit_interval(Duration::from_millis(ms)),
    None => config,
  };

  info!(topology = name, definition = %topology.definition().to_json()?, "submitting");
  let running = LocalCluster::submit(topology, config).await?;
  tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;

  let report = running.shutdown().await;
  info!(stats = %serde_json::to_string(&report.stats)?, drained = report.drained, "done");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sum_demo_runs_untracked() {
    let demo = Demo::Sum { sources: 2, sums: 2 };
    let config = demo_config(&demo, "cluster-sum");
    assert!(!config.reliable);
    assert_eq!(config.name, "cluster-sum");
  }

  #[test]
  fn test_acking_demos_stay_tracked() {
    assert!(demo_config(&Demo::Acker, "local-acker").reliable);
    let direct = demo_config(&Demo::Direct, "local-direct-grouping");
    assert!(direct.reliable);
    assert_eq!(direct.emit_interval, Duration::from_secs(2));
  }

  #[test]
  fn test_sum_demo_builds_with_shuffle_link() {
    let (topology, name) = build(&Demo::Sum { sources: 1, sums: 3 }).unwrap();
    assert_eq!(name, "cluster-sum");
    assert!(topology.definition().to_json().unwrap().contains("SumBolt"));
  }
}
