//! # Scheduler
//!
//! Runs a [`Topology`] inside the current Tokio runtime: one task per stage
//! instance, each driving its own loop, plus an optional sweeper that fails
//! trees exceeding the message timeout.
//!
//! ## Task Loops
//!
//! - **Source**: `produce` at most once per `emit_interval`; between calls,
//!   handle resolutions from the acker (`on_complete` / `on_failed`).
//! - **Processor**: dequeue one record, `process` it, repeat. Errors and
//!   panics fail the input's tree and never end the loop.
//!
//! ## Shutdown
//!
//! [`RunningTopology::shutdown`] is cooperative:
//!
//! 1. sources stop producing (they keep receiving resolutions);
//! 2. the scheduler waits until every queued record has been processed, bounded
//!    by `shutdown_timeout`;
//! 3. every task observes the halt signal, runs `close`, and exits;
//! 4. all tasks are joined.
//!
//! ## Example
//!
//! ```rust,no_run
//! use topoflow::{LocalCluster, TopologyConfig};
//! # async fn run(topology: topoflow::Topology) -> Result<(), Box<dyn std::error::Error>> {
//! let running = LocalCluster::submit(topology, TopologyConfig::new("sum")).await?;
//! tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//! let report = running.shutdown().await;
//! println!("completed trees: {}", report.stats.completed);
//! # Ok(())
//! # }
//! ```

use crate::acker::{Acker, Completion, CompletionSender};
use crate::collector::{ProcessorOutput, SourceOutput, TaskRuntime};
use crate::config::TopologyConfig;
use crate::error::{StageError, TopologyError};
use crate::record::{Record, TrackingIdGenerator};
use crate::router::{InFlight, InboxReceiver, Router, ShuffleCursor};
use crate::stage::{Processor, Source, TaskContext};
use crate::stats::{StatsSnapshot, TopologyStats};
use crate::topology::{StageFactory, Topology};
use futures::future::join_all;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Submits topologies to the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCluster;

/// Outcome of [`RunningTopology::shutdown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
  /// Whether all queued records were processed before the tasks halted.
  pub drained: bool,
  /// Final counters.
  pub stats: StatsSnapshot,
  /// Trees still unresolved when the tasks halted.
  pub pending_trees: usize,
}

/// Handle to a topology whose tasks are running.
#[derive(Debug)]
pub struct RunningTopology {
  name: Arc<str>,
  stop: CancellationToken,
  halt: CancellationToken,
  handles: Vec<JoinHandle<()>>,
  acker: Arc<Acker>,
  in_flight: Arc<InFlight>,
  stats: Arc<TopologyStats>,
  shutdown_timeout: Duration,
}

/// A stage instance ready to be driven, with the state its loop needs.
enum PreparedTask {
  Source {
    source: Box<dyn Source>,
    runtime: TaskRuntime,
  },
  Processor {
    processor: Box<dyn Processor>,
    runtime: TaskRuntime,
    inbox: InboxReceiver,
    auto_ack: bool,
  },
}

impl LocalCluster {
  /// Instantiates every task, runs `open` / `prepare`, and starts the loops.
  ///
  /// Must be called from within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// [`TopologyError::Prepare`] if a stage's `open` / `prepare` fails; no task
  /// is started in that case.
  pub async fn submit(
    topology: Topology,
    config: TopologyConfig,
  ) -> Result<RunningTopology, TopologyError> {
    let definition = Arc::clone(topology.definition());
    let name: Arc<str> = Arc::from(config.name.as_str());
    let stats = Arc::new(TopologyStats::new());
    let acker = Arc::new(Acker::with_stats(Arc::clone(&stats)));
    let ids = Arc::new(TrackingIdGenerator::new());
    let (router, mut inboxes) = Router::with_inboxes(&definition);
    let router = Arc::new(router);
    let in_flight = Arc::clone(router.in_flight());

    let mut prepared = Vec::new();
    for spec in definition.stages() {
      let stage: Arc<str> = Arc::from(spec.name.as_str());
      let fields = Arc::new(spec.output_fields.clone());
      let mut receivers = inboxes.remove(&spec.name).unwrap_or_default().into_iter();

      for task_index in 0..spec.parallelism {
        let ctx = TaskContext::new(
          Arc::clone(&name),
          Arc::clone(&stage),
          task_index,
          Arc::clone(&definition),
        );
        let runtime = TaskRuntime {
          stage: Arc::clone(&stage),
          task_index,
          fields: Arc::clone(&fields),
          router: Arc::clone(&router),
          acker: Arc::clone(&acker),
          ids: Arc::clone(&ids),
          stats: Arc::clone(&stats),
          reliable: config.reliable,
          cursor: ShuffleCursor::new(),
        };
        let prepare_error = |e: StageError| TopologyError::Prepare {
          stage: spec.name.clone(),
          task: task_index,
          message: e.to_string(),
        };

        let task = match topology.factory(&spec.name) {
          Some(StageFactory::Source(factory)) => {
            let mut source = factory();
            source.open(&ctx).map_err(prepare_error)?;
            PreparedTask::Source { source, runtime }
          }
          Some(StageFactory::Processor(factory)) => {
            let mut processor = factory();
            processor.prepare(&ctx).map_err(prepare_error)?;
            let inbox = receivers
              .next()
              .ok_or_else(|| TopologyError::UnknownStage(spec.name.clone()))?;
            PreparedTask::Processor {
              processor,
              runtime,
              inbox,
              auto_ack: spec.auto_ack,
            }
          }
          None => return Err(TopologyError::UnknownStage(spec.name.clone())),
        };
        prepared.push(task);
      }
    }

    let stop = CancellationToken::new();
    let halt = CancellationToken::new();
    let mut handles = Vec::with_capacity(prepared.len() + 1);

    for task in prepared {
      let handle = match task {
        PreparedTask::Source { source, runtime } => {
          // Each source counts as in-flight work until it stops producing.
          in_flight.begin();
          let (origin, completions) = mpsc::unbounded_channel();
          tokio::spawn(run_source(
            source,
            runtime,
            origin,
            completions,
            config.emit_interval,
            Arc::clone(&in_flight),
            stop.clone(),
            halt.clone(),
          ))
        }
        PreparedTask::Processor {
          processor,
          runtime,
          inbox,
          auto_ack,
        } => tokio::spawn(run_processor(
          processor,
          runtime,
          inbox,
          auto_ack,
          Arc::clone(&in_flight),
          halt.clone(),
        )),
      };
      handles.push(handle);
    }

    if let Some(timeout) = config.message_timeout {
      handles.push(tokio::spawn(run_timeout_sweeper(
        Arc::clone(&acker),
        timeout,
        config.timeout_sweep_interval,
        halt.clone(),
      )));
    }

    info!(
      topology = %name,
      tasks = handles.len(),
      reliable = config.reliable,
      "topology started"
    );

    Ok(RunningTopology {
      name,
      stop,
      halt,
      handles,
      acker,
      in_flight,
      stats,
      shutdown_timeout: config.shutdown_timeout,
    })
  }
}

impl RunningTopology {
  /// Name of the topology.
  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Current counters.
  #[must_use]
  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  /// Number of unresolved tracked trees.
  #[must_use]
  pub fn pending_trees(&self) -> usize {
    self.acker.pending()
  }

  /// Stops sources, drains queues, halts and joins every task.
  pub async fn shutdown(self) -> ShutdownReport {
    info!(topology = %self.name, "stopping topology");
    self.stop.cancel();

    let drained = tokio::time::timeout(self.shutdown_timeout, self.in_flight.wait_idle())
      .await
      .is_ok();
    if !drained {
      warn!(
        topology = %self.name,
        in_flight = self.in_flight.current(),
        "queues did not drain before the shutdown timeout"
      );
    }

    self.halt.cancel();
    for result in join_all(self.handles).await {
      if let Err(e) = result {
        error!(topology = %self.name, error = %e, "task ended abnormally");
      }
    }

    let report = ShutdownReport {
      drained,
      stats: self.stats.snapshot(),
      pending_trees: self.acker.pending(),
    };
    info!(topology = %self.name, ?report, "topology stopped");
    report
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

fn deliver_completion(source: &mut dyn Source, runtime: &TaskRuntime, completion: Completion) {
  debug!(stage = %runtime.stage, task = runtime.task_index, ?completion, "resolution");
  let result = catch_unwind(AssertUnwindSafe(|| match completion {
    Completion::Acked(id) => source.on_complete(id),
    Completion::Failed(id) | Completion::TimedOut(id) => source.on_failed(id),
  }));
  if let Err(payload) = result {
    runtime.stats.record_stage_error();
    error!(
      stage = %runtime.stage,
      task = runtime.task_index,
      panic = %panic_message(payload.as_ref()),
      "completion callback panicked"
    );
  }
}

#[allow(clippy::too_many_arguments)]
async fn run_source(
  mut source: Box<dyn Source>,
  mut runtime: TaskRuntime,
  origin: CompletionSender,
  mut completions: mpsc::UnboundedReceiver<Completion>,
  emit_interval: Duration,
  in_flight: Arc<InFlight>,
  stop: CancellationToken,
  halt: CancellationToken,
) {
  debug!(stage = %runtime.stage, task = runtime.task_index, "source task started");
  let mut producing = true;
  let mut next_emit = Instant::now();

  loop {
    tokio::select! {
      biased;
      _ = halt.cancelled() => break,
      Some(completion) = completions.recv() => {
        deliver_completion(source.as_mut(), &runtime, completion);
      }
      _ = stop.cancelled(), if producing => {
        producing = false;
        in_flight.end();
        debug!(stage = %runtime.stage, task = runtime.task_index, "source stopped producing");
      }
      _ = sleep_until(next_emit), if producing => {
        let mut out = SourceOutput::new(&mut runtime, &origin);
        match catch_unwind(AssertUnwindSafe(|| source.produce(&mut out))) {
          Ok(Ok(())) => {}
          Ok(Err(e)) => {
            runtime.stats.record_stage_error();
            warn!(stage = %runtime.stage, task = runtime.task_index, error = %e, "produce failed");
          }
          Err(payload) => {
            runtime.stats.record_stage_error();
            error!(
              stage = %runtime.stage,
              task = runtime.task_index,
              panic = %panic_message(payload.as_ref()),
              "produce panicked"
            );
          }
        }
        next_emit = Instant::now() + emit_interval;
      }
    }
  }

  if producing {
    in_flight.end();
  }
  while let Ok(completion) = completions.try_recv() {
    deliver_completion(source.as_mut(), &runtime, completion);
  }
  source.close();
  debug!(stage = %runtime.stage, task = runtime.task_index, "source task stopped");
}

async fn run_processor(
  mut processor: Box<dyn Processor>,
  mut runtime: TaskRuntime,
  mut inbox: InboxReceiver,
  auto_ack: bool,
  in_flight: Arc<InFlight>,
  halt: CancellationToken,
) {
  debug!(stage = %runtime.stage, task = runtime.task_index, "processor task started");
  loop {
    tokio::select! {
      biased;
      received = inbox.recv() => match received {
        Some(record) => {
          process_one(processor.as_mut(), &mut runtime, &record, auto_ack);
          in_flight.end();
        }
        None => break,
      },
      _ = halt.cancelled() => break,
    }
  }
  processor.close();
  debug!(stage = %runtime.stage, task = runtime.task_index, "processor task stopped");
}

fn process_one(
  processor: &mut dyn Processor,
  runtime: &mut TaskRuntime,
  record: &Record,
  auto_ack: bool,
) {
  runtime.stats.record_processed();
  let stage = Arc::clone(&runtime.stage);
  let task = runtime.task_index;
  let mut out = ProcessorOutput::new(runtime, record);

  match catch_unwind(AssertUnwindSafe(|| processor.process(record, &mut out))) {
    Ok(Ok(())) => {
      if auto_ack && !out.is_resolved() {
        out.ack();
      }
    }
    Ok(Err(e)) => {
      warn!(stage = %stage, task, error = %e, "process failed; failing the input tree");
      out.fail_tree();
      runtime.stats.record_stage_error();
    }
    Err(payload) => {
      error!(
        stage = %stage,
        task,
        panic = %panic_message(payload.as_ref()),
        "process panicked; failing the input tree"
      );
      out.fail_tree();
      runtime.stats.record_stage_error();
    }
  }
}

async fn run_timeout_sweeper(
  acker: Arc<Acker>,
  timeout: Duration,
  every: Duration,
  halt: CancellationToken,
) {
  let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = halt.cancelled() => break,
      _ = ticker.tick() => {
        let expired = acker.expire(timeout);
        if !expired.is_empty() {
          debug!(count = expired.len(), "expired pending trees");
        }
      }
    }
  }
}
