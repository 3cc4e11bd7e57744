//! # Scheduler Test Suite
//!
//! Task lifecycle hooks, stage failure isolation, auto-ack, and shutdown.

use crate::config::TopologyConfig;
use crate::error::{RouteError, StageError, TopologyError};
use crate::record::{Record, TrackingId};
use crate::scheduler::LocalCluster;
use crate::stage::{Processor, ProcessorOutput, Source, SourceOutput, TaskContext};
use crate::topology::TopologyBuilder;
use crate::values;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Emits 1..=limit, one per `produce`, and records how each tree resolved.
struct Counting {
  next: i64,
  limit: i64,
  sent: HashMap<TrackingId, i64>,
  acked: Arc<Mutex<Vec<i64>>>,
  failed: Arc<Mutex<Vec<i64>>>,
}

impl Counting {
  fn new(limit: i64, acked: Arc<Mutex<Vec<i64>>>, failed: Arc<Mutex<Vec<i64>>>) -> Self {
    Self {
      next: 1,
      limit,
      sent: HashMap::new(),
      acked,
      failed,
    }
  }
}

impl Source for Counting {
  fn produce(&mut self, out: &mut SourceOutput<'_>) -> Result<(), StageError> {
    if self.next > self.limit {
      return Ok(());
    }
    let num = self.next;
    self.next += 1;
    if let Some(id) = out.emit(values![num])? {
      self.sent.insert(id, num);
    }
    Ok(())
  }

  fn on_complete(&mut self, id: TrackingId) {
    if let Some(num) = self.sent.remove(&id) {
      self.acked.lock().unwrap().push(num);
    }
  }

  fn on_failed(&mut self, id: TrackingId) {
    if let Some(num) = self.sent.remove(&id) {
      self.failed.lock().unwrap().push(num);
    }
  }
}

fn fast(name: &str) -> TopologyConfig {
  TopologyConfig::new(name)
    .with_emit_interval(Duration::from_millis(1))
    .with_shutdown_timeout(Duration::from_secs(5))
}

async fn wait_until(mut done: impl FnMut() -> bool) {
  for _ in 0..500 {
    if done() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("condition not reached in time");
}

/// Panics on 3, errors on 5, acks everything else.
struct Flaky;

impl Processor for Flaky {
  fn process(&mut self, input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    match input.get_int("num")? {
      3 => panic!("boom"),
      5 => Err(StageError::msg("five is not allowed")),
      _ => {
        out.ack();
        Ok(())
      }
    }
  }
}

#[tokio::test]
async fn test_stage_errors_and_panics_fail_only_their_tree() {
  let acked = Arc::new(Mutex::new(Vec::new()));
  let failed = Arc::new(Mutex::new(Vec::new()));
  let (a, f) = (Arc::clone(&acked), Arc::clone(&failed));

  let mut builder = TopologyBuilder::new();
  builder
    .set_source("numbers", move || Counting::new(8, Arc::clone(&a), Arc::clone(&f)), 1)
    .output_fields(["num"]);
  builder.set_processor("flaky", || Flaky, 1).shuffle_grouping("numbers");

  let running = LocalCluster::submit(builder.build().unwrap(), fast("flaky"))
    .await
    .unwrap();
  wait_until(|| acked.lock().unwrap().len() + failed.lock().unwrap().len() == 8).await;
  let report = running.shutdown().await;

  let mut failed = failed.lock().unwrap().clone();
  failed.sort_unstable();
  assert_eq!(failed, vec![3, 5]);
  assert_eq!(acked.lock().unwrap().len(), 6);
  assert_eq!(report.stats.stage_errors, 2);
  assert_eq!(report.stats.failed, 2);
  assert_eq!(report.stats.completed, 6);
  assert!(report.drained);
}

/// Never acks nor fails explicitly.
struct Silent;

impl Processor for Silent {
  fn process(&mut self, _input: &Record, _out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    Ok(())
  }
}

#[tokio::test]
async fn test_auto_ack_resolves_unacknowledged_inputs() {
  let acked = Arc::new(Mutex::new(Vec::new()));
  let failed = Arc::new(Mutex::new(Vec::new()));
  let (a, f) = (Arc::clone(&acked), Arc::clone(&failed));

  let mut builder = TopologyBuilder::new();
  builder
    .set_source("numbers", move || Counting::new(4, Arc::clone(&a), Arc::clone(&f)), 1)
    .output_fields(["num"]);
  builder
    .set_processor("silent", || Silent, 2)
    .shuffle_grouping("numbers")
    .auto_ack();

  let running = LocalCluster::submit(builder.build().unwrap(), fast("auto"))
    .await
    .unwrap();
  wait_until(|| acked.lock().unwrap().len() == 4).await;
  let report = running.shutdown().await;

  assert!(failed.lock().unwrap().is_empty());
  assert_eq!(report.pending_trees, 0);
}

#[tokio::test]
async fn test_unacked_trees_stay_pending_without_auto_ack() {
  let acked = Arc::new(Mutex::new(Vec::new()));
  let failed = Arc::new(Mutex::new(Vec::new()));
  let (a, f) = (Arc::clone(&acked), Arc::clone(&failed));

  let mut builder = TopologyBuilder::new();
  builder
    .set_source("numbers", move || Counting::new(3, Arc::clone(&a), Arc::clone(&f)), 1)
    .output_fields(["num"]);
  builder.set_processor("silent", || Silent, 1).shuffle_grouping("numbers");

  let running = LocalCluster::submit(builder.build().unwrap(), fast("silent"))
    .await
    .unwrap();
  wait_until(|| running.stats().processed == 3).await;
  assert_eq!(running.pending_trees(), 3);
  let report = running.shutdown().await;

  assert!(report.drained);
  assert_eq!(report.pending_trees, 3);
  assert!(acked.lock().unwrap().is_empty());
}

struct Lifecycle {
  prepared: Arc<AtomicUsize>,
  closed: Arc<AtomicUsize>,
}

impl Processor for Lifecycle {
  fn prepare(&mut self, ctx: &TaskContext) -> Result<(), StageError> {
    assert_eq!(ctx.topology_name(), "lifecycle");
    assert_eq!(ctx.stage_name(), "sink");
    assert_eq!(ctx.tasks_of("sink"), Some(vec![0, 1, 2]));
    self.prepared.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn process(&mut self, _input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    out.ack();
    Ok(())
  }

  fn close(&mut self) {
    self.closed.fetch_add(1, Ordering::SeqCst);
  }
}

struct Idle;

impl Source for Idle {
  fn produce(&mut self, _out: &mut SourceOutput<'_>) -> Result<(), StageError> {
    Ok(())
  }
}

#[tokio::test]
async fn test_prepare_and_close_run_once_per_task() {
  let prepared = Arc::new(AtomicUsize::new(0));
  let closed = Arc::new(AtomicUsize::new(0));
  let (p, c) = (Arc::clone(&prepared), Arc::clone(&closed));

  let mut builder = TopologyBuilder::new();
  builder.set_source("idle", || Idle, 1).output_fields(["num"]);
  builder
    .set_processor(
      "sink",
      move || Lifecycle {
        prepared: Arc::clone(&p),
        closed: Arc::clone(&c),
      },
      3,
    )
    .shuffle_grouping("idle");

  let running = LocalCluster::submit(builder.build().unwrap(), fast("lifecycle"))
    .await
    .unwrap();
  assert_eq!(prepared.load(Ordering::SeqCst), 3);
  assert_eq!(closed.load(Ordering::SeqCst), 0);

  running.shutdown().await;
  assert_eq!(closed.load(Ordering::SeqCst), 3);
}

struct Unopenable;

impl Source for Unopenable {
  fn open(&mut self, _ctx: &TaskContext) -> Result<(), StageError> {
    Err(StageError::msg("no connection"))
  }

  fn produce(&mut self, _out: &mut SourceOutput<'_>) -> Result<(), StageError> {
    Ok(())
  }
}

#[tokio::test]
async fn test_open_failure_aborts_submission() {
  let mut builder = TopologyBuilder::new();
  builder.set_source("broken", || Unopenable, 2);

  let err = LocalCluster::submit(builder.build().unwrap(), fast("broken"))
    .await
    .unwrap_err();
  assert_eq!(
    err,
    TopologyError::Prepare {
      stage: "broken".to_string(),
      task: 0,
      message: "no connection".to_string(),
    }
  );
}

#[tokio::test]
async fn test_shutdown_without_traffic_is_immediate() {
  let mut builder = TopologyBuilder::new();
  builder.set_source("idle", || Idle, 2).output_fields(["num"]);
  builder.set_processor("silent", || Silent, 2).shuffle_grouping("idle");

  let running = LocalCluster::submit(builder.build().unwrap(), fast("idle"))
    .await
    .unwrap();
  assert_eq!(running.name(), "idle");
  let report = running.shutdown().await;

  assert!(report.drained);
  assert_eq!(report.stats.emitted, 0);
  assert_eq!(report.stats.processed, 0);
}

/// Resolves its input first, then tries to emit a derived record, logging
/// what the emission returned.
struct ResolveThenEmit {
  ack: bool,
  results: Arc<Mutex<Vec<Result<(), RouteError>>>>,
}

impl Processor for ResolveThenEmit {
  fn process(&mut self, input: &Record, out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    let num = input.get_int("num")?;
    if self.ack {
      out.ack();
    } else {
      out.fail();
    }
    let result = out.emit(values![num * 10]);
    self.results.lock().unwrap().push(result);
    Ok(())
  }
}

/// Counts deliveries and never resolves them.
struct Received(Arc<AtomicUsize>);

impl Processor for Received {
  fn process(&mut self, _input: &Record, _out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    self.0.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

async fn run_resolve_then_emit(ack: bool) -> (Vec<i64>, Vec<i64>, Vec<Result<(), RouteError>>, usize, usize) {
  let acked = Arc::new(Mutex::new(Vec::new()));
  let failed = Arc::new(Mutex::new(Vec::new()));
  let results = Arc::new(Mutex::new(Vec::new()));
  let received = Arc::new(AtomicUsize::new(0));
  let (a, f) = (Arc::clone(&acked), Arc::clone(&failed));
  let (r, n) = (Arc::clone(&results), Arc::clone(&received));

  let mut builder = TopologyBuilder::new();
  builder
    .set_source("numbers", move || Counting::new(1, Arc::clone(&a), Arc::clone(&f)), 1)
    .output_fields(["num"]);
  builder
    .set_processor(
      "mid",
      move || ResolveThenEmit {
        ack,
        results: Arc::clone(&r),
      },
      1,
    )
    .output_fields(["num"])
    .shuffle_grouping("numbers");
  builder
    .set_processor("sink", move || Received(Arc::clone(&n)), 1)
    .shuffle_grouping("mid");

  let running = LocalCluster::submit(builder.build().unwrap(), fast("resolve-then-emit"))
    .await
    .unwrap();
  wait_until(|| acked.lock().unwrap().len() + failed.lock().unwrap().len() == 1).await;
  wait_until(|| results.lock().unwrap().len() == 1).await;
  let report = running.shutdown().await;

  let acked = acked.lock().unwrap().clone();
  let failed = failed.lock().unwrap().clone();
  let results = results.lock().unwrap().clone();
  (acked, failed, results, received.load(Ordering::SeqCst), report.pending_trees)
}

#[tokio::test]
async fn test_emit_after_ack_is_rejected() {
  let (acked, failed, results, received, pending) = run_resolve_then_emit(true).await;

  assert_eq!(results.len(), 1);
  assert!(matches!(results[0], Err(RouteError::InputResolved(_))));
  assert_eq!(received, 0);
  assert_eq!(acked, vec![1]);
  assert!(failed.is_empty());
  assert_eq!(pending, 0);
}

#[tokio::test]
async fn test_emit_after_fail_is_rejected() {
  let (acked, failed, results, received, pending) = run_resolve_then_emit(false).await;

  assert_eq!(results.len(), 1);
  assert!(matches!(results[0], Err(RouteError::InputResolved(_))));
  assert_eq!(received, 0);
  assert!(acked.is_empty());
  assert_eq!(failed, vec![1]);
  assert_eq!(pending, 0);
}
