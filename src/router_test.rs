//! # Router Test Suite
//!
//! Task selection for every grouping, misuse of direct links, and inbox
//! delivery bookkeeping.

use crate::error::{RouteError, StageError};
use crate::record::{Fields, Record};
use crate::router::{Router, ShuffleCursor, Target};
use crate::stage::{Processor, ProcessorOutput, Source, SourceOutput};
use crate::topology::{Grouping, TopologyBuilder, TopologyDefinition};
use crate::values;
use std::collections::HashMap;

struct Idle;

impl Source for Idle {
  fn produce(&mut self, _out: &mut SourceOutput<'_>) -> Result<(), StageError> {
    Ok(())
  }
}

struct Sink;

impl Processor for Sink {
  fn process(&mut self, _input: &Record, _out: &mut ProcessorOutput<'_>) -> Result<(), StageError> {
    Ok(())
  }
}

/// `src` (fields `word`, `num`) feeding `dst` with `tasks` tasks.
fn definition(grouping: Grouping, tasks: usize) -> TopologyDefinition {
  let mut builder = TopologyBuilder::new();
  builder.set_source("src", || Idle, 1).output_fields(["word", "num"]);
  builder.set_processor("dst", || Sink, tasks).grouping("src", grouping);
  builder.build().unwrap().definition().as_ref().clone()
}

fn record(word: &str, num: i64) -> Record {
  Record::new(Fields::new(["word", "num"]), values![word, num]).unwrap()
}

#[test]
fn test_shuffle_is_balanced() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Shuffle, 3));
  let mut cursor = ShuffleCursor::new();
  let mut counts: HashMap<usize, usize> = HashMap::new();

  for n in 0..100 {
    let tasks = router
      .select("src", "dst", &record("w", n), Target::Grouped, &mut cursor)
      .unwrap();
    assert_eq!(tasks.len(), 1);
    *counts.entry(tasks[0]).or_default() += 1;
  }

  assert_eq!(counts.len(), 3);
  let max = counts.values().max().unwrap();
  let min = counts.values().min().unwrap();
  assert!(max - min <= 1, "unbalanced shuffle: {counts:?}");
}

#[test]
fn test_shuffle_single_task() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Shuffle, 1));
  let mut cursor = ShuffleCursor::new();
  for n in 0..5 {
    let tasks = router
      .select("src", "dst", &record("w", n), Target::Grouped, &mut cursor)
      .unwrap();
    assert_eq!(tasks, vec![0]);
  }
}

#[test]
fn test_direct_selects_named_task() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Direct, 3));
  let mut cursor = ShuffleCursor::new();
  let tasks = router
    .select("src", "dst", &record("w", 1), Target::Task(2), &mut cursor)
    .unwrap();
  assert_eq!(tasks, vec![2]);
}

#[test]
fn test_direct_rejects_out_of_range_task() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Direct, 3));
  let mut cursor = ShuffleCursor::new();
  let err = router
    .select("src", "dst", &record("w", 1), Target::Task(7), &mut cursor)
    .unwrap_err();
  assert_eq!(
    err,
    RouteError::InvalidTaskIndex {
      stage: "dst".to_string(),
      index: 7,
      parallelism: 3,
    }
  );
}

#[test]
fn test_direct_link_requires_task() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Direct, 2));
  let mut cursor = ShuffleCursor::new();
  let err = router
    .select("src", "dst", &record("w", 1), Target::Grouped, &mut cursor)
    .unwrap_err();
  assert!(matches!(err, RouteError::DirectEmitRequired { .. }));
}

#[test]
fn test_task_target_requires_direct_link() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Shuffle, 2));
  let mut cursor = ShuffleCursor::new();
  let err = router
    .select("src", "dst", &record("w", 1), Target::Task(0), &mut cursor)
    .unwrap_err();
  assert!(matches!(err, RouteError::NotDirect { .. }));
}

#[test]
fn test_broadcast_selects_every_task() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Broadcast, 4));
  let mut cursor = ShuffleCursor::new();
  let tasks = router
    .select("src", "dst", &record("w", 1), Target::Grouped, &mut cursor)
    .unwrap();
  assert_eq!(tasks, vec![0, 1, 2, 3]);
}

#[test]
fn test_fields_grouping_keeps_key_affinity() {
  let grouping = Grouping::Fields(vec!["word".to_string()]);
  let (router, _rx) = Router::with_inboxes(&definition(grouping, 4));
  let mut cursor = ShuffleCursor::new();
  let mut assigned: HashMap<String, usize> = HashMap::new();

  for n in 0..200 {
    let word = format!("w{}", n % 10);
    let task = router
      .select("src", "dst", &record(&word, n), Target::Grouped, &mut cursor)
      .unwrap()[0];
    assert!(task < 4);
    let first = *assigned.entry(word.clone()).or_insert(task);
    assert_eq!(first, task, "key {word} moved between tasks");
  }
}

#[test]
fn test_global_always_task_zero() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Global, 3));
  let mut cursor = ShuffleCursor::new();
  for n in 0..10 {
    let tasks = router
      .select("src", "dst", &record("w", n), Target::Grouped, &mut cursor)
      .unwrap();
    assert_eq!(tasks, vec![0]);
  }
}

#[test]
fn test_unlinked_and_unknown_stages() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Shuffle, 2));
  let mut cursor = ShuffleCursor::new();

  let err = router
    .select("dst", "src", &record("w", 1), Target::Grouped, &mut cursor)
    .unwrap_err();
  assert!(matches!(err, RouteError::NotLinked { .. }));

  let err = router
    .select("src", "ghost", &record("w", 1), Target::Grouped, &mut cursor)
    .unwrap_err();
  assert_eq!(err, RouteError::UnknownStage("ghost".to_string()));
}

#[test]
fn test_destinations_in_declaration_order() {
  let mut builder = TopologyBuilder::new();
  builder.set_source("src", || Idle, 1).output_fields(["word", "num"]);
  builder.set_processor("b", || Sink, 1).shuffle_grouping("src");
  builder.set_processor("a", || Sink, 1).shuffle_grouping("src");
  let definition = builder.build().unwrap().definition().as_ref().clone();
  let (router, receivers) = Router::with_inboxes(&definition);

  assert_eq!(router.destinations("src").collect::<Vec<_>>(), vec!["b", "a"]);
  assert_eq!(router.destinations("a").count(), 0);
  assert!(!receivers.contains_key("src"));
}

#[tokio::test]
async fn test_deliver_enqueues_and_tracks_in_flight() {
  let (router, mut receivers) = Router::with_inboxes(&definition(Grouping::Direct, 2));
  let mut inboxes = receivers.remove("dst").unwrap();

  router.deliver("dst", 1, record("hello", 1)).unwrap();
  assert_eq!(router.in_flight().current(), 1);

  let received = inboxes[1].recv().await.unwrap();
  assert_eq!(received.get_str("word").unwrap(), "hello");
  assert!(inboxes[0].try_recv().is_err());

  router.in_flight().end();
  router.in_flight().wait_idle().await;
}

#[test]
fn test_deliver_to_closed_inbox() {
  let (router, receivers) = Router::with_inboxes(&definition(Grouping::Direct, 1));
  drop(receivers);

  let err = router.deliver("dst", 0, record("w", 1)).unwrap_err();
  assert_eq!(
    err,
    RouteError::Closed {
      stage: "dst".to_string(),
      index: 0,
    }
  );
  assert_eq!(router.in_flight().current(), 0);
}

#[test]
fn test_wait_idle_wakes_when_count_reaches_zero() {
  let (router, _rx) = Router::with_inboxes(&definition(Grouping::Shuffle, 1));
  let in_flight = router.in_flight();
  in_flight.begin();
  in_flight.begin();

  let mut idle = tokio_test::task::spawn(in_flight.wait_idle());
  tokio_test::assert_pending!(idle.poll());
  in_flight.end();
  tokio_test::assert_pending!(idle.poll());
  in_flight.end();
  assert!(idle.is_woken());
  tokio_test::assert_ready!(idle.poll());
}
