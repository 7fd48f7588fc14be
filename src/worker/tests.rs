use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Disposition, LoggingHandler, MessageHandler, PollStats, QueueSource, Worker, handler_fn};
use crate::broker::clock::{Clock, ManualClock, SystemClock};
use crate::broker::dead_letter::DeadLetterSink;
use crate::broker::message::{Attributes, Message};
use crate::broker::queue::{DurableQueue, QueueConfig};
use crate::persistence::Store;

const START: i64 = 1_700_000_000_000;

fn queue_with_clock(
    clock: Arc<dyn Clock>,
    config: QueueConfig,
) -> (Arc<DurableQueue>, DeadLetterSink) {
    let store = Store::temporary().unwrap();
    let sink = DeadLetterSink::open(&store, Duration::from_secs(3600), clock.clone()).unwrap();
    let queue = DurableQueue::open(&store, "work", config, sink.clone(), clock).unwrap();
    (Arc::new(queue), sink)
}

fn short_lease(max_receive_count: u32) -> QueueConfig {
    QueueConfig {
        visibility_timeout: Duration::from_secs(5),
        max_receive_count,
    }
}

fn worker(queue: &Arc<DurableQueue>, handler: Arc<dyn MessageHandler>) -> Worker {
    Worker::new(queue.clone(), handler).with_batch(10, Duration::ZERO)
}

#[tokio::test]
async fn test_acked_entries_are_removed() {
    let clock = Arc::new(ManualClock::new(START));
    let (queue, sink) = queue_with_clock(clock, short_lease(5));
    queue.enqueue(Message::with_status("a", "created")).unwrap();
    queue.enqueue(Message::with_status("b", "created")).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let handler = handler_fn(move |_body: &str, attrs: &Attributes| {
        assert_eq!(attrs.get("status").map(String::as_str), Some("created"));
        counter.fetch_add(1, Ordering::SeqCst);
        Disposition::Ack
    });

    let stats = worker(&queue, Arc::new(handler)).poll_once().await.unwrap();
    assert_eq!(
        stats,
        PollStats {
            received: 2,
            acked: 2,
            nacked: 0
        }
    );
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_nacked_entry_is_redelivered_after_lease() {
    let clock = Arc::new(ManualClock::new(START));
    let (queue, _) = queue_with_clock(clock.clone(), short_lease(5));
    let id = queue.enqueue(Message::with_status("flaky", "x")).unwrap();

    let w = worker(&queue, Arc::new(handler_fn(|_: &str, _: &Attributes| Disposition::Nack)));
    assert_eq!(w.poll_once().await.unwrap().nacked, 1);
    assert_eq!(queue.get(&id).unwrap().unwrap().receive_count, 1);

    // Leased: nothing to do yet.
    assert_eq!(w.poll_once().await.unwrap().received, 0);

    clock.advance(Duration::from_secs(5));
    assert_eq!(w.poll_once().await.unwrap().nacked, 1);
    assert_eq!(queue.get(&id).unwrap().unwrap().receive_count, 2);
}

#[tokio::test]
async fn test_panicking_handler_counts_as_nack() {
    let clock = Arc::new(ManualClock::new(START));
    let (queue, _) = queue_with_clock(clock, short_lease(5));
    let id = queue.enqueue(Message::with_status("boom", "x")).unwrap();

    let handler = handler_fn(|body: &str, _: &Attributes| {
        if body == "boom" {
            panic!("handler blew up");
        }
        Disposition::Ack
    });
    let stats = worker(&queue, Arc::new(handler)).poll_once().await.unwrap();

    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.acked, 0);
    assert!(queue.get(&id).unwrap().is_some());
}

#[tokio::test]
async fn test_repeated_failures_end_in_dead_letters() {
    let clock = Arc::new(ManualClock::new(START));
    let (queue, sink) = queue_with_clock(clock.clone(), short_lease(2));
    queue.enqueue(Message::with_status("poison", "x")).unwrap();

    let w = worker(&queue, Arc::new(handler_fn(|_: &str, _: &Attributes| Disposition::Nack)));
    for _ in 0..2 {
        assert_eq!(w.poll_once().await.unwrap().received, 1);
        clock.advance(Duration::from_secs(5));
    }
    assert_eq!(w.poll_once().await.unwrap().received, 0);

    assert!(queue.is_empty());
    let letters = sink.list().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].final_receive_count, 3);
    assert_eq!(letters[0].original_queue, "work");
}

#[tokio::test]
async fn test_logging_handler_acks() {
    let handler = LoggingHandler::new("created-status");
    let attrs = Attributes::from([("status".to_string(), "created".to_string())]);
    assert_eq!(handler.handle("hello", &attrs).await, Disposition::Ack);
}

#[tokio::test]
async fn test_run_drains_queue_and_stops_on_shutdown() {
    let (queue, _) = queue_with_clock(Arc::new(SystemClock), short_lease(5));
    let shutdown = CancellationToken::new();

    let w = Worker::new(queue.clone(), Arc::new(LoggingHandler::new("test")))
        .with_batch(10, Duration::from_secs(5));
    let handle = tokio::spawn(w.run(shutdown.clone()));

    for i in 0..3 {
        queue.enqueue(Message::with_status(format!("m{i}"), "x")).unwrap();
    }

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "worker should drain the queue");

    // Cancelling interrupts the in-flight long poll.
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker should stop promptly")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_workers_share_one_queue() {
    let (queue, _) = queue_with_clock(Arc::new(SystemClock), short_lease(5));
    for i in 0..30 {
        queue.enqueue(Message::with_status(format!("m{i}"), "x")).unwrap();
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let counter = handled.clone();
        let handler = handler_fn(move |_: &str, _: &Attributes| {
            counter.fetch_add(1, Ordering::SeqCst);
            Disposition::Ack
        });
        let w = Worker::new(queue.clone(), Arc::new(handler))
            .with_batch(4, Duration::from_millis(50));
        handles.push(tokio::spawn(w.run(shutdown.clone())));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue drained");
    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(handled.load(Ordering::SeqCst), 30);
}

#[tokio::test]
async fn test_worker_reports_source_name() {
    let (queue, _) = queue_with_clock(Arc::new(ManualClock::new(START)), short_lease(1));
    let source: Arc<dyn QueueSource> = queue;
    assert_eq!(source.name(), "work");
    let w = Worker::new(source, Arc::new(LoggingHandler::new("x")));
    assert!(w.id().starts_with("worker-"));
}
