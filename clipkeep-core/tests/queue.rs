use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clipkeep_core::{Job, QualityHint, SqliteJobQueue};
use tempfile::TempDir;

fn temp_queue(dir: &Path) -> SqliteJobQueue {
    let queue = SqliteJobQueue::builder()
        .path(dir.join("queue.sqlite"))
        .create_if_missing(true)
        .idle_recheck(Duration::from_millis(50))
        .build()
        .expect("create queue");
    queue.initialize().expect("initialize queue");
    queue
}

fn job(submitter: &str, n: u32) -> Job {
    Job::new(
        submitter,
        format!("https://example.com/watch?v={n}"),
        QualityHint::MaxHeight(720),
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
    )
}

#[test]
fn dequeues_in_fifo_order_across_submitters() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    queue.enqueue(&job("alice", 1)).unwrap();
    queue.enqueue(&job("bob", 2)).unwrap();
    queue.enqueue(&job("alice", 3)).unwrap();
    assert_eq!(queue.len().unwrap(), 3);

    let peeked = queue.peek(10).unwrap();
    assert_eq!(peeked.len(), 3);
    assert_eq!(queue.len().unwrap(), 3, "peek does not consume");

    let order: Vec<_> = std::iter::from_fn(|| queue.try_dequeue().unwrap())
        .map(|queued| queued.job.url)
        .collect();
    assert_eq!(
        order,
        vec![
            "https://example.com/watch?v=1",
            "https://example.com/watch?v=2",
            "https://example.com/watch?v=3",
        ]
    );
    assert!(queue.is_empty().unwrap());
}

#[test]
fn payload_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let original = job("carol", 9);
    {
        let queue = temp_queue(dir.path());
        queue.enqueue(&original).unwrap();
    }
    let reopened = SqliteJobQueue::new(dir.path().join("queue.sqlite")).unwrap();
    let queued = reopened.try_dequeue().unwrap().expect("job persisted");
    assert_eq!(queued.job, original);
    assert!(queued.enqueued_at.is_some());
}

#[test]
fn concurrent_consumers_never_share_a_job() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    for n in 0..40 {
        queue.enqueue(&job("dave", n)).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(queued) = queue.try_dequeue().unwrap() {
                    seen.push(queued.id);
                }
                seen
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test]
async fn dequeue_waits_for_a_producer() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(temp_queue(dir.path()));

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!consumer.is_finished());

    queue.enqueue(&job("erin", 1)).unwrap();
    let queued = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer woke up")
        .unwrap()
        .unwrap();
    assert_eq!(queued.job.submitter, "erin");
}

#[tokio::test]
async fn dequeue_notices_jobs_from_another_handle() {
    let dir = TempDir::new().unwrap();
    let consumer_queue = temp_queue(dir.path());
    let producer_queue = SqliteJobQueue::new(dir.path().join("queue.sqlite")).unwrap();

    let consumer = tokio::spawn(async move { consumer_queue.dequeue().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    producer_queue.enqueue(&job("frank", 1)).unwrap();

    let queued = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("idle recheck picked the job up")
        .unwrap()
        .unwrap();
    assert_eq!(queued.job.submitter, "frank");
}
