//! Round trips against a live Redis.
//!
//! Run with `REDIS_URL=redis://localhost:6379 cargo test -p renderq-queue -- --ignored`.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Map};

use renderq_models::{JobState, QueueEvent, RenderJob};
use renderq_queue::{EventChannel, JobQueue, JobStore, QueueConfig, RedisJobStore};

fn test_config() -> QueueConfig {
    QueueConfig::from_env().with_queue(format!("test-{}", uuid::Uuid::new_v4()))
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn enqueue_consume_ack() {
    let config = test_config();
    let queue = JobQueue::new(config.clone()).unwrap();
    queue.init().await.unwrap();

    let job = RenderJob::new(config.queue_name.clone(), "animatediff", Map::new());
    queue.enqueue(&job).await.unwrap();
    assert!(queue.enqueue(&job).await.is_err(), "duplicate must be rejected");

    let consumed = queue.consume("test-consumer", 1000, 5).await.unwrap();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].1.job_id, job.job_id);

    queue.ack(&consumed[0].0).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
    queue.clear_dedup(&job).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn dead_lettered_job_leaves_the_stream() {
    let config = test_config();
    let queue = JobQueue::new(config.clone()).unwrap();
    queue.init().await.unwrap();

    let job = RenderJob::new(config.queue_name.clone(), "animatediff", Map::new());
    queue.enqueue(&job).await.unwrap();
    let consumed = queue.consume("test-consumer", 1000, 5).await.unwrap();
    assert_eq!(consumed.len(), 1);

    queue.dlq(&consumed[0].0, &job, "Backend job failed: CUDA OOM").await.unwrap();
    assert_eq!(queue.dlq_len().await.unwrap(), 1);
    assert_eq!(queue.len().await.unwrap(), 0);
    queue.clear_dedup(&job).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn record_lifecycle_publishes_events() {
    let config = test_config();
    let store = RedisJobStore::open(config.clone()).unwrap();
    let events = EventChannel::open(&config).unwrap();
    let mut stream = events.subscribe().await.unwrap();

    let job = RenderJob::new(config.queue_name.clone(), "animatediff", Map::new());
    store.insert(&job).await.unwrap();
    store.mark_active(&job.job_id, "test-consumer").await.unwrap();
    store.heartbeat(&job.job_id, "test-consumer").await.unwrap();
    let active = store.fetch(&job.job_id).await.unwrap().unwrap();
    assert_eq!(active.owner.as_deref(), Some("test-consumer"));
    assert!(active.heartbeat_at.is_some());
    assert!(store.request_cancel(&job.job_id).await.unwrap());
    store
        .complete(&job.job_id, &json!({"r2_url": "https://r2/videos/a.mp4"}))
        .await
        .unwrap();

    let record = store.fetch(&job.job_id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert!(record.cancelled_by_user);

    match stream.next().await.unwrap() {
        QueueEvent::Completed { job_id, .. } => assert_eq!(job_id, job.job_id),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn claim_skips_in_flight_entries() {
    let mut config = test_config();
    config.claim_min_idle = Duration::from_millis(0);
    let queue = JobQueue::new(config.clone()).unwrap();
    queue.init().await.unwrap();

    let job = RenderJob::new(config.queue_name.clone(), "animatediff", Map::new());
    queue.enqueue(&job).await.unwrap();
    let consumed = queue.consume("owner", 1000, 1).await.unwrap();
    let message_id = consumed[0].0.clone();

    let running: HashSet<String> = [message_id.clone()].into_iter().collect();
    assert!(queue.claim_pending("owner", 5, &running).await.unwrap().is_empty());
    assert!(queue.touch("owner", &message_id).await.unwrap());

    let claimed = queue.claim_pending("rescuer", 5, &HashSet::new()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].1.job_id, job.job_id);

    queue.ack(&message_id).await.unwrap();
    assert!(!queue.touch("owner", &message_id).await.unwrap());
    queue.clear_dedup(&job).await.unwrap();
}
