use std::time::Duration;

use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

use crate::tests::containers::RedisContext;
use crate::workflows::engine::ExecutionTask;
use crate::workflows::queue::QueueDepth;
use crate::workflows::triggers::ChangeEvent;
use crate::workflows::{Broker, RedisBroker};

async fn broker(ctx: &RedisContext) -> RedisBroker {
    let broker = RedisBroker::connect(&ctx.url, &ctx.queue_name())
        .await
        .expect("Failed to connect to test redis");
    broker.declare().await.expect("Failed to ping test redis");
    broker
}

fn task() -> ExecutionTask {
    ExecutionTask::new(Uuid::new_v4(), ChangeEvent::manual(Uuid::new_v4(), json!({ "n": 1 })))
}

#[tokio::test]
#[serial]
async fn test_redis_late_ack_does_not_release_new_lease() {
    let ctx = RedisContext::new();
    let broker = broker(&ctx).await;
    let task = task();
    broker.enqueue(&task).await.unwrap();

    // The first consumer's lease expires before it finishes.
    let slow = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(broker.requeue_expired().await.unwrap(), 1);
    let fresh = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(fresh.task.task_id, task.task_id);
    assert_eq!(fresh.task.attempt, 1);
    assert_ne!(fresh.receipt, slow.receipt);

    broker.ack(&slow.receipt).await.unwrap();
    assert_eq!(broker.depth().await.unwrap(), QueueDepth { pending: 0, in_flight: 1 });

    // The second consumer dies too: the task must come back.
    assert_eq!(broker.requeue_expired().await.unwrap(), 1);
    let last = broker.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(last.task.task_id, task.task_id);
    assert_eq!(last.task.attempt, 2);

    broker.ack(&last.receipt).await.unwrap();
    assert_eq!(broker.depth().await.unwrap(), QueueDepth::default());
}

#[tokio::test]
#[serial]
async fn test_redis_queue_is_fifo_and_purge_counts_leased_tasks() {
    let ctx = RedisContext::new();
    let broker = broker(&ctx).await;
    let first = task();
    let second = task();
    broker.enqueue(&first).await.unwrap();
    broker.enqueue(&second).await.unwrap();

    let leased = broker.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(leased.task.task_id, first.task_id);
    assert_eq!(leased.task.attempt, 0);
    assert_eq!(broker.requeue_expired().await.unwrap(), 0);
    assert_eq!(broker.depth().await.unwrap(), QueueDepth { pending: 1, in_flight: 1 });

    assert_eq!(broker.purge().await.unwrap(), 2);
    assert_eq!(broker.depth().await.unwrap(), QueueDepth::default());
    broker.ack(&leased.receipt).await.unwrap();
}
