//! End-to-end scenarios against a real Redis instance. Every test is
//! independent: each flushes the target database before it runs.

use redqueue::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn connect() -> redis::aio::ConnectionManager {
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
    redqueue::connect(redis_url).await.expect("connect to redis")
}

async fn flush(conn: &redis::aio::ConnectionManager) {
    let mut conn = conn.clone();
    let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.expect("flushdb");
}

async fn list_len(conn: &redis::aio::ConnectionManager, key: &str) -> usize {
    let mut conn = conn.clone();
    redis::cmd("LLEN").arg(key).query_async(&mut conn).await.unwrap_or(0)
}

async fn zset_len(conn: &redis::aio::ConnectionManager, key: &str) -> usize {
    let mut conn = conn.clone();
    redis::cmd("ZCARD").arg(key).query_async(&mut conn).await.unwrap_or(0)
}

/// Scenario 1: immediate enqueue, handler succeeds once.
#[tokio::test]
#[ignore = "requires a running redis instance"]
async fn immediate_message_is_handled_exactly_once() {
    let conn = connect().await;
    flush(&conn).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();

    let container: Container<String> = Container::builder(conn.clone())
        .register(
            MappingInfo::new("q1").max_job_execution_time_ms(30_000),
            move |msg: Message<String>| {
                let seen = seen_clone.clone();
                async move {
                    assert_eq!(msg.payload, "A");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .expect("register")
        .build()
        .expect("build");

    let template = MessageTemplate::new(conn.clone(), Default::default());
    let keys = redqueue::keys::QueueKeys::new("q1");
    template.enqueue(&keys, &"A".to_string(), 0).await.expect("enqueue");

    container.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(500)).await;
    container.stop().await.expect("stop");

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(list_len(&conn, &keys.ready_list()).await, 0);
    assert_eq!(zset_len(&conn, &keys.processing_set()).await, 0);
}

/// Scenario 2: delayed delivery timing.
#[tokio::test]
#[ignore = "requires a running redis instance"]
async fn delayed_message_waits_for_its_time() {
    let conn = connect().await;
    flush(&conn).await;

    let template = MessageTemplate::new(conn.clone(), Default::default());
    let keys = redqueue::keys::QueueKeys::new("q1");
    let future = chrono::Utc::now().timestamp_millis() + 2_000;
    template
        .enqueue_at(&keys, &"B".to_string(), future)
        .await
        .expect("enqueue");

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();

    let container: Container<String> = Container::builder(conn.clone())
        .register(
            MappingInfo::new("q1").delayed(true).max_job_execution_time_ms(30_000),
            move |_msg: Message<String>| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .expect("register")
        .build()
        .expect("build");

    container.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(list_len(&conn, &keys.ready_list()).await, 0);
    assert_eq!(zset_len(&conn, &keys.delayed_set()).await, 1);

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    container.stop().await.expect("stop");
}

/// Scenario 3: retries exhausted with a DLQ configured.
#[tokio::test]
#[ignore = "requires a running redis instance"]
async fn exhausted_retries_land_in_the_dead_letter_queue() {
    let conn = connect().await;
    flush(&conn).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let dlq_calls = Arc::new(AtomicUsize::new(0));
    let dlq_calls_clone = dlq_calls.clone();

    let container: Container<String> = Container::builder(conn.clone())
        .register(
            MappingInfo::new("q1")
                .num_retries(2)
                .dead_letter_queue("q1_dlq")
                .max_job_execution_time_ms(30_000),
            move |_msg: Message<String>| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Handler("boom".to_string()))
                }
            },
        )
        .expect("register")
        .with_dead_letter_processor(move |_msg: &Message<String>| {
            let dlq_calls = dlq_calls_clone.clone();
            Box::pin(async move {
                dlq_calls.fetch_add(1, Ordering::SeqCst);
            }) as futures::future::BoxFuture<'static, ()>
        })
        .build()
        .expect("build");

    let template = MessageTemplate::new(conn.clone(), Default::default());
    let keys = redqueue::keys::QueueKeys::new("q1");
    template.enqueue(&keys, &"C".to_string(), 0).await.expect("enqueue");

    container.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    container.stop().await.expect("stop");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(dlq_calls.load(Ordering::SeqCst), 1);
    assert_eq!(list_len(&conn, "q1_dlq").await, 1);
}

/// Scenario 4: a handler that outlives its visibility timeout gets
/// rediscovered by the reaper and retried with an incremented retry count.
#[tokio::test]
#[ignore = "requires a running redis instance"]
async fn visibility_timeout_recovers_a_stuck_message() {
    let conn = connect().await;
    flush(&conn).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let container: Container<String> = Container::builder(conn.clone())
        .register(
            MappingInfo::new("q1").num_retries(3).max_job_execution_time_ms(1_000),
            move |_msg: Message<String>| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        // Outlive the deadline on the first attempt only.
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(())
                }
            },
        )
        .expect("register")
        .build()
        .expect("build");

    let template = MessageTemplate::new(conn.clone(), Default::default());
    let keys = redqueue::keys::QueueKeys::new("q1");
    let id = template.enqueue(&keys, &"D".to_string(), 0).await.expect("enqueue");

    container.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    container.stop().await.expect("stop");

    assert!(attempts.load(Ordering::SeqCst) >= 2);
    let meta = template.fetch_meta(&id).await.expect("fetch_meta");
    if let Some(msg) = meta {
        assert!(msg.retry_count >= 1);
    }
}

/// Scenario 5: retries exhausted with no DLQ configured.
#[tokio::test]
#[ignore = "requires a running redis instance"]
async fn exhausted_retries_without_a_dlq_are_discarded() {
    let conn = connect().await;
    flush(&conn).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let discard_calls = Arc::new(AtomicUsize::new(0));
    let discard_calls_clone = discard_calls.clone();

    let container: Container<String> = Container::builder(conn.clone())
        .register(
            MappingInfo::new("q1").num_retries(1).max_job_execution_time_ms(30_000),
            move |_msg: Message<String>| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Handler("boom".to_string()))
                }
            },
        )
        .expect("register")
        .with_discard_processor(move |_msg: &Message<String>| {
            let discard_calls = discard_calls_clone.clone();
            Box::pin(async move {
                discard_calls.fetch_add(1, Ordering::SeqCst);
            }) as futures::future::BoxFuture<'static, ()>
        })
        .build()
        .expect("build");

    let template = MessageTemplate::new(conn.clone(), Default::default());
    let keys = redqueue::keys::QueueKeys::new("q1");
    template.enqueue(&keys, &"E".to_string(), 0).await.expect("enqueue");

    container.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    container.stop().await.expect("stop");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(discard_calls.load(Ordering::SeqCst), 1);
    assert_eq!(list_len(&conn, &keys.ready_list()).await, 0);
    assert_eq!(zset_len(&conn, &keys.processing_set()).await, 0);
}

/// Scenario 6: bulk throughput with a bounded worker pool.
#[tokio::test]
#[ignore = "requires a running redis instance"]
async fn bulk_enqueue_drains_completely_under_a_bounded_pool() {
    let conn = connect().await;
    flush(&conn).await;

    const TOTAL: usize = 1_000;
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = handled.clone();

    let container: Container<usize> = Container::builder(conn.clone())
        .register(
            MappingInfo::new("q1").max_job_execution_time_ms(30_000),
            move |_msg: Message<usize>| {
                let handled = handled_clone.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .expect("register")
        .configure(|c| c.max_num_workers(8))
        .build()
        .expect("build");

    let template = MessageTemplate::new(conn.clone(), Default::default());
    let keys = redqueue::keys::QueueKeys::new("q1");
    for i in 0..TOTAL {
        template.enqueue(&keys, &i, 0).await.expect("enqueue");
    }

    container.start().await.expect("start");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while handled.load(Ordering::SeqCst) < TOTAL && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    container.stop().await.expect("stop");

    assert_eq!(handled.load(Ordering::SeqCst), TOTAL);
    assert_eq!(list_len(&conn, &keys.ready_list()).await, 0);
    assert_eq!(zset_len(&conn, &keys.delayed_set()).await, 0);
    assert_eq!(zset_len(&conn, &keys.processing_set()).await, 0);
}
