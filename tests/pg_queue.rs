//! Runs against the database named by `DATABASE_URL`; each test gets a
//! fresh database with the crate's migrations applied.

use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio::time::{sleep, Instant};

use render_queue::domain::entity::{QueueDepth, RenderJob};
use render_queue::domain::error::QueueError;
use render_queue::domain::policy::QueuePolicy;
use render_queue::domain::repository::{DeadLetterQueue, JobQueue};
use render_queue::infrastructure::postgres::PgJobQueue;

const VISIBILITY: Duration = Duration::from_millis(500);

fn policy() -> QueuePolicy {
    QueuePolicy {
        max_receive_count: 3,
        visibility_timeout: VISIBILITY,
        poll_interval: Duration::from_millis(50),
        ..QueuePolicy::default()
    }
}

fn job(number: &str) -> RenderJob {
    RenderJob::new("invoice-v1".to_string(), json!({ "number": number }))
}

async fn expire_lease() {
    sleep(VISIBILITY + Duration::from_millis(150)).await;
}

#[sqlx::test(migrations = "./migrations")]
async fn received_message_is_hidden_until_timeout(pool: PgPool) {
    let queue = PgJobQueue::new(pool, policy());
    let id = queue.enqueue(&job("INV-1")).await.unwrap();

    let first = queue.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].message_id, id);
    assert_eq!(first[0].receive_count, 1);
    assert_eq!(first[0].job().unwrap().payload["number"], "INV-1");

    assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
    assert_eq!(
        queue.approximate_depth().await.unwrap(),
        QueueDepth { visible: 0, in_flight: 1 }
    );

    expire_lease().await;
    let second = queue.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, id);
    assert_eq!(second[0].receive_count, 2);
    assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
}

#[sqlx::test(migrations = "./migrations")]
async fn stale_receipt_is_expired(pool: PgPool) {
    let queue = PgJobQueue::new(pool, policy());
    queue.enqueue(&job("INV-2")).await.unwrap();

    let first = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
    expire_lease().await;

    // Lapsed but not yet redelivered.
    assert!(matches!(
        queue.extend_visibility(&first.receipt_handle, VISIBILITY).await,
        Err(QueueError::Expired)
    ));

    let second = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
    assert!(matches!(
        queue.delete(&first.receipt_handle).await,
        Err(QueueError::Expired)
    ));

    queue
        .extend_visibility(&second.receipt_handle, VISIBILITY)
        .await
        .unwrap();
    queue.delete(&second.receipt_handle).await.unwrap();
    assert_eq!(queue.approximate_depth().await.unwrap().total(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn zero_extension_hands_the_message_back(pool: PgPool) {
    let queue = PgJobQueue::new(pool, policy());
    queue.enqueue(&job("INV-3")).await.unwrap();

    let first = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
    queue
        .extend_visibility(&first.receipt_handle, Duration::ZERO)
        .await
        .unwrap();

    let again = queue.receive(1, Duration::ZERO).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].receive_count, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn redrives_after_max_receive_count(pool: PgPool) {
    let queue = PgJobQueue::new(pool, policy());
    let id = queue.enqueue(&job("INV-4")).await.unwrap();

    let mut counts = Vec::new();
    for _ in 0..5 {
        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        counts.extend(batch.iter().map(|m| m.receive_count));
        expire_lease().await;
    }
    // The sweep runs on receive.
    assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());

    assert_eq!(counts, vec![1, 2, 3]);
    assert_eq!(queue.dead_letter_count().await.unwrap(), 1);

    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, id);
    assert_eq!(dead[0].receive_count, 3);
    assert_eq!(dead[0].job().unwrap().payload["number"], "INV-4");
    assert_eq!(queue.approximate_depth().await.unwrap().total(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn retention_discards_stale_messages(pool: PgPool) {
    let queue = PgJobQueue::new(
        pool,
        QueuePolicy {
            message_retention: Duration::from_millis(300),
            ..policy()
        },
    );
    queue.enqueue(&job("INV-5")).await.unwrap();

    sleep(Duration::from_millis(400)).await;
    assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
    assert_eq!(queue.approximate_depth().await.unwrap().total(), 0);
    assert_eq!(queue.dead_letter_count().await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn batch_is_delivered_in_order(pool: PgPool) {
    let queue = PgJobQueue::new(pool, policy());
    let jobs: Vec<_> = (0..5).map(|i| job(&format!("INV-{}", i))).collect();

    let ids = queue.enqueue_batch(&jobs).await.unwrap();
    assert_eq!(ids.len(), 5);

    let received = queue.receive(10, Duration::ZERO).await.unwrap();
    let received_ids: Vec<_> = received.iter().map(|m| m.message_id.clone()).collect();
    assert_eq!(received_ids, ids);
}

#[sqlx::test(migrations = "./migrations")]
async fn batch_is_all_or_nothing(pool: PgPool) {
    sqlx::query(
        r#"
        CREATE FUNCTION render_queue.reject_poison() RETURNS trigger AS $$
        BEGIN
            IF NEW.body LIKE '%poison%' THEN
                RAISE EXCEPTION 'rejected';
            END IF;
            RETURN NEW;
        END
        $$ LANGUAGE plpgsql
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_poison BEFORE INSERT ON render_queue.messages \
         FOR EACH ROW EXECUTE FUNCTION render_queue.reject_poison()",
    )
    .execute(&pool)
    .await
    .unwrap();

    let queue = PgJobQueue::new(pool, policy());
    let jobs = vec![job("INV-6"), job("poison"), job("INV-7")];

    let err = queue.enqueue_batch(&jobs).await.unwrap_err();
    assert!(matches!(err, QueueError::Unavailable(_)));
    assert_eq!(queue.approximate_depth().await.unwrap().total(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn long_poll_returns_when_a_message_arrives(pool: PgPool) {
    let queue = PgJobQueue::new(pool, policy());

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            queue.enqueue(&job("INV-8")).await.unwrap();
        })
    };

    let started = Instant::now();
    let batch = queue.receive(10, Duration::from_secs(5)).await.unwrap();
    producer.await.unwrap();

    assert_eq!(batch.len(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_receivers_never_share_a_message(pool: PgPool) {
    let queue = PgJobQueue::new(pool, policy());
    let jobs: Vec<_> = (0..10).map(|i| job(&format!("INV-{}", i))).collect();
    queue.enqueue_batch(&jobs).await.unwrap();

    let receivers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(3, Duration::ZERO).await.unwrap() })
        })
        .collect();

    let mut seen = Vec::new();
    for receiver in receivers {
        seen.extend(receiver.await.unwrap().into_iter().map(|m| m.message_id));
    }
    let total = seen.len();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    seen.dedup();
    assert_eq!(seen.len(), total);
    assert_eq!(total, 10);
}
