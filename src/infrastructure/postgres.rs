use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Uuid, FromRow, PgPool, Postgres, Row, Transaction};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::domain::{
    entity::{DeadLetter, MessageId, QueueDepth, QueueMessage, ReceiptHandle, RenderJob},
    error::QueueError,
    policy::QueuePolicy,
    repository::{DeadLetterQueue, JobQueue},
};

fn unavailable(context: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |e| QueueError::Unavailable(format!("{}: {}", context, e))
}

fn parse_receipt(receipt: &ReceiptHandle) -> Result<Uuid, QueueError> {
    // A handle we never issued cannot hold a lease.
    receipt.0.parse().map_err(|_| QueueError::Expired)
}

/// Durable queue on PostgreSQL. Leases are rows whose `visible_at` lies in
/// the future; `FOR UPDATE SKIP LOCKED` keeps concurrent receivers from
/// leasing the same row.
#[derive(Clone, Debug)]
pub struct PgJobQueue {
    pool: PgPool,
    policy: QueuePolicy,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, policy: QueuePolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn sweep(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), QueueError> {
        let expired = sqlx::query(
            "DELETE FROM render_queue.messages WHERE enqueued_at < now() - make_interval(secs => $1)",
        )
        .bind(self.policy.message_retention.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(unavailable("PgJobQueue::sweep retention"))?
        .rows_affected();
        if expired > 0 {
            warn!(expired, "discarded messages past retention");
        }

        let moved = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM render_queue.messages
                WHERE id IN (
                    SELECT id FROM render_queue.messages
                    WHERE visible_at <= now() AND receive_count >= $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, body, receive_count, enqueued_at
            )
            INSERT INTO render_queue.dead_letters (id, body, receive_count, enqueued_at)
            SELECT id, body, receive_count, enqueued_at FROM moved
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(self.policy.max_receive_count as i32)
        .execute(&mut *tx)
        .await
        .map_err(unavailable("PgJobQueue::sweep redrive"))?
        .rows_affected();
        if moved > 0 {
            warn!(moved, "moved messages to dead-letter queue");
        }

        sqlx::query(
            "DELETE FROM render_queue.dead_letters WHERE dead_lettered_at < now() - make_interval(secs => $1)",
        )
        .bind(self.policy.dead_letter_retention.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(unavailable("PgJobQueue::sweep dead letters"))?;

        Ok(())
    }

    async fn try_receive(&self, max_batch: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(unavailable("PgJobQueue::receive"))?;

        self.sweep(&mut tx).await?;

        let messages: Vec<QueueMessage> = sqlx::query_as(
            r#"
            UPDATE render_queue.messages
            SET receive_count = receive_count + 1,
                visible_at = now() + make_interval(secs => $1),
                receipt = gen_random_uuid()
            WHERE id IN (
                SELECT id FROM render_queue.messages
                WHERE visible_at <= now()
                ORDER BY enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, body, receive_count, receipt, now() AS received_at
            "#,
        )
        .bind(self.policy.visibility_timeout.as_secs_f64())
        .bind(max_batch as i64)
        .fetch_all(&mut tx)
        .await
        .map_err(unavailable("PgJobQueue::receive"))?;

        tx.commit().await.map_err(unavailable("PgJobQueue::receive"))?;

        Ok(messages)
    }
}

#[async_trait::async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: &RenderJob) -> Result<MessageId, QueueError> {
        let id = Uuid::new_v4();

        sqlx::query("INSERT INTO render_queue.messages (id, body) VALUES ($1, $2)")
            .bind(&id)
            .bind(job.encode()?)
            .execute(&self.pool)
            .await
            .map_err(unavailable("PgJobQueue::enqueue"))?;

        Ok(MessageId(id.to_string()))
    }

    async fn enqueue_batch(&self, jobs: &[RenderJob]) -> Result<Vec<MessageId>, QueueError> {
        let bodies = jobs
            .iter()
            .map(|job| job.encode())
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(unavailable("PgJobQueue::enqueue_batch"))?;

        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            let id = Uuid::new_v4();
            sqlx::query("INSERT INTO render_queue.messages (id, body) VALUES ($1, $2)")
                .bind(&id)
                .bind(body)
                .execute(&mut tx)
                .await
                .map_err(unavailable("PgJobQueue::enqueue_batch"))?;
            ids.push(MessageId(id.to_string()));
        }

        tx.commit()
            .await
            .map_err(unavailable("PgJobQueue::enqueue_batch"))?;

        Ok(ids)
    }

    async fn receive(
        &self,
        max_batch: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let batch = self.try_receive(max_batch).await?;
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                debug!(count = batch.len(), "received messages");
                return Ok(batch);
            }

            sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let receipt = parse_receipt(receipt)?;

        let deleted = sqlx::query(
            "DELETE FROM render_queue.messages WHERE receipt = $1 AND visible_at > now()",
        )
        .bind(&receipt)
        .execute(&self.pool)
        .await
        .map_err(unavailable("PgJobQueue::delete"))?
        .rows_affected();

        if deleted == 0 {
            return Err(QueueError::Expired);
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        duration: Duration,
    ) -> Result<(), QueueError> {
        let receipt = parse_receipt(receipt)?;

        let updated = sqlx::query(
            r#"
            UPDATE render_queue.messages
            SET visible_at = now() + make_interval(secs => $2)
            WHERE receipt = $1 AND visible_at > now()
            "#,
        )
        .bind(&receipt)
        .bind(duration.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(unavailable("PgJobQueue::extend_visibility"))?
        .rows_affected();

        if updated == 0 {
            return Err(QueueError::Expired);
        }
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<QueueDepth, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE visible_at <= now()) AS visible,
                count(*) FILTER (WHERE visible_at > now()) AS in_flight
            FROM render_queue.messages
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable("PgJobQueue::approximate_depth"))?;

        let visible: i64 = row
            .try_get("visible")
            .map_err(unavailable("PgJobQueue::approximate_depth"))?;
        let in_flight: i64 = row
            .try_get("in_flight")
            .map_err(unavailable("PgJobQueue::approximate_depth"))?;

        Ok(QueueDepth {
            visible: visible.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
        })
    }
}

#[async_trait::async_trait]
impl DeadLetterQueue for PgJobQueue {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let letters: Vec<DeadLetter> = sqlx::query_as(
            r#"
            SELECT id, body, receive_count, enqueued_at, dead_lettered_at
            FROM render_queue.dead_letters
            WHERE dead_lettered_at >= now() - make_interval(secs => $1)
            ORDER BY dead_lettered_at
            LIMIT $2
            "#,
        )
        .bind(self.policy.dead_letter_retention.as_secs_f64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("PgJobQueue::dead_letters"))?;

        Ok(letters)
    }

    async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) FROM render_queue.dead_letters
            WHERE dead_lettered_at >= now() - make_interval(secs => $1)
            "#,
        )
        .bind(self.policy.dead_letter_retention.as_secs_f64())
        .map(|row: PgRow| row.get(0))
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable("PgJobQueue::dead_letter_count"))?;

        Ok(count.max(0) as u64)
    }
}

impl FromRow<'_, PgRow> for QueueMessage {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let id: Uuid = row.try_get("id")?;
        let body: String = row.try_get("body")?;
        let receive_count: i32 = row.try_get("receive_count")?;
        let receipt: Uuid = row.try_get("receipt")?;
        let received_at: DateTime<Utc> = row.try_get("received_at")?;

        Ok(Self {
            message_id: MessageId(id.to_string()),
            receipt_handle: ReceiptHandle(receipt.to_string()),
            receive_count: receive_count.max(0) as u32,
            received_at,
            body,
        })
    }
}

impl FromRow<'_, PgRow> for DeadLetter {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let id: Uuid = row.try_get("id")?;
        let body: String = row.try_get("body")?;
        let receive_count: i32 = row.try_get("receive_count")?;
        let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;
        let dead_lettered_at: DateTime<Utc> = row.try_get("dead_lettered_at")?;

        Ok(Self {
            message_id: MessageId(id.to_string()),
            body,
            receive_count: receive_count.max(0) as u32,
            enqueued_at,
            dead_lettered_at,
        })
    }
}
