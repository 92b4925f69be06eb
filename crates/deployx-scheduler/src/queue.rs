//! Dispatch queue carrying job-execution requests to workers.
//!
//! Delivery is at-least-once: a delivery stays owned by the queue until it is
//! acked, and the PostgreSQL queue hands out claims that were never acked
//! again once their visibility timeout passes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use deployx_core::{JobId, PipelineId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Everything a worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub repository_url: String,
    pub command: String,
    pub branch: String,
    pub commit_id: Option<String>,
}

/// A payload handed to one worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub payload: JobPayload,
    /// How many times this entry has been handed out, including this one.
    pub attempts: i32,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn submit(&self, payload: &JobPayload) -> QueueResult<()>;

    /// Take the next available delivery, if any. Does not wait.
    async fn receive(&self, worker_id: &str) -> QueueResult<Option<Delivery>>;

    /// Remove a delivery for good.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Hand a delivery back so it becomes available again after `delay`.
    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    payload: sqlx::types::Json<JobPayload>,
    attempts: i32,
}

impl From<QueueRow> for Delivery {
    fn from(row: QueueRow) -> Self {
        Delivery {
            id: row.id,
            payload: row.payload.0,
            attempts: row.attempts,
        }
    }
}

/// Job queue backed by PostgreSQL.
pub struct PgDispatchQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgDispatchQueue {
    /// `visibility_timeout` bounds how long a claim may go unacked before the
    /// entry is handed to another worker.
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl DispatchQueue for PgDispatchQueue {
    async fn submit(&self, payload: &JobPayload) -> QueueResult<()> {
        let body = serde_json::to_value(payload)?;
        sqlx::query(
            r#"
            INSERT INTO job_queue (id, job_id, payload, status, attempts, available_at, created_at)
            VALUES ($1, $2, $3, 'pending', 0, NOW(), NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(payload.job_id.as_uuid())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim the next available entry.
    /// Uses SKIP LOCKED so concurrent workers never block on each other.
    async fn receive(&self, worker_id: &str) -> QueueResult<Option<Delivery>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE job_queue
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM job_queue
                WHERE (status = 'pending' AND available_at <= NOW())
                   OR (status = 'claimed' AND claimed_at < NOW() - make_interval(secs => $2))
                ORDER BY available_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(worker_id)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                available_at = NOW() + make_interval(secs => $2)
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<Delivery>,
    delayed: Vec<(Instant, Delivery)>,
    in_flight: HashMap<Uuid, Delivery>,
}

impl MemoryQueueState {
    fn promote_due(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        self.ready.extend(due.into_iter().map(|(_, d)| d));
    }
}

/// In-process FIFO queue for single-node and test setups.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries not yet acked, whether ready, delayed or in flight.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len() + state.in_flight.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    async fn submit(&self, payload: &JobPayload) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.ready.push_back(Delivery {
            id: Uuid::now_v7(),
            payload: payload.clone(),
            attempts: 0,
        });
        Ok(())
    }

    async fn receive(&self, _worker_id: &str) -> QueueResult<Option<Delivery>> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());
        let Some(mut delivery) = state.ready.pop_front() else {
            return Ok(None);
        };
        delivery.attempts += 1;
        state.in_flight.insert(delivery.id, delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .in_flight
            .remove(&delivery.id)
            .ok_or(QueueError::UnknownDelivery(delivery.id))?;
        if delay.is_zero() {
            state.ready.push_back(entry);
        } else {
            state.delayed.push((Instant::now() + delay, entry));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(command: &str) -> JobPayload {
        JobPayload {
            job_id: JobId::new(),
            pipeline_id: PipelineId::new(),
            repository_url: "https://git.example.com/app.git".to_string(),
            command: command.to_string(),
            branch: "main".to_string(),
            commit_id: None,
        }
    }

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        queue.submit(&payload("first")).await.unwrap();
        queue.submit(&payload("second")).await.unwrap();

        let a = queue.receive("w1").await.unwrap().unwrap();
        let b = queue.receive("w2").await.unwrap().unwrap();
        assert_eq!(a.payload.command, "first");
        assert_eq!(b.payload.command, "second");
        assert!(queue.receive("w1").await.unwrap().is_none());

        queue.ack(&a).await.unwrap();
        queue.ack(&b).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_after_delay() {
        let queue = MemoryQueue::new();
        queue.submit(&payload("only")).await.unwrap();

        let first = queue.receive("w1").await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        queue
            .requeue(&first, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(queue.receive("w1").await.unwrap().is_none());
        assert_eq!(queue.len().await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = queue.receive("w1").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn test_requeue_unknown_delivery() {
        let queue = MemoryQueue::new();
        let stray = Delivery {
            id: Uuid::now_v7(),
            payload: payload("x"),
            attempts: 1,
        };
        let err = queue.requeue(&stray, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownDelivery(_)));
    }

    #[test]
    fn test_payload_wire_format() {
        let p = payload("npm test");
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["command"], "npm test");
        assert_eq!(value["repositoryUrl"], "https://git.example.com/app.git");
        assert!(value["commitId"].is_null());
        assert_eq!(value["jobId"], p.job_id.to_string());
    }
}
