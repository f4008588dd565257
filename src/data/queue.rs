//! Durable delivery queue
//!
//! At-least-once message queue decoupling "an activity must be fanned out"
//! from "N individual deliveries happened". Backed by the same SQLite
//! database as the rest of the data layer.
//!
//! A dequeued task is leased: it becomes invisible for the visibility
//! timeout and reappears for another worker unless acked. Redelivery is
//! bounded by a max delivery count, after which the task is moved to the
//! dead-letter table for operator attention.

use chrono::{Duration, Utc};
use sqlx::{Pool, Sqlite};

use super::models::{EntityId, NewDeliveryTask, QueuedTask};
use crate::error::AppError;

/// Durable at-least-once delivery queue
#[derive(Clone)]
pub struct DeliveryQueue {
    pool: Pool<Sqlite>,
    visibility_timeout: Duration,
    max_delivery_count: i64,
}

impl DeliveryQueue {
    /// Create a queue over an existing connection pool
    pub fn new(pool: Pool<Sqlite>, visibility_timeout_seconds: i64, max_delivery_count: i64) -> Self {
        Self {
            pool,
            visibility_timeout: Duration::seconds(visibility_timeout_seconds),
            max_delivery_count,
        }
    }

    /// Enqueue one delivery task
    pub async fn enqueue(&self, task: &NewDeliveryTask) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO delivery_queue (
                id, activity_id, activity_json, target_inbox, follower_actor,
                attempt_count, delivery_count, enqueued_at, visible_at
            ) VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(&task.activity_id)
        .bind(&task.activity_json)
        .bind(&task.target_inbox)
        .bind(&task.follower_actor)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lease a batch of due tasks
    ///
    /// Leased tasks become invisible for the visibility timeout. Tasks that
    /// have exhausted their delivery count are moved to the dead-letter
    /// table instead of being returned.
    pub async fn lease_batch(&self, limit: u32) -> Result<Vec<QueuedTask>, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Dead-letter exhausted tasks before handing anything out.
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, activity_id, activity_json, target_inbox, follower_actor,
                attempt_count, delivery_count, enqueued_at, dead_lettered_at
            )
            SELECT id, activity_id, activity_json, target_inbox, follower_actor,
                   attempt_count, delivery_count, enqueued_at, ?
            FROM delivery_queue
            WHERE visible_at <= ? AND delivery_count >= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(self.max_delivery_count)
        .execute(&mut *tx)
        .await?;

        let dead = sqlx::query(
            "DELETE FROM delivery_queue WHERE visible_at <= ? AND delivery_count >= ?",
        )
        .bind(now)
        .bind(self.max_delivery_count)
        .execute(&mut *tx)
        .await?;

        if dead.rows_affected() > 0 {
            tracing::warn!(
                count = dead.rows_affected(),
                "Moved exhausted delivery tasks to the dead-letter table"
            );
        }

        let mut tasks = sqlx::query_as::<_, QueuedTask>(
            "SELECT * FROM delivery_queue WHERE visible_at <= ? ORDER BY enqueued_at ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let lease_until = now + self.visibility_timeout;
        for task in &mut tasks {
            sqlx::query(
                "UPDATE delivery_queue SET visible_at = ?, delivery_count = delivery_count + 1 WHERE id = ?",
            )
            .bind(lease_until)
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;
            task.delivery_count += 1;
        }

        tx.commit().await?;

        Ok(tasks)
    }

    /// Remove a task after successful processing (or permanent failure)
    pub async fn ack(&self, task_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_queue WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record a transient failure on a leased task
    ///
    /// Updates the attempt count; the lease is left to lapse so the queue
    /// redelivers the task after the visibility timeout.
    pub async fn release_for_retry(&self, task_id: &str, attempt_count: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE delivery_queue SET attempt_count = ? WHERE id = ?")
            .bind(attempt_count)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Number of tasks currently in the queue (visible or leased)
    pub async fn depth(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delivery_queue")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Number of dead-lettered tasks
    pub async fn dead_letter_count(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;

    async fn test_queue(visibility_seconds: i64, max_delivery_count: i64) -> (DeliveryQueue, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();
        (
            DeliveryQueue::new(db.pool(), visibility_seconds, max_delivery_count),
            temp_dir,
        )
    }

    fn task(activity_id: &str, inbox: &str) -> NewDeliveryTask {
        NewDeliveryTask {
            activity_id: activity_id.to_string(),
            activity_json: r#"{"type":"Create"}"#.to_string(),
            target_inbox: inbox.to_string(),
            follower_actor: "https://remote.example/users/alice".to_string(),
        }
    }

    #[tokio::test]
    async fn leased_tasks_are_invisible_until_acked() {
        let (queue, _dir) = test_queue(60, 5).await;
        queue
            .enqueue(&task("https://a.example/1", "https://remote.example/inbox"))
            .await
            .unwrap();

        let leased = queue.lease_batch(10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].delivery_count, 1);

        // Leased task is invisible to a second worker.
        assert!(queue.lease_batch(10).await.unwrap().is_empty());

        queue.ack(&leased[0].id).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lapsed_lease_is_redelivered() {
        let (queue, _dir) = test_queue(0, 5).await;
        queue
            .enqueue(&task("https://a.example/1", "https://remote.example/inbox"))
            .await
            .unwrap();

        let first = queue.lease_batch(10).await.unwrap();
        assert_eq!(first.len(), 1);

        // Zero visibility: the same task comes straight back.
        let second = queue.lease_batch(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn exhausted_tasks_move_to_dead_letters() {
        let (queue, _dir) = test_queue(0, 2).await;
        queue
            .enqueue(&task("https://a.example/1", "https://remote.example/inbox"))
            .await
            .unwrap();

        assert_eq!(queue.lease_batch(10).await.unwrap().len(), 1);
        assert_eq!(queue.lease_batch(10).await.unwrap().len(), 1);

        // Third pull: delivery count has reached the bound.
        assert!(queue.lease_batch(10).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.dead_letter_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_for_retry_records_attempts() {
        let (queue, _dir) = test_queue(0, 5).await;
        queue
            .enqueue(&task("https://a.example/1", "https://remote.example/inbox"))
            .await
            .unwrap();

        let leased = queue.lease_batch(10).await.unwrap();
        queue
            .release_for_retry(&leased[0].id, leased[0].attempt_count + 1)
            .await
            .unwrap();

        let again = queue.lease_batch(10).await.unwrap();
        assert_eq!(again[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn batch_size_is_bounded() {
        let (queue, _dir) = test_queue(60, 5).await;
        for i in 0..5 {
            queue
                .enqueue(&task(
                    &format!("https://a.example/{}", i),
                    "https://remote.example/inbox",
                ))
                .await
                .unwrap();
        }

        let leased = queue.lease_batch(3).await.unwrap();
        assert_eq!(leased.len(), 3);
    }
}
