//! SQLite database operations
//!
//! All database access goes through this module.
//! Holds the follower registry, the pending handshake table and the
//! delivery status store.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Shared connection pool (used by the delivery queue).
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    // =========================================================================
    // Follower registry
    // =========================================================================

    /// Create or update a follower record
    ///
    /// Keyed by actor URL; repeat Follows update the mutable fields and
    /// never create a second row. The original `followed_at` is kept.
    pub async fn upsert_follower(&self, follower: &Follower) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO followers (
                id, actor_url, inbox, shared_inbox, display_name,
                follow_activity_id, followed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor_url) DO UPDATE SET
                inbox = excluded.inbox,
                shared_inbox = COALESCE(excluded.shared_inbox, followers.shared_inbox),
                display_name = COALESCE(excluded.display_name, followers.display_name),
                follow_activity_id = excluded.follow_activity_id
            "#,
        )
        .bind(&follower.id)
        .bind(&follower.actor_url)
        .bind(&follower.inbox)
        .bind(&follower.shared_inbox)
        .bind(&follower.display_name)
        .bind(&follower.follow_activity_id)
        .bind(follower.followed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a follower
    ///
    /// # Returns
    /// `true` if a record was removed, `false` if none existed.
    pub async fn remove_follower(&self, actor_url: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM followers WHERE actor_url = ?")
            .bind(actor_url)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a follower by actor URL
    pub async fn get_follower(&self, actor_url: &str) -> Result<Option<Follower>, AppError> {
        let follower =
            sqlx::query_as::<_, Follower>("SELECT * FROM followers WHERE actor_url = ?")
                .bind(actor_url)
                .fetch_optional(&self.pool)
                .await?;

        Ok(follower)
    }

    /// List all followers, oldest first
    pub async fn list_followers(&self) -> Result<Vec<Follower>, AppError> {
        let followers =
            sqlx::query_as::<_, Follower>("SELECT * FROM followers ORDER BY followed_at ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(followers)
    }

    /// Record a shared inbox discovered for an existing follower
    ///
    /// # Returns
    /// `true` if the follower existed and was updated.
    pub async fn set_shared_inbox(
        &self,
        actor_url: &str,
        shared_inbox: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE followers SET shared_inbox = ? WHERE actor_url = ?")
            .bind(shared_inbox)
            .bind(actor_url)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count followers
    pub async fn follower_count(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM followers")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Pending handshakes (Accept replies)
    // =========================================================================

    /// Record an Accept reply awaiting delivery
    pub async fn insert_pending_accept(&self, accept: &PendingAccept) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO pending_accepts (
                id, actor_url, inbox, payload, status, retry_count,
                created_at, updated_at, delivered_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&accept.id)
        .bind(&accept.actor_url)
        .bind(&accept.inbox)
        .bind(&accept.payload)
        .bind(&accept.status)
        .bind(accept.retry_count)
        .bind(accept.created_at)
        .bind(accept.updated_at)
        .bind(accept.delivered_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List pending Accept replies, oldest first
    pub async fn list_pending_accepts(&self, limit: u32) -> Result<Vec<PendingAccept>, AppError> {
        let accepts = sqlx::query_as::<_, PendingAccept>(
            "SELECT * FROM pending_accepts WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(accepts)
    }

    /// Mark an Accept as delivered
    pub async fn mark_accept_delivered(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE pending_accepts
            SET status = 'delivered', delivered_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark an Accept as permanently failed
    pub async fn mark_accept_failed(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE pending_accepts SET status = 'failed', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Increment the retry count of a pending Accept
    ///
    /// # Returns
    /// The new retry count.
    pub async fn bump_accept_retry(&self, id: &str) -> Result<i64, AppError> {
        sqlx::query(
            "UPDATE pending_accepts SET retry_count = retry_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let count = sqlx::query_scalar::<_, i64>(
            "SELECT retry_count FROM pending_accepts WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // =========================================================================
    // Delivery status store
    // =========================================================================

    /// Get delivery status for one (activity, destination) pair
    pub async fn get_delivery_status(
        &self,
        activity_id: &str,
        target_inbox: &str,
    ) -> Result<Option<DeliveryStatus>, AppError> {
        let status = sqlx::query_as::<_, DeliveryStatus>(
            "SELECT * FROM delivery_status WHERE activity_id = ? AND target_inbox = ?",
        )
        .bind(activity_id)
        .bind(target_inbox)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    /// Insert a fresh delivery status row
    ///
    /// # Returns
    /// `false` when a row for the pair already exists (a concurrent writer
    /// won the insert race); the caller should re-read and update instead.
    pub async fn insert_delivery_status(&self, status: &DeliveryStatus) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_status (
                activity_id, target_inbox, follower_actor, status, attempt_count,
                last_http_status, last_error, last_attempt_at, delivered_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(activity_id, target_inbox) DO NOTHING
            "#,
        )
        .bind(&status.activity_id)
        .bind(&status.target_inbox)
        .bind(&status.follower_actor)
        .bind(&status.status)
        .bind(status.attempt_count)
        .bind(status.last_http_status)
        .bind(&status.last_error)
        .bind(status.last_attempt_at)
        .bind(status.delivered_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Update a delivery status row, guarded by its version token
    ///
    /// # Returns
    /// `false` when the version no longer matches (a concurrent writer got
    /// there first); the caller should re-read and retry.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_delivery_status(
        &self,
        activity_id: &str,
        target_inbox: &str,
        state: DeliveryState,
        attempt_count: i64,
        last_http_status: Option<i64>,
        last_error: Option<&str>,
        delivered_at: Option<DateTime<Utc>>,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_status
            SET status = ?, attempt_count = ?, last_http_status = ?, last_error = ?,
                last_attempt_at = ?, delivered_at = ?, version = version + 1
            WHERE activity_id = ? AND target_inbox = ? AND version = ?
            "#,
        )
        .bind(state.as_str())
        .bind(attempt_count)
        .bind(last_http_status)
        .bind(last_error)
        .bind(Utc::now())
        .bind(delivered_at)
        .bind(activity_id)
        .bind(target_inbox)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> (Database, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();
        (db, temp_dir)
    }

    fn follower(actor_url: &str) -> Follower {
        Follower {
            id: EntityId::new().0,
            actor_url: actor_url.to_string(),
            inbox: format!("{}/inbox", actor_url),
            shared_inbox: None,
            display_name: None,
            follow_activity_id: "https://remote.example/follows/1".to_string(),
            followed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_follower_is_idempotent() {
        let (db, _dir) = test_db().await;
        let actor = "https://remote.example/users/alice";

        db.upsert_follower(&follower(actor)).await.unwrap();
        db.upsert_follower(&follower(actor)).await.unwrap();

        assert_eq!(db.follower_count().await.unwrap(), 1);
        let stored = db.get_follower(actor).await.unwrap().unwrap();
        assert_eq!(stored.actor_url, actor);
    }

    #[tokio::test]
    async fn upsert_follower_preserves_known_shared_inbox() {
        let (db, _dir) = test_db().await;
        let actor = "https://remote.example/users/alice";

        let mut first = follower(actor);
        first.shared_inbox = Some("https://remote.example/inbox".to_string());
        db.upsert_follower(&first).await.unwrap();

        // Repeat Follow without shared inbox information must not erase it.
        db.upsert_follower(&follower(actor)).await.unwrap();

        let stored = db.get_follower(actor).await.unwrap().unwrap();
        assert_eq!(
            stored.shared_inbox.as_deref(),
            Some("https://remote.example/inbox")
        );
    }

    #[tokio::test]
    async fn remove_follower_reports_not_found_without_error() {
        let (db, _dir) = test_db().await;

        let removed = db
            .remove_follower("https://remote.example/users/ghost")
            .await
            .unwrap();
        assert!(!removed);

        db.upsert_follower(&follower("https://remote.example/users/alice"))
            .await
            .unwrap();
        let removed = db
            .remove_follower("https://remote.example/users/alice")
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(db.follower_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_shared_inbox_updates_existing_follower() {
        let (db, _dir) = test_db().await;
        let actor = "https://remote.example/users/alice";
        db.upsert_follower(&follower(actor)).await.unwrap();

        let updated = db
            .set_shared_inbox(actor, "https://remote.example/inbox")
            .await
            .unwrap();
        assert!(updated);

        let missing = db
            .set_shared_inbox("https://remote.example/users/ghost", "https://x.example")
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn pending_accept_lifecycle() {
        let (db, _dir) = test_db().await;

        let accept = PendingAccept {
            id: EntityId::new().0,
            actor_url: "https://remote.example/users/alice".to_string(),
            inbox: "https://remote.example/users/alice/inbox".to_string(),
            payload: r#"{"type":"Accept"}"#.to_string(),
            status: "pending".to_string(),
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            delivered_at: None,
        };
        db.insert_pending_accept(&accept).await.unwrap();

        let pending = db.list_pending_accepts(10).await.unwrap();
        assert_eq!(pending.len(), 1);

        let retries = db.bump_accept_retry(&accept.id).await.unwrap();
        assert_eq!(retries, 1);

        db.mark_accept_delivered(&accept.id).await.unwrap();
        assert!(db.list_pending_accepts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_status_version_guard_rejects_stale_writers() {
        let (db, _dir) = test_db().await;

        let status = DeliveryStatus {
            activity_id: "https://blog.example.com/notes/1".to_string(),
            target_inbox: "https://remote.example/inbox".to_string(),
            follower_actor: "https://remote.example/users/alice".to_string(),
            status: "pending".to_string(),
            attempt_count: 1,
            last_http_status: Some(503),
            last_error: Some("HTTP 503".to_string()),
            last_attempt_at: Utc::now(),
            delivered_at: None,
            version: 1,
        };
        assert!(db.insert_delivery_status(&status).await.unwrap());
        // Second insert for the same pair loses the race.
        assert!(!db.insert_delivery_status(&status).await.unwrap());

        let stored = db
            .get_delivery_status(&status.activity_id, &status.target_inbox)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);

        // Update with the current version succeeds and bumps the token.
        let updated = db
            .update_delivery_status(
                &status.activity_id,
                &status.target_inbox,
                DeliveryState::Pending,
                2,
                Some(503),
                Some("HTTP 503"),
                None,
                stored.version,
            )
            .await
            .unwrap();
        assert!(updated);

        // A writer still holding the old version is rejected.
        let stale = db
            .update_delivery_status(
                &status.activity_id,
                &status.target_inbox,
                DeliveryState::Delivered,
                3,
                Some(200),
                None,
                Some(Utc::now()),
                stored.version,
            )
            .await
            .unwrap();
        assert!(!stale);

        let stored = db
            .get_delivery_status(&status.activity_id, &status.target_inbox)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.status, "pending");
    }
}
