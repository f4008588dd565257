//! Inbox activity processing
//!
//! Interprets verified inbound activities and mutates the follower
//! registry. Handshake replies are recorded for asynchronous delivery so a
//! slow or broken remote inbox can never block subscription bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::data::{Database, EntityId, Follower, PendingAccept};
use crate::error::AppError;
use crate::federation::activity::{self, ActivityKind, builder};
use crate::federation::url_guard;
use crate::metrics::FOLLOWERS_TOTAL;

/// Inbox activity processor
///
/// Processes activities whose signature has already been verified.
pub struct InboxProcessor {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    /// Local actor URL
    actor_url: String,
}

impl InboxProcessor {
    /// Create new inbox processor
    pub fn new(db: Arc<Database>, http_client: Arc<reqwest::Client>, actor_url: String) -> Self {
        Self {
            db,
            http_client,
            actor_url,
        }
    }

    /// Process a verified incoming activity
    ///
    /// # Arguments
    /// * `activity` - Raw JSON-LD activity
    /// * `actor_uri` - Verified actor URI (from signature)
    ///
    /// # Side Effects
    /// Follow and Undo(Follow) mutate the follower registry; Follow also
    /// records a pending Accept reply. All other kinds are acknowledged
    /// and ignored.
    pub async fn process(&self, activity: Value, actor_uri: &str) -> Result<(), AppError> {
        match ActivityKind::of(&activity)? {
            ActivityKind::Follow => self.handle_follow(activity, actor_uri).await,
            ActivityKind::Undo => self.handle_undo(activity, actor_uri).await,
            kind => {
                tracing::info!(?kind, actor = %actor_uri, "Ignoring activity without inbox semantics");
                Ok(())
            }
        }
    }

    /// Handle Follow activity (new subscription)
    async fn handle_follow(&self, activity: Value, actor_uri: &str) -> Result<(), AppError> {
        // 1. Verify the Follow targets the local actor.
        let target = activity::follow_target(&activity)?;
        if target.trim_end_matches('/') != self.actor_url.trim_end_matches('/') {
            return Err(AppError::Validation(
                "Follow target is not the local actor".to_string(),
            ));
        }

        // 2. Resolve the follower's inbox for the Accept reply.
        let profile = self.resolve_actor_profile(&activity, actor_uri).await;

        let follow_activity_id = activity::activity_id(&activity)
            .unwrap_or(actor_uri)
            .to_string();

        // 3. Upsert the follower record (repeat Follows do not duplicate).
        let follower = Follower {
            id: EntityId::new().0,
            actor_url: actor_uri.to_string(),
            inbox: profile.inbox.clone(),
            shared_inbox: profile.shared_inbox,
            display_name: profile.display_name,
            follow_activity_id,
            followed_at: Utc::now(),
        };
        self.db.upsert_follower(&follower).await?;

        if let Ok(count) = self.db.follower_count().await {
            FOLLOWERS_TOTAL.set(count);
        }

        // 4. Record the Accept reply for asynchronous delivery.
        let accept_id = format!("{}/accepts/{}", self.actor_url, EntityId::new().0);
        let accept = builder::accept(&accept_id, &self.actor_url, activity);

        let pending = PendingAccept {
            id: EntityId::new().0,
            actor_url: actor_uri.to_string(),
            inbox: profile.inbox,
            payload: serde_json::to_string(&accept)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
            status: "pending".to_string(),
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            delivered_at: None,
        };
        self.db.insert_pending_accept(&pending).await?;

        tracing::info!(
            follower = %actor_uri,
            accept = %accept_id,
            "Follower recorded, Accept queued"
        );

        Ok(())
    }

    /// Handle Undo activity (unsubscribe)
    ///
    /// Absence of a matching follower is not an error.
    async fn handle_undo(&self, activity: Value, actor_uri: &str) -> Result<(), AppError> {
        if !activity::undo_wraps_follow(&activity) {
            tracing::info!(actor = %actor_uri, "Ignoring Undo of a non-Follow activity");
            return Ok(());
        }

        let removed = self.db.remove_follower(actor_uri).await?;
        if removed {
            tracing::info!(follower = %actor_uri, "Follower removed");
        } else {
            tracing::debug!(actor = %actor_uri, "Undo(Follow) for unknown follower");
        }

        if let Ok(count) = self.db.follower_count().await {
            FOLLOWERS_TOTAL.set(count);
        }

        Ok(())
    }

    /// Resolve the follower's inbox and profile details
    ///
    /// Preference order: inbox embedded in the activity's actor object,
    /// then the fetched actor profile, then the conventional
    /// `<actor>/inbox` fallback.
    async fn resolve_actor_profile(&self, activity: &Value, actor_uri: &str) -> ActorProfile {
        if let Some(inbox) = activity::embedded_actor_inbox(activity) {
            let actor = activity.get("actor");
            return ActorProfile {
                inbox,
                shared_inbox: actor.and_then(shared_inbox_of),
                display_name: actor.and_then(display_name_of),
            };
        }

        match self.fetch_actor_document(actor_uri).await {
            Ok(document) => {
                if let Some(inbox) = document.get("inbox").and_then(Value::as_str) {
                    return ActorProfile {
                        inbox: inbox.to_string(),
                        shared_inbox: shared_inbox_of(&document),
                        display_name: display_name_of(&document),
                    };
                }
                tracing::warn!(actor = %actor_uri, "Actor profile has no inbox; using fallback");
            }
            Err(error) => {
                tracing::warn!(
                    actor = %actor_uri,
                    %error,
                    "Failed to fetch actor profile; using fallback inbox"
                );
            }
        }

        ActorProfile {
            inbox: format!("{}/inbox", actor_uri.trim_end_matches('/')),
            shared_inbox: None,
            display_name: None,
        }
    }

    /// Fetch a remote actor document
    async fn fetch_actor_document(&self, actor_uri: &str) -> Result<Value, AppError> {
        url_guard::validate_actor_url(actor_uri)?;

        let response = self
            .http_client
            .get(actor_uri)
            .header("Accept", "application/activity+json, application/ld+json")
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch actor: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch actor: HTTP {}",
                response.status()
            )));
        }

        let document = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

        Ok(document)
    }
}

struct ActorProfile {
    inbox: String,
    shared_inbox: Option<String>,
    display_name: Option<String>,
}

fn shared_inbox_of(actor: &Value) -> Option<String> {
    actor
        .get("endpoints")
        .and_then(|e| e.get("sharedInbox"))
        .or_else(|| actor.get("sharedInbox"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn display_name_of(actor: &Value) -> Option<String> {
    actor
        .get("name")
        .or_else(|| actor.get("preferredUsername"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOCAL_ACTOR: &str = "https://blog.example.com/actor";

    async fn test_processor() -> (InboxProcessor, Arc<Database>, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let http_client = Arc::new(reqwest::Client::new());
        let processor = InboxProcessor::new(db.clone(), http_client, LOCAL_ACTOR.to_string());
        (processor, db, temp_dir)
    }

    fn follow_activity(actor_uri: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": format!("{}/follows/1", actor_uri),
            "actor": {
                "id": actor_uri,
                "inbox": format!("{}/inbox", actor_uri),
                "endpoints": {"sharedInbox": "https://remote.example/inbox"},
                "name": "Alice"
            },
            "object": LOCAL_ACTOR
        })
    }

    #[tokio::test]
    async fn follow_records_follower_and_queues_accept() {
        let (processor, db, _dir) = test_processor().await;
        let actor = "https://remote.example/users/alice";

        processor
            .process(follow_activity(actor), actor)
            .await
            .unwrap();

        let follower = db.get_follower(actor).await.unwrap().unwrap();
        assert_eq!(follower.actor_url, actor);
        assert_eq!(follower.inbox, format!("{}/inbox", actor));
        assert_eq!(
            follower.shared_inbox.as_deref(),
            Some("https://remote.example/inbox")
        );
        assert_eq!(follower.display_name.as_deref(), Some("Alice"));

        let pending = db.list_pending_accepts(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].inbox, format!("{}/inbox", actor));

        let accept: Value = serde_json::from_str(&pending[0].payload).unwrap();
        assert_eq!(accept["type"], "Accept");
        assert_eq!(accept["actor"], LOCAL_ACTOR);
        assert_eq!(accept["object"]["type"], "Follow");
        assert_eq!(accept["object"]["id"], format!("{}/follows/1", actor));
    }

    #[tokio::test]
    async fn repeat_follow_does_not_duplicate_follower() {
        let (processor, db, _dir) = test_processor().await;
        let actor = "https://remote.example/users/alice";

        processor
            .process(follow_activity(actor), actor)
            .await
            .unwrap();
        processor
            .process(follow_activity(actor), actor)
            .await
            .unwrap();

        assert_eq!(db.follower_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn follow_for_other_actor_is_rejected_without_mutation() {
        let (processor, db, _dir) = test_processor().await;
        let actor = "https://remote.example/users/alice";
        let activity = json!({
            "type": "Follow",
            "id": format!("{}/follows/1", actor),
            "actor": actor,
            "object": "https://other.example/actor"
        });

        let result = processor.process(activity, actor).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(db.follower_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn follow_falls_back_to_conventional_inbox() {
        let (processor, db, _dir) = test_processor().await;
        // RFC 6761 reserves .invalid: the profile fetch fails fast and the
        // processor falls back to <actor>/inbox.
        let actor = "https://remote.invalid/users/bob";
        let activity = json!({
            "type": "Follow",
            "id": format!("{}/follows/1", actor),
            "actor": actor,
            "object": LOCAL_ACTOR
        });

        processor.process(activity, actor).await.unwrap();

        let follower = db.get_follower(actor).await.unwrap().unwrap();
        assert_eq!(follower.inbox, format!("{}/inbox", actor));
    }

    #[tokio::test]
    async fn undo_follow_removes_follower_idempotently() {
        let (processor, db, _dir) = test_processor().await;
        let actor = "https://remote.example/users/alice";

        processor
            .process(follow_activity(actor), actor)
            .await
            .unwrap();
        assert_eq!(db.follower_count().await.unwrap(), 1);

        let undo = json!({
            "type": "Undo",
            "id": format!("{}/undos/1", actor),
            "actor": actor,
            "object": {"type": "Follow", "id": format!("{}/follows/1", actor)}
        });

        processor.process(undo.clone(), actor).await.unwrap();
        assert_eq!(db.follower_count().await.unwrap(), 0);

        // Removing an absent follower is not an error.
        processor.process(undo, actor).await.unwrap();
    }

    #[tokio::test]
    async fn undo_of_non_follow_is_ignored() {
        let (processor, db, _dir) = test_processor().await;
        let actor = "https://remote.example/users/alice";

        processor
            .process(follow_activity(actor), actor)
            .await
            .unwrap();

        let undo = json!({
            "type": "Undo",
            "actor": actor,
            "object": {"type": "Like", "id": format!("{}/likes/1", actor)}
        });
        processor.process(undo, actor).await.unwrap();

        assert_eq!(db.follower_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_activity_is_acknowledged_without_mutation() {
        let (processor, db, _dir) = test_processor().await;
        let actor = "https://remote.example/users/alice";

        let activity = json!({
            "type": "Move",
            "actor": actor,
            "object": "https://elsewhere.example/users/alice"
        });
        processor.process(activity, actor).await.unwrap();

        assert_eq!(db.follower_count().await.unwrap(), 0);
        assert!(db.list_pending_accepts(10).await.unwrap().is_empty());
    }
}
