//! Activity document model
//!
//! Inbound protocol messages are JSON-LD documents keyed by `type`. This
//! module gives them a closed sum type plus the small set of field
//! accessors the processor needs, and builds the outbound Accept document.

use serde_json::Value;

use crate::error::AppError;

/// ActivityStreams JSON-LD context
pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Media type for federation requests and responses
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Known activity kinds
///
/// Unknown kinds are explicitly acknowledged-and-ignored rather than
/// silently mishandled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityKind {
    /// Subscription request
    Follow,
    /// Retraction of a prior activity (only Undo(Follow) is acted on)
    Undo,
    /// Handshake reply
    Accept,
    /// Published content
    Create,
    /// Anything else
    Unknown(String),
}

impl ActivityKind {
    /// Parse activity kind from the `type` field
    pub fn from_type(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Undo" => Self::Undo,
            "Accept" => Self::Accept,
            "Create" => Self::Create,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Parse activity kind from a full activity document
    pub fn of(activity: &Value) -> Result<Self, AppError> {
        let type_str = activity
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;

        Ok(Self::from_type(type_str))
    }
}

/// Extract the actor URL (string form or embedded object's `id`)
pub fn actor_url(activity: &Value) -> Option<&str> {
    let actor = activity.get("actor")?;
    actor
        .as_str()
        .or_else(|| actor.get("id").and_then(|id| id.as_str()))
}

/// Extract the activity id
pub fn activity_id(activity: &Value) -> Option<&str> {
    activity.get("id").and_then(|id| id.as_str())
}

/// Extract an inbox URL embedded in the activity's actor object, if any
pub fn embedded_actor_inbox(activity: &Value) -> Option<String> {
    activity
        .get("actor")?
        .get("inbox")?
        .as_str()
        .map(str::to_string)
}

/// Extract the Follow target (the followed actor's URL)
pub fn follow_target(activity: &Value) -> Result<String, AppError> {
    let object = activity
        .get("object")
        .ok_or_else(|| AppError::Validation("Missing object in Follow".to_string()))?;

    object
        .as_str()
        .or_else(|| object.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Invalid object in Follow".to_string()))
}

/// Return true when an Undo wraps a Follow
///
/// A plain string object is accepted too: some servers send the Follow
/// activity URI instead of embedding the document.
pub fn undo_wraps_follow(activity: &Value) -> bool {
    let Some(object) = activity.get("object") else {
        return false;
    };

    if object.is_string() {
        return true;
    }

    object
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("Follow"))
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    use super::ACTIVITYSTREAMS_CONTEXT;

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }
}
