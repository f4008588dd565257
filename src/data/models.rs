//! Data models
//!
//! Rust structs representing database entities and queue messages.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Follower
// =============================================================================

/// A remote actor subscribed to the local actor
///
/// Created on a verified Follow; removed on a verified Undo(Follow).
/// At most one record exists per actor URL.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub id: String,
    /// Canonical actor URL (unique key)
    pub actor_url: String,
    /// Personal inbox URL
    pub inbox: String,
    /// Shared inbox URL, when the actor's server advertises one
    pub shared_inbox: Option<String>,
    pub display_name: Option<String>,
    /// ID of the Follow activity that created this record
    pub follow_activity_id: String,
    pub followed_at: DateTime<Utc>,
}

// =============================================================================
// Pending handshake (Accept)
// =============================================================================

/// A queued Accept reply for a verified Follow
///
/// Transitions pending -> delivered or pending -> failed.
/// Never mutated once delivered.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingAccept {
    pub id: String,
    /// Actor the Accept is addressed to
    pub actor_url: String,
    /// Inbox the Accept will be POSTed to
    pub inbox: String,
    /// Serialized Accept activity
    pub payload: String,
    /// pending, delivered or failed
    pub status: String,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Delivery status
// =============================================================================

/// Terminal and in-flight state of one (activity, destination) delivery
///
/// Upserted after every attempt. `version` is the optimistic concurrency
/// token; concurrent writers must read-modify-write against it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryStatus {
    pub activity_id: String,
    pub target_inbox: String,
    pub follower_actor: String,
    /// pending, delivered or failed
    pub status: String,
    pub attempt_count: i64,
    pub last_http_status: Option<i64>,
    pub last_error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// Delivery state values shared by `delivery_status` and `pending_accepts`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

// =============================================================================
// Delivery queue
// =============================================================================

/// A new delivery task ready to be enqueued
#[derive(Debug, Clone)]
pub struct NewDeliveryTask {
    pub activity_id: String,
    /// Activity payload, serialized once at planning time
    pub activity_json: String,
    pub target_inbox: String,
    pub follower_actor: String,
}

/// A leased delivery task pulled from the queue
///
/// Consumed at least once; redelivered by the visibility mechanism
/// unless acked.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedTask {
    pub id: String,
    pub activity_id: String,
    pub activity_json: String,
    pub target_inbox: String,
    pub follower_actor: String,
    /// Delivery attempts recorded by workers
    pub attempt_count: i64,
    /// Times this task has been dequeued (bounds redelivery)
    pub delivery_count: i64,
    pub enqueued_at: DateTime<Utc>,
}
