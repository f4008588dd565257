//! Data layer module
//!
//! Handles all data persistence:
//! - Follower registry, pending handshakes and delivery status (SQLite)
//! - Durable delivery queue

mod database;
mod models;
mod queue;

pub use database::Database;
pub use models::*;
pub use queue::DeliveryQueue;
