//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub inbox (federation)
//! - Delivery trigger (publishing pipeline)
//! - Metrics (Prometheus)

mod delivery;
mod inbox;
pub mod metrics;

pub use delivery::delivery_router;
pub use inbox::inbox_router;
pub use metrics::metrics_router;
