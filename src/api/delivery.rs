//! Delivery trigger endpoint
//!
//! The publishing pipeline calls POST /trigger-delivery after a build to
//! fan newly published activities out to followers. The call only plans
//! and enqueues; it never blocks on remote delivery.

use axum::{Router, extract::State, response::Json, routing::post};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::federation::{FanoutPlanner, FanoutSummary};
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

/// Create delivery trigger router
pub fn delivery_router() -> Router<AppState> {
    Router::new().route("/trigger-delivery", post(trigger_delivery))
}

/// Request body for POST /trigger-delivery
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    #[serde(default)]
    activity_ids: Vec<String>,
}

/// Response body: the fan-out summary
#[derive(Debug, Serialize)]
struct TriggerResponse {
    success: bool,
    #[serde(flatten)]
    summary: FanoutSummary,
}

/// POST /trigger-delivery
///
/// Enqueues one delivery task per (activity, follower) pair and returns a
/// summary of what was queued and skipped. Planning failures abort the
/// whole call; individual delivery failures are handled asynchronously by
/// the worker and never surface here.
async fn trigger_delivery(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/trigger-delivery"])
        .start_timer();

    let planner = FanoutPlanner::new(
        state.db.clone(),
        state.queue.clone(),
        state.config.fanout.clone(),
    );

    let summary = planner.plan(&request.activity_ids).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/trigger-delivery", "200"])
        .inc();

    Ok(Json(TriggerResponse {
        success: true,
        summary,
    }))
}
