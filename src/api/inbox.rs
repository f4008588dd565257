//! ActivityPub inbox endpoint
//!
//! - POST /inbox - activity receiving
//! - GET /inbox - empty collection (inbound timelines are out of scope)

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use http::HeaderMap;

use crate::AppState;
use crate::error::AppError;
use crate::metrics::{
    ACTIVITIES_RECEIVED_TOTAL, HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL,
};

/// Create inbox router
///
/// Routes:
/// - POST /inbox - receive one activity per call
/// - GET /inbox - empty OrderedCollection
pub fn inbox_router() -> Router<AppState> {
    Router::new().route("/inbox", post(post_inbox).get(get_inbox))
}

/// GET /inbox
///
/// Inbound content is not retained, so the collection is always empty.
async fn get_inbox(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "@context": crate::federation::ACTIVITYSTREAMS_CONTEXT,
        "id": format!("{}/inbox", state.config.server.base_url()),
        "type": "OrderedCollection",
        "totalItems": 0,
        "orderedItems": []
    }))
}

/// POST /inbox
///
/// Receives one incoming activity per call.
///
/// # Steps
/// 1. Verify the HTTP signature, digest and timestamp (all-or-nothing)
/// 2. Parse the activity
/// 3. Process based on type
///
/// # Responses
/// - 202 accepted (including unknown activity types)
/// - 400 malformed body
/// - 401 signature/digest/timestamp invalid
async fn post_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    // Start timing the request
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/inbox"])
        .start_timer();

    // Reject unsigned requests immediately.
    if headers.get("signature").is_none() {
        return Err(AppError::Authentication(
            "Missing Signature header".to_string(),
        ));
    }

    // Parse the activity to get the actor.
    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let actor_id = crate::federation::actor_url(&activity)
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?
        .to_string();

    // Ensure keyId points to the same actor before fetching remote key material.
    let signature_key_id = crate::federation::extract_signature_key_id(&headers)?;
    if !crate::federation::key_id_matches_actor(&signature_key_id, &actor_id) {
        return Err(AppError::Authentication(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    // Fetch the actor's public key (validated host, no caching) and verify
    // digest, timestamp and signature in one short-circuiting pass.
    let public_key_pem =
        crate::federation::fetch_public_key(&signature_key_id, state.http_client.as_ref()).await?;

    crate::federation::verify_inbound_request(
        "POST",
        "/inbox",
        &headers,
        &body,
        &public_key_pem,
        state.config.verification.date_window_seconds,
    )?;

    // Record activity type
    if let Some(activity_type) = activity.get("type").and_then(|t| t.as_str()) {
        ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[activity_type])
            .inc();
    }

    // Process the activity
    let processor = crate::federation::InboxProcessor::new(
        state.db.clone(),
        state.http_client.clone(),
        state.config.actor.url.clone(),
    );

    processor.process(activity, &actor_id).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/inbox", "202"])
        .inc();

    Ok(StatusCode::ACCEPTED)
}
