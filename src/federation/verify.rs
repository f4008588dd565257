//! Inbound request verification pipeline
//!
//! Ordered checks over a signed inbound request, short-circuiting on the
//! first failure: body digest, Date window, then HTTP signature against a
//! freshly fetched public key. Every failure is an authentication
//! rejection; nothing is partially accepted.
//!
//! Public keys are deliberately fetched per verification. Caching remote
//! key material would let a poisoned or stale entry authenticate requests
//! long after the remote key rotated.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderMap;

use crate::error::AppError;
use crate::federation::signature::{
    REQUEST_TARGET, build_signing_string, parse_signature_header, verify_digest,
    verify_signature_bytes,
};
use crate::federation::url_guard;

/// Extract the actor URL from a keyId (the portion before any fragment)
pub fn extract_actor_url(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Validate that a signature keyId points to the same actor as the activity actor
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    extract_actor_url(key_id) == extract_actor_url(actor_id)
}

/// Extract keyId from the Signature header
pub fn extract_signature_key_id(headers: &HeaderMap) -> Result<String, AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::Authentication("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Authentication("Invalid Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;
    Ok(parsed.key_id)
}

/// Fetch the signing actor's public key from its profile document
///
/// The actor host is validated against the destination guard before any
/// request leaves the process. No caching: the key is fetched fresh for
/// every verification.
///
/// # Arguments
/// * `key_id` - Full URL to the key (e.g., actor#main-key)
/// * `http_client` - HTTP client
///
/// # Returns
/// PEM-encoded public key
pub async fn fetch_public_key(
    key_id: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    let actor_url = extract_actor_url(key_id);
    url_guard::validate_actor_url(actor_url)
        .map_err(|e| AppError::Authentication(e.to_string()))?;

    // Fetch actor document
    let response = http_client
        .get(actor_url)
        .header("Accept", "application/activity+json, application/ld+json")
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| AppError::Authentication(format!("Failed to fetch actor: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Authentication(format!(
            "Failed to fetch actor: HTTP {}",
            response.status()
        )));
    }

    let actor: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::Authentication(format!("Failed to parse actor: {}", e)))?;

    let public_key = actor
        .get("publicKey")
        .ok_or_else(|| AppError::Authentication("Missing publicKey in actor".to_string()))?;

    // If a key fragment is provided, ensure actor advertises exactly that key id.
    if key_id.contains('#') {
        let advertised_key_id = public_key
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                AppError::Authentication("Missing publicKey.id in actor".to_string())
            })?;

        if advertised_key_id != key_id {
            return Err(AppError::Authentication(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }
    }

    let public_key_pem = public_key
        .get("publicKeyPem")
        .and_then(|pem| pem.as_str())
        .ok_or_else(|| AppError::Authentication("Missing publicKeyPem in actor".to_string()))?;

    Ok(public_key_pem.to_string())
}

/// Verify a signed inbound request
///
/// # Checks, in order, short-circuiting on first failure
/// 1. Digest header (when present) matches the exact received body bytes,
///    using the algorithm named in the header.
/// 2. Date header parses and lies within `date_window_seconds` of now in
///    either direction.
/// 3. Signature header parses; the reconstructed signing string verifies
///    against the supplied public key.
///
/// # Errors
/// `AppError::Authentication` on any parse or verification failure.
pub fn verify_inbound_request(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    public_key_pem: &str,
    date_window_seconds: i64,
) -> Result<(), AppError> {
    // 1. Verify Digest against the exact received bytes, when present.
    let digest_header = match headers.get("digest") {
        Some(value) => {
            let digest_str = value
                .to_str()
                .map_err(|_| AppError::Authentication("Invalid Digest header".to_string()))?;
            verify_digest(digest_str, body)?;
            Some(digest_str)
        }
        None => None,
    };

    // 2. Verify Date is within the replay window.
    let date_header = headers
        .get("date")
        .ok_or_else(|| AppError::Authentication("Missing Date header".to_string()))?;
    let date_str = date_header
        .to_str()
        .map_err(|_| AppError::Authentication("Invalid Date header".to_string()))?;

    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Authentication("Invalid Date format".to_string()))?;

    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > date_window_seconds {
        return Err(AppError::Authentication(
            "Date header too old or in future".to_string(),
        ));
    }

    // 3. Parse and verify the signature itself.
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::Authentication("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Authentication("Invalid Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Authentication(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in [REQUEST_TARGET, "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Authentication(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    // A Digest header that is not covered by the signature does not bind
    // the body to anything; reject it.
    if digest_header.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Authentication(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let signing_string = build_signing_string(method, path, headers, &parsed.headers)?;

    let signature = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Authentication("Invalid signature encoding".to_string()))?;

    verify_signature_bytes(&signing_string, &signature, public_key_pem)
}
