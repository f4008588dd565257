//! Federation module
//!
//! Handles:
//! - HTTP Signatures (signing string, Signature/Digest headers)
//! - Inbound request verification
//! - Inbox activity processing
//! - Activity delivery and fan-out planning
//! - Destination URL validation (SSRF)

mod activity;
mod delivery;
mod inbox;
mod signature;
mod signer;
mod url_guard;
mod verify;

pub use activity::{
    ACTIVITY_CONTENT_TYPE, ACTIVITYSTREAMS_CONTEXT, ActivityKind, actor_url, builder,
};
pub use delivery::{
    DeliveryOutcome, DeliveryWorker, FanoutPlanner, FanoutSummary, WorkerStats, classify_response,
};
pub use inbox::InboxProcessor;
pub use signature::{
    ParsedSignature, SignatureHeaders, build_digest, build_signing_string, parse_signature_header,
    sign_request, verify_digest, verify_signature_bytes,
};
pub use signer::{LocalKeySigner, Signer};
pub use url_guard::{validate_actor_url, validate_inbox_url};
pub use verify::{
    extract_actor_url, extract_signature_key_id, fetch_public_key, key_id_matches_actor,
    verify_inbound_request,
};
