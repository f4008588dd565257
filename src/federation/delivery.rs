//! Activity delivery
//!
//! The delivery worker drains the durable queue, signs and POSTs each
//! activity to its destination inbox, classifies the outcome and updates
//! the delivery status store. The fan-out planner turns one published
//! activity into one queue task per follower.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::{DeliveryConfig, FanoutConfig};
use crate::data::{
    Database, DeliveryQueue, DeliveryState, DeliveryStatus, NewDeliveryTask, PendingAccept,
    QueuedTask,
};
use crate::error::AppError;
use crate::federation::activity::ACTIVITY_CONTENT_TYPE;
use crate::federation::signature::sign_request;
use crate::federation::signer::Signer;
use crate::federation::url_guard::validate_inbox_url;
use crate::metrics::{
    DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS, FANOUT_TASKS_QUEUED_TOTAL, QUEUE_DEPTH,
};

/// Maximum local retries for an optimistic-concurrency status update
const MAX_STATUS_UPDATE_RETRIES: u32 = 3;

/// Maximum characters of a remote error kept in the status store
const MAX_ERROR_CHARS: usize = 1000;

/// Classified result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx: recorded as delivered, task removed from the queue
    Delivered { status: u16 },
    /// 4xx except 429, or a rejected/malformed destination: recorded,
    /// task removed, never retried
    Permanent { status: Option<u16>, error: String },
    /// 429, 5xx, network error or timeout: recorded, left for queue
    /// redelivery
    Transient { status: Option<u16>, error: String },
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Permanent { .. } => "permanent_failure",
            Self::Transient { .. } => "transient_failure",
        }
    }
}

/// Classify an HTTP response from a remote inbox
pub fn classify_response(status: u16, body: &str) -> DeliveryOutcome {
    if (200..300).contains(&status) {
        return DeliveryOutcome::Delivered { status };
    }

    let error = truncate_error(&format!("HTTP {}: {}", status, body));
    if (400..500).contains(&status) && status != 429 {
        DeliveryOutcome::Permanent {
            status: Some(status),
            error,
        }
    } else {
        DeliveryOutcome::Transient {
            status: Some(status),
            error,
        }
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        return message.to_string();
    }
    let truncated: String = message.chars().take(MAX_ERROR_CHARS).collect();
    format!("{}...[truncated]", truncated)
}

/// Delivery worker
///
/// Pulls leased batches from the queue and drives signed deliveries with
/// bounded concurrency. A second pass drains pending Accept replies
/// through the same signing and classification path.
#[derive(Clone)]
pub struct DeliveryWorker {
    db: Arc<Database>,
    queue: DeliveryQueue,
    http_client: Arc<reqwest::Client>,
    signer: Arc<dyn Signer>,
    config: DeliveryConfig,
    user_agent: String,
}

/// Counters from one worker run
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub delivered: usize,
    pub permanent_failures: usize,
    pub transient_failures: usize,
    pub accepts_delivered: usize,
    pub accepts_failed: usize,
    pub accepts_retried: usize,
}

impl DeliveryWorker {
    /// Create new delivery worker
    pub fn new(
        db: Arc<Database>,
        queue: DeliveryQueue,
        http_client: Arc<reqwest::Client>,
        signer: Arc<dyn Signer>,
        config: DeliveryConfig,
        user_agent: String,
    ) -> Self {
        Self {
            db,
            queue,
            http_client,
            signer,
            config,
            user_agent,
        }
    }

    /// Run one worker pass: a bounded queue batch, then pending Accepts
    pub async fn run_once(&self) -> Result<WorkerStats, AppError> {
        let tasks = self.queue.lease_batch(self.config.batch_size).await?;
        let mut stats = WorkerStats::default();

        if !tasks.is_empty() {
            tracing::info!(count = tasks.len(), "Processing leased delivery tasks");

            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
            let mut handles = Vec::with_capacity(tasks.len());

            for task in tasks {
                let semaphore = semaphore.clone();
                let worker = self.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore open");
                    worker.process_task(task).await
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(DeliveryOutcome::Delivered { .. }) => stats.delivered += 1,
                    Ok(DeliveryOutcome::Permanent { .. }) => stats.permanent_failures += 1,
                    Ok(DeliveryOutcome::Transient { .. }) => stats.transient_failures += 1,
                    Err(error) => {
                        tracing::error!(%error, "Delivery task panicked");
                    }
                }
            }
        }

        self.process_pending_accepts(&mut stats).await?;

        if let Ok(depth) = self.queue.depth().await {
            QUEUE_DEPTH.set(depth);
        }

        tracing::info!(
            delivered = stats.delivered,
            permanent = stats.permanent_failures,
            transient = stats.transient_failures,
            accepts_delivered = stats.accepts_delivered,
            "Worker run complete"
        );

        Ok(stats)
    }

    /// Process one leased task end to end
    ///
    /// Never returns an error: every failure mode is classified and
    /// recorded so one broken destination cannot take down the batch.
    async fn process_task(&self, task: QueuedTask) -> DeliveryOutcome {
        // (a) Destination validation: a disallowed URL is permanent.
        if let Err(error) = validate_inbox_url(&task.target_inbox) {
            tracing::warn!(inbox = %task.target_inbox, %error, "Dropping task for disallowed inbox");
            return self
                .finish_permanent(&task, None, &error.to_string())
                .await;
        }

        // (b) Malformed stored payload is permanent.
        if let Err(error) = serde_json::from_str::<serde_json::Value>(&task.activity_json) {
            tracing::error!(activity = %task.activity_id, %error, "Dropping task with malformed payload");
            return self
                .finish_permanent(&task, None, &format!("Malformed activity JSON: {}", error))
                .await;
        }

        // (c) Sign and send the stored bytes exactly as queued.
        let timer = DELIVERY_DURATION_SECONDS
            .with_label_values(&["activity"])
            .start_timer();
        let response = self
            .post_signed(&task.target_inbox, task.activity_json.as_bytes())
            .await;
        timer.observe_duration();

        // (d) Classify and record.
        let outcome = match response {
            Ok((status, body)) => classify_response(status, &body),
            Err(error) => DeliveryOutcome::Transient {
                status: None,
                error: truncate_error(&error),
            },
        };
        DELIVERIES_TOTAL.with_label_values(&[outcome.label()]).inc();

        let attempt_count = task.attempt_count + 1;
        match &outcome {
            DeliveryOutcome::Delivered { status } => {
                tracing::info!(
                    inbox = %task.target_inbox,
                    activity = %task.activity_id,
                    status,
                    "Delivery successful"
                );
                self.record_attempt(
                    &task,
                    DeliveryState::Delivered,
                    attempt_count,
                    Some(i64::from(*status)),
                    None,
                )
                .await;
                self.ack_quietly(&task).await;
            }
            DeliveryOutcome::Permanent { status, error } => {
                tracing::error!(
                    inbox = %task.target_inbox,
                    activity = %task.activity_id,
                    %error,
                    "Permanent delivery failure"
                );
                self.record_attempt(
                    &task,
                    DeliveryState::Failed,
                    attempt_count,
                    status.map(i64::from),
                    Some(error.as_str()),
                )
                .await;
                self.ack_quietly(&task).await;
            }
            DeliveryOutcome::Transient { status, error } => {
                tracing::warn!(
                    inbox = %task.target_inbox,
                    activity = %task.activity_id,
                    %error,
                    "Transient delivery failure, leaving task for redelivery"
                );
                self.record_attempt(
                    &task,
                    DeliveryState::Pending,
                    attempt_count,
                    status.map(i64::from),
                    Some(error.as_str()),
                )
                .await;
                if let Err(error) = self
                    .queue
                    .release_for_retry(&task.id, attempt_count)
                    .await
                {
                    tracing::error!(%error, task = %task.id, "Failed to release task for retry");
                }
            }
        }

        outcome
    }

    async fn finish_permanent(
        &self,
        task: &QueuedTask,
        status: Option<u16>,
        error: &str,
    ) -> DeliveryOutcome {
        DELIVERIES_TOTAL
            .with_label_values(&["permanent_failure"])
            .inc();
        self.record_attempt(
            task,
            DeliveryState::Failed,
            task.attempt_count + 1,
            status.map(i64::from),
            Some(error),
        )
        .await;
        self.ack_quietly(task).await;

        DeliveryOutcome::Permanent {
            status,
            error: error.to_string(),
        }
    }

    async fn ack_quietly(&self, task: &QueuedTask) {
        if let Err(error) = self.queue.ack(&task.id).await {
            tracing::error!(%error, task = %task.id, "Failed to ack delivery task");
        }
    }

    /// Sign and POST a payload to a remote inbox
    ///
    /// The digest and signature cover `body` exactly; the same buffer is
    /// handed to the HTTP client unmodified.
    ///
    /// # Returns
    /// HTTP status and a size-capped response body excerpt, or the
    /// network error message.
    async fn post_signed(&self, inbox_url: &str, body: &[u8]) -> Result<(u16, String), String> {
        let sig_headers =
            sign_request("POST", inbox_url, Some(body), self.signer.as_ref())
                .map_err(|e| format!("Failed to sign request: {}", e))?;

        let mut request = self
            .http_client
            .post(inbox_url)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature)
            .header("User-Agent", &self.user_agent)
            .timeout(std::time::Duration::from_secs(
                self.config.request_timeout_seconds,
            ));

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let mut response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        let status = response.status().as_u16();

        // Cap how much of the response we read; the excerpt only feeds
        // error records.
        let mut excerpt = Vec::new();
        while let Ok(Some(chunk)) = response.chunk().await {
            let remaining = self.config.max_response_bytes.saturating_sub(excerpt.len());
            if remaining == 0 {
                break;
            }
            excerpt.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        }

        Ok((status, String::from_utf8_lossy(&excerpt).into_owned()))
    }

    /// Upsert the delivery status row for one attempt
    ///
    /// Read-modify-write guarded by the row's version token; retried with
    /// a fresh read on conflict so racing workers never clobber each
    /// other's attempt counts.
    async fn record_attempt(
        &self,
        task: &QueuedTask,
        state: DeliveryState,
        attempt_count: i64,
        last_http_status: Option<i64>,
        last_error: Option<&str>,
    ) {
        if let Err(error) = self
            .upsert_status(task, state, attempt_count, last_http_status, last_error)
            .await
        {
            tracing::error!(
                %error,
                activity = %task.activity_id,
                inbox = %task.target_inbox,
                "Failed to record delivery status"
            );
        }
    }

    async fn upsert_status(
        &self,
        task: &QueuedTask,
        state: DeliveryState,
        attempt_count: i64,
        last_http_status: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<(), AppError> {
        let delivered_at = match state {
            DeliveryState::Delivered => Some(Utc::now()),
            _ => None,
        };

        for _ in 0..MAX_STATUS_UPDATE_RETRIES {
            match self
                .db
                .get_delivery_status(&task.activity_id, &task.target_inbox)
                .await?
            {
                None => {
                    let status = DeliveryStatus {
                        activity_id: task.activity_id.clone(),
                        target_inbox: task.target_inbox.clone(),
                        follower_actor: task.follower_actor.clone(),
                        status: state.as_str().to_string(),
                        attempt_count,
                        last_http_status,
                        last_error: last_error.map(str::to_string),
                        last_attempt_at: Utc::now(),
                        delivered_at,
                        version: 1,
                    };
                    if self.db.insert_delivery_status(&status).await? {
                        return Ok(());
                    }
                    // Lost the insert race; re-read and update instead.
                }
                Some(existing) => {
                    // The row's own counter wins over the task's view so
                    // racing workers cannot undercount attempts.
                    let updated = self
                        .db
                        .update_delivery_status(
                            &task.activity_id,
                            &task.target_inbox,
                            state,
                            existing.attempt_count + 1,
                            last_http_status,
                            last_error,
                            delivered_at.or(existing.delivered_at),
                            existing.version,
                        )
                        .await?;
                    if updated {
                        return Ok(());
                    }
                    // Version moved under us; re-read and retry.
                }
            }
        }

        Err(AppError::Conflict(format!(
            "Delivery status update for {} -> {} kept conflicting",
            task.activity_id, task.target_inbox
        )))
    }

    /// Drain pending Accept replies
    ///
    /// Same destination validation, signing and classification as content
    /// deliveries; retry bookkeeping lives on the pending row itself.
    async fn process_pending_accepts(&self, stats: &mut WorkerStats) -> Result<(), AppError> {
        let pending = self
            .db
            .list_pending_accepts(self.config.batch_size)
            .await?;

        for accept in pending {
            self.process_accept(&accept, stats).await;
        }

        Ok(())
    }

    async fn process_accept(&self, accept: &PendingAccept, stats: &mut WorkerStats) {
        if let Err(error) = validate_inbox_url(&accept.inbox) {
            tracing::warn!(inbox = %accept.inbox, %error, "Dropping Accept for disallowed inbox");
            if let Err(error) = self.db.mark_accept_failed(&accept.id).await {
                tracing::error!(%error, accept = %accept.id, "Failed to mark Accept failed");
            }
            stats.accepts_failed += 1;
            return;
        }

        let timer = DELIVERY_DURATION_SECONDS
            .with_label_values(&["accept"])
            .start_timer();
        let response = self
            .post_signed(&accept.inbox, accept.payload.as_bytes())
            .await;
        timer.observe_duration();

        let outcome = match response {
            Ok((status, body)) => classify_response(status, &body),
            Err(error) => DeliveryOutcome::Transient {
                status: None,
                error: truncate_error(&error),
            },
        };
        DELIVERIES_TOTAL.with_label_values(&[outcome.label()]).inc();

        let result = match outcome {
            DeliveryOutcome::Delivered { status } => {
                tracing::info!(inbox = %accept.inbox, status, "Accept delivered");
                stats.accepts_delivered += 1;
                self.db.mark_accept_delivered(&accept.id).await
            }
            DeliveryOutcome::Permanent { error, .. } => {
                tracing::error!(inbox = %accept.inbox, %error, "Accept permanently rejected");
                stats.accepts_failed += 1;
                self.db.mark_accept_failed(&accept.id).await
            }
            DeliveryOutcome::Transient { error, .. } => {
                tracing::warn!(inbox = %accept.inbox, %error, "Accept delivery failed, will retry");
                match self.db.bump_accept_retry(&accept.id).await {
                    Ok(retries) if retries >= self.config.max_delivery_count => {
                        tracing::error!(
                            accept = %accept.id,
                            retries,
                            "Accept retries exhausted"
                        );
                        stats.accepts_failed += 1;
                        self.db.mark_accept_failed(&accept.id).await
                    }
                    Ok(_) => {
                        stats.accepts_retried += 1;
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
        };

        if let Err(error) = result {
            tracing::error!(%error, accept = %accept.id, "Failed to update Accept status");
        }
    }
}

// =============================================================================
// Fan-out planner
// =============================================================================

/// Summary returned by the publish trigger
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutSummary {
    pub total_followers: usize,
    pub activities_processed: usize,
    pub tasks_queued: usize,
    pub skipped: usize,
}

/// Fan-out planner
///
/// Resolves published activities from the outbox document and enqueues
/// one delivery task per follower. Planning and delivery are independent
/// failure domains: a planner error aborts the publish, while
/// per-destination delivery failures never do.
pub struct FanoutPlanner {
    db: Arc<Database>,
    queue: DeliveryQueue,
    config: FanoutConfig,
}

impl FanoutPlanner {
    /// Create new fan-out planner
    pub fn new(db: Arc<Database>, queue: DeliveryQueue, config: FanoutConfig) -> Self {
        Self { db, queue, config }
    }

    /// Queue delivery tasks for the given published activity ids
    ///
    /// Followers whose inbox fails validation are skipped with a warning,
    /// never queued. Activities missing from the outbox are skipped too.
    pub async fn plan(&self, activity_ids: &[String]) -> Result<FanoutSummary, AppError> {
        if activity_ids.is_empty() {
            return Err(AppError::Validation(
                "activityIds array is required and must not be empty".to_string(),
            ));
        }

        let followers = self.db.list_followers().await?;
        let mut summary = FanoutSummary {
            total_followers: followers.len(),
            ..FanoutSummary::default()
        };

        if followers.is_empty() {
            tracing::info!("No followers to deliver to");
            return Ok(summary);
        }

        let outbox = self.load_outbox()?;

        for activity_id in activity_ids {
            let Some(activity) = find_outbox_activity(&outbox, activity_id) else {
                tracing::warn!(activity = %activity_id, "Activity not found in outbox");
                continue;
            };

            // Serialize once; every task carries the same exact bytes.
            let activity_json = serde_json::to_string(activity)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            summary.activities_processed += 1;

            for follower in &followers {
                if let Err(error) = validate_inbox_url(&follower.inbox) {
                    tracing::warn!(
                        follower = %follower.actor_url,
                        inbox = %follower.inbox,
                        %error,
                        "Skipping follower with invalid inbox"
                    );
                    FANOUT_TASKS_QUEUED_TOTAL
                        .with_label_values(&["skipped"])
                        .inc();
                    summary.skipped += 1;
                    continue;
                }

                self.queue
                    .enqueue(&NewDeliveryTask {
                        activity_id: activity_id.clone(),
                        activity_json: activity_json.clone(),
                        target_inbox: follower.inbox.clone(),
                        follower_actor: follower.actor_url.clone(),
                    })
                    .await?;
                FANOUT_TASKS_QUEUED_TOTAL
                    .with_label_values(&["queued"])
                    .inc();
                summary.tasks_queued += 1;
            }

            tracing::info!(
                activity = %activity_id,
                queued = summary.tasks_queued,
                "Queued delivery tasks"
            );
        }

        Ok(summary)
    }

    /// Load the outbox document produced by the publishing pipeline
    fn load_outbox(&self) -> Result<serde_json::Value, AppError> {
        let raw = std::fs::read_to_string(&self.config.outbox_path).map_err(|e| {
            AppError::Federation(format!(
                "Failed to read outbox {}: {}",
                self.config.outbox_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&raw)
            .map_err(|e| AppError::Federation(format!("Failed to parse outbox: {}", e)))
    }
}

/// Find an activity in the outbox by its id or its object's id
fn find_outbox_activity<'a>(
    outbox: &'a serde_json::Value,
    activity_id: &str,
) -> Option<&'a serde_json::Value> {
    outbox
        .get("orderedItems")?
        .as_array()?
        .iter()
        .find(|item| {
            item.get("id").and_then(|id| id.as_str()) == Some(activity_id)
                || item
                    .get("object")
                    .and_then(|o| o.get("id"))
                    .and_then(|id| id.as_str())
                    == Some(activity_id)
        })
}
