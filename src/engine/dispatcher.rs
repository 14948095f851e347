//! Send Queue Dispatcher: drains due queue entries through the provider.
//!
//! Entries are processed one at a time, oldest first. Each attempt is
//! claimed by incrementing `attempts` before anything is sent, so the count
//! is an upper bound on sends even across crashes. Whatever goes wrong while
//! preparing or performing a send counts as a failed attempt and follows the
//! [`RetryPolicy`]. After every batch the [`CompletionMonitor`] closes out
//! drained runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::completion::CompletionMonitor;
use super::lifecycle::PollTask;
use super::retry::RetryPolicy;
use crate::events::{self, EventSink};
use crate::provider::{render, MessageProvider, ProviderError, TemplateError};
use crate::store::{QueueEntry, Store, StoreError};

/// Why one send attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Account or campaign could not be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The template could not be rendered for this recipient.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The provider rejected the send or could not be reached.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The sending account belongs to a different organization.
    #[error("account {account_id} does not belong to org {org_id}")]
    AccountMismatch {
        /// Account on the entry.
        account_id: String,
        /// Organization on the entry.
        org_id: String,
    },
}

/// What one dispatcher cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Entries fetched.
    pub processed: u32,
    /// Entries the provider accepted.
    pub sent: u32,
    /// Entries parked for a retry.
    pub retried: u32,
    /// Entries finalized as failed.
    pub failed: u32,
    /// Entries another dispatcher claimed first, or whose outcome could not
    /// be recorded.
    pub skipped: u32,
    /// Runs the completion pass finalized.
    pub completed_runs: u32,
}

/// Outcome of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Sent,
    Retrying,
    Failed,
    Skipped,
}

/// Polls the send queue and performs sends.
pub struct QueueDispatcher {
    store: Store,
    provider: Arc<dyn MessageProvider>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    batch_size: u32,
    completion: CompletionMonitor,
}

impl QueueDispatcher {
    /// Create a dispatcher fetching up to `batch_size` entries per cycle.
    pub fn new(
        store: Store,
        provider: Arc<dyn MessageProvider>,
        events: Arc<dyn EventSink>,
        retry: RetryPolicy,
        batch_size: u32,
    ) -> Self {
        let completion = CompletionMonitor::new(store.clone(), Arc::clone(&events));
        Self {
            store,
            provider,
            events,
            retry,
            batch_size,
            completion,
        }
    }

    /// Run one dispatch cycle at `now`, then the completion pass.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only if the due-entry query fails.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<DispatchReport, StoreError> {
        let entries = self.store.due_entries(now, self.batch_size).await?;
        let mut report = DispatchReport::default();

        for entry in &entries {
            report.processed = report.processed.saturating_add(1);
            let outcome = match self.process(entry, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Entry stays open and is fetched again on a later tick.
                    error!(entry_id = %entry.id, error = %e, "failed to record dispatch outcome");
                    EntryOutcome::Skipped
                }
            };
            let counter = match outcome {
                EntryOutcome::Sent => &mut report.sent,
                EntryOutcome::Retrying => &mut report.retried,
                EntryOutcome::Failed => &mut report.failed,
                EntryOutcome::Skipped => &mut report.skipped,
            };
            *counter = counter.saturating_add(1);
        }

        match self.completion.finalize_drained_runs(now).await {
            Ok(runs) => report.completed_runs = u32::try_from(runs.len()).unwrap_or(u32::MAX),
            Err(e) => error!(error = %e, "completion pass failed"),
        }

        Ok(report)
    }

    async fn process(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Result<EntryOutcome, StoreError> {
        // A previous process died between claiming the last attempt and
        // recording its outcome.
        if self.retry.is_exhausted(entry.attempts) {
            let reason = entry
                .last_error
                .clone()
                .unwrap_or_else(|| "retry budget exhausted".to_owned());
            self.finalize_failed(entry, entry.attempts, &reason, now).await?;
            return Ok(EntryOutcome::Failed);
        }

        let Some(attempts) = self.store.begin_attempt(&entry.id, entry.attempts).await? else {
            debug!(entry_id = %entry.id, "attempt already claimed by another dispatcher");
            return Ok(EntryOutcome::Skipped);
        };

        match self.attempt(entry).await {
            Ok((message_id, preview)) => {
                self.store.record_sent(entry, &message_id, &preview, now).await?;
                debug!(entry_id = %entry.id, attempts, %message_id, "message sent");
                self.publish(
                    entry,
                    events::MESSAGE_SENT,
                    json!({ "status": "sent", "attempts": attempts, "provider_message_id": message_id }),
                );
                Ok(EntryOutcome::Sent)
            }
            Err(e) => {
                let reason = e.to_string();
                if self.retry.is_exhausted(attempts) {
                    self.finalize_failed(entry, attempts, &reason, now).await?;
                    return Ok(EntryOutcome::Failed);
                }
                let next_retry_at = self.retry.next_retry_at(attempts, now);
                self.store.schedule_retry(&entry.id, next_retry_at, &reason).await?;
                warn!(
                    entry_id = %entry.id,
                    attempts,
                    %next_retry_at,
                    error = %reason,
                    "send failed, retry scheduled"
                );
                self.publish(
                    entry,
                    events::MESSAGE_RETRY,
                    json!({
                        "status": "retrying",
                        "attempts": attempts,
                        "next_retry_at": next_retry_at,
                        "error": reason,
                    }),
                );
                Ok(EntryOutcome::Retrying)
            }
        }
    }

    /// Resolve credentials, render and send. Returns the provider message id
    /// and the rendered body preview.
    async fn attempt(&self, entry: &QueueEntry) -> Result<(String, String), DispatchError> {
        let account = self.store.account(&entry.account_id).await?;
        if account.org_id != entry.org_id {
            return Err(DispatchError::AccountMismatch {
                account_id: account.id,
                org_id: entry.org_id.clone(),
            });
        }
        let campaign = self.store.campaign(&entry.campaign_id).await?;
        let rendered = render(&campaign, &entry.template_params)?;
        let message_id = self
            .provider
            .send(&account, &entry.phone_number, &rendered)
            .await?;
        Ok((message_id, rendered.preview))
    }

    async fn finalize_failed(
        &self,
        entry: &QueueEntry,
        attempts: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.record_failure(entry, reason, now).await?;
        warn!(entry_id = %entry.id, attempts, error = %reason, "send failed permanently");
        self.publish(
            entry,
            events::MESSAGE_FAILED,
            json!({ "status": "failed", "attempts": attempts, "error": reason }),
        );
        Ok(())
    }

    fn publish(&self, entry: &QueueEntry, event: &str, mut payload: serde_json::Value) {
        payload["entry_id"] = json!(entry.id);
        payload["run_id"] = json!(entry.run_id);
        payload["campaign_id"] = json!(entry.campaign_id);
        payload["recipient_id"] = json!(entry.recipient_id);
        self.events.publish(&entry.org_id, event, payload);
    }
}

#[async_trait]
impl PollTask for QueueDispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn tick(&self, now: DateTime<Utc>) {
        match self.poll_once(now).await {
            Ok(report) if report.processed > 0 || report.completed_runs > 0 => {
                info!(?report, "dispatcher cycle finished");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "dispatcher cycle failed"),
        }
    }
}
