//! Campaign Run Scheduler: claims due runs and admits their pending
//! recipients into the send queue under quota.
//!
//! A cycle fetches due runs earliest-first and, for each one, wins the
//! `scheduled → running` claim or skips it, then walks the campaign's pending
//! recipients in creation order. Each recipient that passes
//! [`QuotaTracker::check_quota`] is enqueued; the quota is reserved only when
//! the enqueue created work (a new entry, or a failed entry reopened after an
//! operator reset), so a re-admitted recipient never counts twice. Any
//! recipient deferred for quota pauses the run.
//!
//! Claim, entries, reservations and the resulting run status commit in one
//! transaction. A crash mid-admission leaves the run `scheduled` for the next
//! cycle, and a `running` run always has its entries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{Connection, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, error, info, warn};

use super::lifecycle::PollTask;
use crate::events::{self, EventSink};
use crate::quota::QuotaTracker;
use crate::store::{CampaignRun, Enqueued, RunStatus, Store, StoreError};

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Due runs this instance claimed.
    pub claimed: u32,
    /// Due runs another instance claimed first.
    pub lost_claims: u32,
    /// Queue entries created.
    pub enqueued: u32,
    /// Recipients left pending because a quota was exhausted.
    pub deferred: u32,
    /// Runs completed at once for having no pending recipients.
    pub completed: u32,
    /// Runs paused on quota.
    pub paused: u32,
    /// Runs that failed with an error.
    pub failed: u32,
}

/// Result of admitting one claimed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Nothing was pending.
    Empty,
    /// Every pending recipient was admitted.
    Admitted { enqueued: u32 },
    /// At least one recipient was deferred.
    Deferred { enqueued: u32, deferred: u32 },
}

/// Polls for due runs and admits their recipients.
pub struct CampaignScheduler {
    store: Store,
    quota: QuotaTracker,
    events: Arc<dyn EventSink>,
    batch_size: u32,
}

impl CampaignScheduler {
    /// Create a scheduler fetching up to `batch_size` due runs per cycle.
    pub fn new(store: Store, quota: QuotaTracker, events: Arc<dyn EventSink>, batch_size: u32) -> Self {
        Self {
            store,
            quota,
            events,
            batch_size,
        }
    }

    /// Run one scheduling cycle at `now`.
    ///
    /// Errors on one run fail that run only; the rest of the batch proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only if the due-run query itself fails.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<SchedulerReport, StoreError> {
        let due = self.store.due_runs(now, self.batch_size).await?;
        let mut report = SchedulerReport::default();

        for run in due {
            let mut tx = match self.store.pool().begin().await {
                Ok(tx) => tx,
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to open admission transaction");
                    continue;
                }
            };
            match Store::claim_run_on(&mut tx, &run.id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(run_id = %run.id, "run already claimed by another scheduler");
                    report.lost_claims = report.lost_claims.saturating_add(1);
                    rollback(tx, &run).await;
                    continue;
                }
                Err(e) => {
                    // Still scheduled; the next cycle retries the claim.
                    error!(run_id = %run.id, error = %e, "failed to claim run");
                    rollback(tx, &run).await;
                    continue;
                }
            }
            report.claimed = report.claimed.saturating_add(1);

            match self.admit_claimed(tx, &run, now).await {
                Ok(admission) => {
                    info!(run_id = %run.id, campaign_id = %run.campaign_id, "run claimed");
                    self.publish(&run, events::RUN_STARTED, json!({ "status": "running" }));
                    self.settle(&run, admission, &mut report);
                }
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "run processing failed");
                    report.failed = report.failed.saturating_add(1);
                    self.fail_run(&run, &e, now).await;
                }
            }
        }

        Ok(report)
    }

    /// Admit a claimed run and apply the transition the admission calls for,
    /// then commit the claim, the entries, the quota and the transition
    /// together. On error everything is rolled back and the run stays
    /// `scheduled`.
    async fn admit_claimed(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        run: &CampaignRun,
        now: DateTime<Utc>,
    ) -> Result<Admission, StoreError> {
        match self.admit_and_transition(&mut tx, run, now).await {
            Ok(admission) => {
                tx.commit().await?;
                Ok(admission)
            }
            Err(e) => {
                rollback(tx, run).await;
                Err(e)
            }
        }
    }

    async fn admit_and_transition(
        &self,
        conn: &mut SqliteConnection,
        run: &CampaignRun,
        now: DateTime<Utc>,
    ) -> Result<Admission, StoreError> {
        let admission = self.admit(conn, run, now).await?;
        let next = match admission {
            Admission::Empty => Some(RunStatus::Completed),
            Admission::Deferred { .. } => Some(RunStatus::Paused),
            Admission::Admitted { .. } => None,
        };
        if let Some(to) = next {
            Store::transition_run_on(conn, &run.id, RunStatus::Running, to, now).await?;
        }
        Ok(admission)
    }

    /// Walk pending recipients in creation order and enqueue under quota.
    ///
    /// Each recipient's entry and reservation share a savepoint, so a
    /// reservation refused at the limit leaves no entry behind.
    async fn admit(
        &self,
        conn: &mut SqliteConnection,
        run: &CampaignRun,
        now: DateTime<Utc>,
    ) -> Result<Admission, StoreError> {
        let recipients = Store::pending_recipients_on(conn, &run.campaign_id).await?;
        if recipients.is_empty() {
            return Ok(Admission::Empty);
        }

        let mut enqueued: u32 = 0;
        let mut deferred: u32 = 0;
        for recipient in &recipients {
            if !self
                .quota
                .check_quota_on(conn, &run.org_id, &run.account_id, now)
                .await?
            {
                deferred = deferred.saturating_add(1);
                continue;
            }

            let mut savepoint = conn.begin().await?;
            let outcome = Store::enqueue_on(&mut savepoint, run, recipient, now).await?;
            if !outcome.is_new_work() {
                savepoint.commit().await?;
                continue;
            }
            if self
                .quota
                .reserve_quota_on(&mut savepoint, &run.org_id, &run.account_id, now)
                .await?
            {
                savepoint.commit().await?;
                if outcome == Enqueued::Reopened {
                    info!(run_id = %run.id, recipient_id = %recipient.id, "failed entry reopened");
                }
                enqueued = enqueued.saturating_add(1);
            } else {
                savepoint.rollback().await?;
                deferred = deferred.saturating_add(1);
            }
        }

        Ok(if deferred > 0 {
            Admission::Deferred { enqueued, deferred }
        } else {
            Admission::Admitted { enqueued }
        })
    }

    /// Report and announce a committed admission.
    fn settle(&self, run: &CampaignRun, admission: Admission, report: &mut SchedulerReport) {
        match admission {
            Admission::Empty => {
                info!(run_id = %run.id, "run has no pending recipients, completed");
                report.completed = report.completed.saturating_add(1);
                self.publish(run, events::RUN_COMPLETED, json!({ "status": "completed" }));
            }
            Admission::Admitted { enqueued } => {
                report.enqueued = report.enqueued.saturating_add(enqueued);
                info!(run_id = %run.id, enqueued, "recipients admitted");
            }
            Admission::Deferred { enqueued, deferred } => {
                report.enqueued = report.enqueued.saturating_add(enqueued);
                report.deferred = report.deferred.saturating_add(deferred);
                report.paused = report.paused.saturating_add(1);
                warn!(run_id = %run.id, enqueued, deferred, "quota exhausted, run paused");
                self.publish(
                    run,
                    events::RUN_PAUSED,
                    json!({ "status": "paused", "enqueued": enqueued, "deferred": deferred }),
                );
            }
        }
    }

    async fn fail_run(&self, run: &CampaignRun, cause: &StoreError, now: DateTime<Utc>) {
        match self
            .store
            .transition_run(&run.id, RunStatus::Scheduled, RunStatus::Failed, now)
            .await
        {
            Ok(true) => self.publish(
                run,
                events::RUN_FAILED,
                json!({ "status": "failed", "error": cause.to_string() }),
            ),
            Ok(false) => debug!(run_id = %run.id, "run no longer scheduled, not failed"),
            Err(e) => error!(run_id = %run.id, error = %e, "failed to mark run failed"),
        }
    }

    fn publish(&self, run: &CampaignRun, event: &str, mut payload: serde_json::Value) {
        payload["run_id"] = json!(run.id);
        payload["campaign_id"] = json!(run.campaign_id);
        payload["account_id"] = json!(run.account_id);
        self.events.publish(&run.org_id, event, payload);
    }
}

async fn rollback(tx: Transaction<'static, Sqlite>, run: &CampaignRun) {
    if let Err(e) = tx.rollback().await {
        warn!(run_id = %run.id, error = %e, "admission rollback failed");
    }
}

#[async_trait]
impl PollTask for CampaignScheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn tick(&self, now: DateTime<Utc>) {
        match self.poll_once(now).await {
            Ok(report) if report != SchedulerReport::default() => {
                info!(?report, "scheduler cycle finished");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "scheduler cycle failed"),
        }
    }
}
