//! Campaign Completion Monitor.
//!
//! A running run whose queue entries are all terminal is done. Paused runs
//! are never completed here: their remaining recipients are still waiting on
//! quota, not drained. A run only becomes visible as `running` together with
//! its admitted entries, so "no outstanding entries" means drained.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info};

use crate::events::{self, EventSink};
use crate::store::{RunStatus, Store, StoreError};

/// Finalizes drained runs.
pub struct CompletionMonitor {
    store: Store,
    events: Arc<dyn EventSink>,
}

impl CompletionMonitor {
    /// Create a monitor.
    pub fn new(store: Store, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Complete every running run with no pending or retrying entries.
    ///
    /// Returns the ids of the runs this call completed. A failure on one run
    /// is logged and the others are still checked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the running runs cannot be listed.
    pub async fn finalize_drained_runs(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut completed = Vec::new();
        for run in self.store.running_runs().await? {
            let summary = match self.store.run_summary(&run.id).await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to summarize run");
                    continue;
                }
            };
            if summary.outstanding() > 0 {
                continue;
            }

            match self
                .store
                .transition_run(&run.id, RunStatus::Running, RunStatus::Completed, now)
                .await
            {
                Ok(true) => {
                    info!(run_id = %run.id, sent = summary.sent, failed = summary.failed, "run completed");
                    self.events.publish(
                        &run.org_id,
                        events::RUN_COMPLETED,
                        json!({
                            "run_id": run.id,
                            "campaign_id": run.campaign_id,
                            "account_id": run.account_id,
                            "status": "completed",
                            "sent": summary.sent,
                            "failed": summary.failed,
                        }),
                    );
                    completed.push(run.id);
                }
                Ok(false) => {}
                Err(e) => error!(run_id = %run.id, error = %e, "failed to complete run"),
            }
        }
        Ok(completed)
    }
}
