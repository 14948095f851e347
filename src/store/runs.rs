//! Campaign runs: one scheduled, quota-gated execution of a campaign against
//! one provider account.
//!
//! Runs are never deleted. Every status change is a guarded `UPDATE` that
//! names the expected current status, so concurrent instances racing for the
//! same transition observe exactly one winner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::{format_ts, new_id, parse_opt_ts, parse_ts, CampaignStatus, Store, StoreError};

/// Row type returned by SQLite queries for runs.
type RunRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
);

const RUN_COLUMNS: &str = "id, campaign_id, org_id, account_id, scheduled_at, started_at, \
     completed_at, status, idempotency_key, created_at";

/// Lifecycle status of a run.
///
/// `scheduled → running → {paused | completed | failed}`. Completed and
/// failed are terminal; a paused run only moves again through an explicit
/// [`Store::resume_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for `scheduled_at`.
    Scheduled,
    /// Claimed by a scheduler; queue work may be outstanding.
    Running,
    /// Admission stopped on an exhausted quota.
    Paused,
    /// All queue entries reached a terminal state.
    Completed,
    /// Processing aborted with an error.
    Failed,
}

impl RunStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "run.status",
                value: other.to_owned(),
            }),
        }
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The campaign status mirrored for this run status.
    pub fn campaign_status(&self) -> CampaignStatus {
        match self {
            Self::Scheduled => CampaignStatus::Scheduled,
            Self::Running => CampaignStatus::Running,
            Self::Paused => CampaignStatus::Paused,
            Self::Completed => CampaignStatus::Completed,
            Self::Failed => CampaignStatus::Failed,
        }
    }
}

/// One scheduled execution of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRun {
    /// Run id.
    pub id: String,
    /// Campaign being executed.
    pub campaign_id: String,
    /// Owning organization.
    pub org_id: String,
    /// Provider account used for every send.
    pub account_id: String,
    /// Earliest time the run may start.
    pub scheduled_at: DateTime<Utc>,
    /// When a scheduler first claimed the run.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: RunStatus,
    /// Deduplicates repeated schedule requests.
    pub idempotency_key: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

fn run_from_row(row: RunRow) -> Result<CampaignRun, StoreError> {
    let (id, campaign_id, org_id, account_id, scheduled, started, completed, status, key, created) =
        row;
    Ok(CampaignRun {
        id,
        campaign_id,
        org_id,
        account_id,
        scheduled_at: parse_ts(&scheduled)?,
        started_at: parse_opt_ts(started)?,
        completed_at: parse_opt_ts(completed)?,
        status: RunStatus::parse(&status)?,
        idempotency_key: key,
        created_at: parse_ts(&created)?,
    })
}

impl Store {
    /// Schedule a run of `campaign_id` on `account_id`.
    ///
    /// A repeated request with the same `idempotency_key` returns the run
    /// created by the first request. The boolean is `true` only when this
    /// call created the run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown campaign or account and
    /// [`StoreError::InvalidRequest`] if the account belongs to another org.
    pub async fn schedule_run(
        &self,
        campaign_id: &str,
        account_id: &str,
        scheduled_at: DateTime<Utc>,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(CampaignRun, bool), StoreError> {
        let campaign = self.campaign(campaign_id).await?;
        let account = self.account(account_id).await?;
        if account.org_id != campaign.org_id {
            return Err(StoreError::InvalidRequest(format!(
                "account {account_id} does not belong to org {}",
                campaign.org_id
            )));
        }

        let ts = format_ts(now);
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO campaign_runs \
             (id, campaign_id, org_id, account_id, scheduled_at, status, idempotency_key, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'scheduled', ?6, ?7) \
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(new_id())
        .bind(campaign_id)
        .bind(&campaign.org_id)
        .bind(account_id)
        .bind(format_ts(scheduled_at))
        .bind(idempotency_key)
        .bind(&ts)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query("UPDATE campaigns SET status = 'scheduled', updated_at = ?1 WHERE id = ?2")
                .bind(&ts)
                .bind(campaign_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let sql = format!("SELECT {RUN_COLUMNS} FROM campaign_runs WHERE idempotency_key = ?1");
        let row: RunRow = sqlx::query_as(&sql)
            .bind(idempotency_key)
            .fetch_one(&self.pool)
            .await?;
        let run = run_from_row(row)?;
        if inserted {
            info!(run_id = %run.id, campaign_id, scheduled_at = %run.scheduled_at, "run scheduled");
        } else {
            debug!(run_id = %run.id, idempotency_key, "duplicate schedule request");
        }
        Ok((run, inserted))
    }

    /// Fetch a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such run exists.
    pub async fn run(&self, id: &str) -> Result<CampaignRun, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM campaign_runs WHERE id = ?1");
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: id.to_owned(),
        })?;
        run_from_row(row)
    }

    /// Up to `limit` scheduled runs due at `now`, earliest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn due_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CampaignRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM campaign_runs \
             WHERE status = 'scheduled' AND scheduled_at <= ?1 \
             ORDER BY scheduled_at ASC, rowid ASC LIMIT ?2"
        );
        let rows: Vec<RunRow> = sqlx::query_as(&sql)
            .bind(format_ts(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    /// All runs currently `running`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn running_runs(&self) -> Result<Vec<CampaignRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM campaign_runs WHERE status = 'running' \
             ORDER BY scheduled_at ASC, rowid ASC"
        );
        let rows: Vec<RunRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(run_from_row).collect()
    }

    /// Claim a due run: `scheduled → running`.
    ///
    /// Returns `false` when another instance already claimed it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn claim_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed = Self::claim_run_on(&mut tx, run_id, now).await?;
        tx.commit().await?;
        Ok(claimed)
    }

    /// [`Store::claim_run`] on a caller-owned connection, so the claim
    /// commits or rolls back together with whatever follows it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn claim_run_on(
        conn: &mut SqliteConnection,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let ts = format_ts(now);
        let claimed = sqlx::query(
            "UPDATE campaign_runs SET status = 'running', started_at = COALESCE(started_at, ?1) \
             WHERE id = ?2 AND status = 'scheduled'",
        )
        .bind(&ts)
        .bind(run_id)
        .execute(&mut *conn)
        .await?
        .rows_affected()
            == 1;

        if claimed {
            sqlx::query(
                "UPDATE campaigns SET status = 'running', updated_at = ?1 \
                 WHERE id = (SELECT campaign_id FROM campaign_runs WHERE id = ?2)",
            )
            .bind(&ts)
            .bind(run_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(claimed)
    }

    /// Move a run from `from` to `to` and mirror the status on its campaign.
    ///
    /// Sets `completed_at` when `to` is terminal. Returns `false` if the run
    /// was not in `from` (someone else already moved it).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn transition_run(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let moved = Self::transition_run_on(&mut tx, run_id, from, to, now).await?;
        tx.commit().await?;
        Ok(moved)
    }

    /// [`Store::transition_run`] on a caller-owned connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn transition_run_on(
        conn: &mut SqliteConnection,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let ts = format_ts(now);
        let completed_at = to.is_terminal().then(|| ts.clone());
        let moved = sqlx::query(
            "UPDATE campaign_runs SET status = ?1, completed_at = COALESCE(?2, completed_at) \
             WHERE id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(&completed_at)
        .bind(run_id)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?
        .rows_affected()
            == 1;

        if moved {
            sqlx::query(
                "UPDATE campaigns SET status = ?1, updated_at = ?2 \
                 WHERE id = (SELECT campaign_id FROM campaign_runs WHERE id = ?3)",
            )
            .bind(to.campaign_status().as_str())
            .bind(&ts)
            .bind(run_id)
            .execute(&mut *conn)
            .await?;
            debug!(run_id, from = from.as_str(), to = to.as_str(), "run transitioned");
        }
        Ok(moved)
    }

    /// Operator reschedule of a paused run: back to `scheduled`, due now.
    ///
    /// Returns `false` if the run is not paused.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn resume_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let ts = format_ts(now);
        let mut tx = self.pool.begin().await?;
        let resumed = sqlx::query(
            "UPDATE campaign_runs SET status = 'scheduled', scheduled_at = ?1 \
             WHERE id = ?2 AND status = 'paused'",
        )
        .bind(&ts)
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if resumed {
            sqlx::query(
                "UPDATE campaigns SET status = 'scheduled', updated_at = ?1 \
                 WHERE id = (SELECT campaign_id FROM campaign_runs WHERE id = ?2)",
            )
            .bind(&ts)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
            info!(run_id, "paused run rescheduled");
        }
        tx.commit().await?;
        Ok(resumed)
    }
}
