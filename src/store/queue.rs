//! The send queue: one admitted attempt-tracker per (run, recipient) pair.
//!
//! Entries are created only by the scheduler and mutated only by the
//! dispatcher. `UNIQUE(run_id, recipient_id)` makes enqueueing idempotent;
//! the only rewrite of an existing entry is reopening a failed one after its
//! recipient was reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::trace;

use super::{
    decode_params, encode_params, format_ts, new_id, parse_opt_ts, parse_ts, CampaignRun,
    Recipient, Store, StoreError,
};

/// Row type returned by SQLite queries for queue entries.
type QueueRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

const QUEUE_COLUMNS: &str = "id, org_id, account_id, campaign_id, run_id, recipient_id, \
     phone_number, template_params, status, attempts, next_retry_at, last_error, \
     processed_at, created_at";

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Admitted, never attempted (or attempt in flight).
    Pending,
    /// At least one attempt failed; waiting for `next_retry_at`.
    Retrying,
    /// Accepted by the provider.
    Sent,
    /// Retry budget exhausted.
    Failed,
}

impl QueueStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Sent => "sent",
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
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "send_queue.status",
                value: other.to_owned(),
            }),
        }
    }

    /// Whether the entry will never be attempted again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// One admitted send for one recipient within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Entry id.
    pub id: String,
    /// Owning organization.
    pub org_id: String,
    /// Sending account.
    pub account_id: String,
    /// Campaign the run belongs to.
    pub campaign_id: String,
    /// Run that admitted this entry.
    pub run_id: String,
    /// Recipient being sent to.
    pub recipient_id: String,
    /// Destination phone number (copied at admission).
    pub phone_number: String,
    /// Positional template parameters (copied at admission).
    pub template_params: Vec<String>,
    /// Current status.
    pub status: QueueStatus,
    /// Attempts started so far. Incremented before each send.
    pub attempts: u32,
    /// Earliest time of the next attempt, when retrying.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the entry reached a terminal status.
    pub processed_at: Option<DateTime<Utc>>,
    /// Admission time; dispatch is FIFO on this.
    pub created_at: DateTime<Utc>,
}

/// What [`Store::enqueue_on`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new entry was created.
    Inserted,
    /// A failed entry was reopened for a reset recipient.
    Reopened,
    /// An entry already exists and was left alone.
    Existing,
}

impl Enqueued {
    /// Whether the call created dispatch work (and so needs quota).
    pub fn is_new_work(self) -> bool {
        !matches!(self, Self::Existing)
    }
}

/// Queue entry counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    /// Entries not yet attempted.
    pub pending: u64,
    /// Entries waiting for a retry.
    pub retrying: u64,
    /// Entries accepted by the provider.
    pub sent: u64,
    /// Entries that exhausted their retries.
    pub failed: u64,
}

impl QueueSummary {
    /// Entries still owed an attempt.
    pub fn outstanding(&self) -> u64 {
        self.pending.saturating_add(self.retrying)
    }

    /// All entries of the run.
    pub fn total(&self) -> u64 {
        self.outstanding()
            .saturating_add(self.sent)
            .saturating_add(self.failed)
    }
}

fn entry_from_row(row: QueueRow) -> Result<QueueEntry, StoreError> {
    let (
        id,
        org_id,
        account_id,
        campaign_id,
        run_id,
        recipient_id,
        phone_number,
        params,
        status,
        attempts,
        next_retry_at,
        last_error,
        processed_at,
        created_at,
    ) = row;
    Ok(QueueEntry {
        id,
        org_id,
        account_id,
        campaign_id,
        run_id,
        recipient_id,
        phone_number,
        template_params: decode_params(&params)?,
        status: QueueStatus::parse(&status)?,
        attempts: u32::try_from(attempts).map_err(|_| StoreError::InvalidEnum {
            field: "send_queue.attempts",
            value: attempts.to_string(),
        })?,
        next_retry_at: parse_opt_ts(next_retry_at)?,
        last_error,
        processed_at: parse_opt_ts(processed_at)?,
        created_at: parse_ts(&created_at)?,
    })
}

impl Store {
    /// Admit `recipient` into the queue for `run`.
    ///
    /// Returns `false` when an open or sent entry for this (run, recipient)
    /// pair already exists; that entry is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn enqueue(
        &self,
        run: &CampaignRun,
        recipient: &Recipient,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let outcome = Self::enqueue_on(&mut conn, run, recipient, now).await?;
        Ok(outcome.is_new_work())
    }

    /// [`Store::enqueue`] on a caller-owned connection.
    ///
    /// A `failed` entry whose recipient is `pending` again (operator reset)
    /// is reopened: status back to `pending`, attempts to zero, retry state
    /// cleared, and it moves to the back of the FIFO.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn enqueue_on(
        conn: &mut SqliteConnection,
        run: &CampaignRun,
        recipient: &Recipient,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, StoreError> {
        let ts = format_ts(now);
        let params = encode_params(&recipient.template_params)?;
        let inserted = sqlx::query(
            "INSERT INTO send_queue \
             (id, org_id, account_id, campaign_id, run_id, recipient_id, phone_number, \
              template_params, status, attempts, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0, ?9) \
             ON CONFLICT(run_id, recipient_id) DO NOTHING",
        )
        .bind(new_id())
        .bind(&run.org_id)
        .bind(&run.account_id)
        .bind(&run.campaign_id)
        .bind(&run.id)
        .bind(&recipient.id)
        .bind(&recipient.phone_number)
        .bind(&params)
        .bind(&ts)
        .execute(&mut *conn)
        .await?
        .rows_affected()
            == 1;

        let outcome = if inserted {
            Enqueued::Inserted
        } else {
            let reopened = sqlx::query(
                "UPDATE send_queue SET status = 'pending', attempts = 0, next_retry_at = NULL, \
                 last_error = NULL, processed_at = NULL, phone_number = ?1, template_params = ?2, \
                 created_at = ?3 \
                 WHERE run_id = ?4 AND recipient_id = ?5 AND status = 'failed' \
                   AND EXISTS (SELECT 1 FROM campaign_recipients \
                               WHERE id = ?5 AND status = 'pending')",
            )
            .bind(&recipient.phone_number)
            .bind(&params)
            .bind(&ts)
            .bind(&run.id)
            .bind(&recipient.id)
            .execute(&mut *conn)
            .await?
            .rows_affected()
                == 1;
            if reopened {
                Enqueued::Reopened
            } else {
                Enqueued::Existing
            }
        };
        trace!(run_id = %run.id, recipient_id = %recipient.id, ?outcome, "enqueue");
        Ok(outcome)
    }

    /// Up to `limit` entries ready for an attempt at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn due_entries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM send_queue \
             WHERE status IN ('pending', 'retrying') \
               AND (next_retry_at IS NULL OR next_retry_at <= ?1) \
             ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(format_ts(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// All entries admitted by a run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn entries_for_run(&self, run_id: &str) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM send_queue WHERE run_id = ?1 \
             ORDER BY created_at ASC, rowid ASC"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// Fetch a queue entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such entry exists.
    pub async fn queue_entry(&self, id: &str) -> Result<QueueEntry, StoreError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM send_queue WHERE id = ?1");
        let row: Option<QueueRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| StoreError::NotFound {
            entity: "queue entry",
            id: id.to_owned(),
        })?;
        entry_from_row(row)
    }

    /// Start an attempt: increment `attempts` if it still equals `seen`.
    ///
    /// Returns the new attempt count, or `None` when another dispatcher
    /// already started this attempt or the entry is no longer open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn begin_attempt(&self, entry_id: &str, seen: u32) -> Result<Option<u32>, StoreError> {
        let claimed = sqlx::query(
            "UPDATE send_queue SET attempts = attempts + 1 \
             WHERE id = ?1 AND attempts = ?2 AND status IN ('pending', 'retrying')",
        )
        .bind(entry_id)
        .bind(i64::from(seen))
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        Ok(claimed.then(|| seen.saturating_add(1)))
    }

    /// Record a successful send: message history row, entry and recipient
    /// marked `sent`, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any statement fails (nothing is
    /// written then).
    pub async fn record_sent(
        &self,
        entry: &QueueEntry,
        provider_message_id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = format_ts(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO messages \
             (id, org_id, account_id, campaign_id, recipient_id, phone_number, direction, \
              provider_message_id, body, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'outbound', ?7, ?8, 'sent', ?9)",
        )
        .bind(new_id())
        .bind(&entry.org_id)
        .bind(&entry.account_id)
        .bind(&entry.campaign_id)
        .bind(&entry.recipient_id)
        .bind(&entry.phone_number)
        .bind(provider_message_id)
        .bind(body)
        .bind(&ts)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE send_queue SET status = 'sent', processed_at = ?1, next_retry_at = NULL, \
             last_error = NULL WHERE id = ?2",
        )
        .bind(&ts)
        .bind(&entry.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE campaign_recipients SET status = 'sent', sent_at = ?1 \
             WHERE id = ?2 AND status = 'pending'",
        )
        .bind(&ts)
        .bind(&entry.recipient_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Park an entry until `next_retry_at` after a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn schedule_retry(
        &self,
        entry_id: &str,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE send_queue SET status = 'retrying', next_retry_at = ?1, last_error = ?2 \
             WHERE id = ?3 AND status IN ('pending', 'retrying')",
        )
        .bind(format_ts(next_retry_at))
        .bind(error)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark an entry and its recipient `failed` (terminal).
    ///
    /// `next_retry_at` is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any statement fails.
    pub async fn record_failure(
        &self,
        entry: &QueueEntry,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = format_ts(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE send_queue SET status = 'failed', processed_at = ?1, last_error = ?2 \
             WHERE id = ?3",
        )
        .bind(&ts)
        .bind(error)
        .bind(&entry.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE campaign_recipients SET status = 'failed' \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(&entry.recipient_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Entry counts by status for a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn run_summary(&self, run_id: &str) -> Result<QueueSummary, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, count(*) FROM send_queue WHERE run_id = ?1 GROUP BY status",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = QueueSummary::default();
        for (status, count) in rows {
            let count = count.cast_unsigned();
            match QueueStatus::parse(&status)? {
                QueueStatus::Pending => summary.pending = count,
                QueueStatus::Retrying => summary.retrying = count,
                QueueStatus::Sent => summary.sent = count,
                QueueStatus::Failed => summary.failed = count,
            }
        }
        Ok(summary)
    }
}
