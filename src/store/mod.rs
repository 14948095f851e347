//! SQLite persistence for campaigns, runs, recipients and the send queue.
//!
//! The [`Store`] is the only coordination point between the scheduler, the
//! dispatcher and the completion monitor. Every cross-instance guarantee is
//! expressed in SQL:
//!
//! - run claiming is a conditional `UPDATE … WHERE status = 'scheduled'`;
//! - queue entries are deduplicated by `UNIQUE(run_id, recipient_id)`;
//! - a run's claim and its admitted entries commit in one transaction;
//! - attempt increments are conditional on the attempt count that was read.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings with millisecond
//! precision, so comparing them as text compares them chronologically.

pub mod campaigns;
pub mod queue;
pub mod recipients;
pub mod runs;

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub use self::campaigns::{Account, Campaign, CampaignStatus, NewCampaign, NewRecipient};
pub use self::queue::{Enqueued, QueueEntry, QueueStatus, QueueSummary};
pub use self::recipients::{Recipient, RecipientStatus};
pub use self::runs::{CampaignRun, RunStatus};

/// Schema applied on every open. All statements are `IF NOT EXISTS`.
const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of row that was looked up.
        entity: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp {value:?}: {source}")]
    InvalidTimestamp {
        /// The stored text.
        value: String,
        /// Parse failure.
        source: chrono::ParseError,
    },

    /// The request contradicts stored data.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Template parameters could not be (de)serialized.
    #[error("invalid template parameters: {0}")]
    Params(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the dispatch database.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub async fn open(path: &Path, max_connections: u32) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        let store = Self { pool };
        store.migrate().await.context("failed to apply schema")?;
        info!(path = %path.display(), "dispatch database opened");
        Ok(store)
    }

    /// Open a private in-memory database with the schema applied.
    ///
    /// In-memory databases are per-connection, so the pool is limited to one
    /// connection to keep every query on the same database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema fails.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.pragma("foreign_keys", "ON");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not applied.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("dispatch database closed");
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Format a timestamp for storage.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidTimestamp`] for malformed text.
pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::InvalidTimestamp {
            value: value.to_owned(),
            source,
        })
}

/// Parse an optional stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidTimestamp`] for malformed text.
pub fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

/// The UTC calendar day key used by quota counters (`YYYY-MM-DD`).
pub fn day_key(at: DateTime<Utc>) -> String {
    let day: NaiveDate = at.date_naive();
    day.format("%Y-%m-%d").to_string()
}

fn encode_params(params: &[String]) -> Result<String, StoreError> {
    Ok(serde_json::to_string(params)?)
}

fn decode_params(raw: &str) -> Result<Vec<String>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
