//! Daily send quotas per organization and per provider account.
//!
//! Admission control happens before enqueueing, not after sending: the
//! scheduler calls [`QuotaTracker::check_quota`] and, for each admitted
//! recipient, [`QuotaTracker::reserve_quota`] exactly once. Counters live in
//! the `daily_limits` relation keyed by (org, account-or-org-level, UTC day)
//! and rows are created on first use.
//!
//! The increment is a single `INSERT … ON CONFLICT DO UPDATE … WHERE
//! sent_count < limit_count` per scope. A check that passed can still lose
//! the last slot to another scheduler; the reservation then reports `false`
//! and `sent_count` stays at the limit.
//! Storage errors are returned to the caller untouched; the next poll tick is
//! the retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::store::{day_key, format_ts, Store, StoreError};

/// Stored `account_id` for the org-level scope.
const ORG_SCOPE: &str = "";

/// One counter row (possibly implicit, when nothing was reserved yet today).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounter {
    /// Organization.
    pub org_id: String,
    /// Account, or `None` for the org-level counter.
    pub account_id: Option<String>,
    /// UTC day (`YYYY-MM-DD`).
    pub day: String,
    /// Recipients admitted so far today.
    pub sent_count: i64,
    /// Admissions allowed today.
    pub limit_count: i64,
}

impl QuotaCounter {
    /// Whether another admission fits under the limit.
    pub fn has_room(&self) -> bool {
        self.sent_count < self.limit_count
    }

    /// Admissions left today.
    pub fn remaining(&self) -> i64 {
        self.limit_count.saturating_sub(self.sent_count).max(0)
    }
}

/// Checks and reserves daily send quota.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    store: Store,
    default_limit: i64,
}

impl QuotaTracker {
    /// Create a tracker; scopes without a plan get `default_limit` per day.
    pub fn new(store: Store, default_limit: i64) -> Self {
        Self {
            store,
            default_limit,
        }
    }

    /// Whether both today's org-level and account-level counters have room.
    ///
    /// A scope with no row yet counts as zero sent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a read fails.
    pub async fn check_quota(
        &self,
        org_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.store.pool().acquire().await?;
        self.check_quota_on(&mut conn, org_id, account_id, now).await
    }

    /// [`Self::check_quota`] on a caller-owned connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a read fails.
    pub async fn check_quota_on(
        &self,
        conn: &mut SqliteConnection,
        org_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let org = self.usage_on(conn, org_id, None, now).await?;
        if !org.has_room() {
            debug!(org_id, sent = org.sent_count, limit = org.limit_count, "org quota exhausted");
            return Ok(false);
        }
        let account = self.usage_on(conn, org_id, Some(account_id), now).await?;
        if !account.has_room() {
            debug!(
                org_id,
                account_id,
                sent = account.sent_count,
                limit = account.limit_count,
                "account quota exhausted"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Count one admission against today's org-level and account-level
    /// counters.
    ///
    /// Returns `false` and counts nothing when either counter is already at
    /// its limit, e.g. another scheduler took the last slot after this
    /// caller's [`Self::check_quota`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if an upsert fails; neither counter
    /// is incremented then.
    pub async fn reserve_quota(
        &self,
        org_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.store.pool().begin().await?;
        if !self.reserve_quota_on(&mut tx, org_id, account_id, now).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// [`Self::reserve_quota`] inside a caller-owned transaction.
    ///
    /// On `false` the org-level counter may already be incremented; the
    /// caller must roll back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if an upsert fails.
    pub async fn reserve_quota_on(
        &self,
        conn: &mut SqliteConnection,
        org_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let day = day_key(now);
        let ts = format_ts(now);
        for scope in [ORG_SCOPE, account_id] {
            // Neither path moves sent_count past limit_count.
            let counted = sqlx::query(
                "INSERT INTO daily_limits (org_id, account_id, day, sent_count, limit_count, updated_at) \
                 SELECT ?1, ?2, ?3, 1, plan.limit_count, ?5 \
                 FROM (SELECT COALESCE( \
                         (SELECT limit_count FROM quota_plans WHERE org_id = ?1 AND account_id = ?2), \
                         ?4) AS limit_count) AS plan \
                 WHERE plan.limit_count > 0 \
                 ON CONFLICT(org_id, account_id, day) DO UPDATE SET \
                   sent_count = daily_limits.sent_count + 1, \
                   updated_at = excluded.updated_at \
                 WHERE daily_limits.sent_count < daily_limits.limit_count",
            )
            .bind(org_id)
            .bind(scope)
            .bind(&day)
            .bind(self.default_limit)
            .bind(&ts)
            .execute(&mut *conn)
            .await?
            .rows_affected()
                == 1;
            if !counted {
                debug!(org_id, scope, "quota reservation refused at limit");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Today's counter for a scope, implicit zero row included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the read fails.
    pub async fn usage(
        &self,
        org_id: &str,
        account_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<QuotaCounter, StoreError> {
        let mut conn = self.store.pool().acquire().await?;
        self.usage_on(&mut conn, org_id, account_id, now).await
    }

    async fn usage_on(
        &self,
        conn: &mut SqliteConnection,
        org_id: &str,
        account_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<QuotaCounter, StoreError> {
        let day = day_key(now);
        let scope = account_id.unwrap_or(ORG_SCOPE);
        let (sent_count, limit_count): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(d.sent_count, 0), COALESCE(d.limit_count, p.limit_count, ?4) \
             FROM (SELECT 1) \
             LEFT JOIN daily_limits d ON d.org_id = ?1 AND d.account_id = ?2 AND d.day = ?3 \
             LEFT JOIN quota_plans p ON p.org_id = ?1 AND p.account_id = ?2",
        )
        .bind(org_id)
        .bind(scope)
        .bind(&day)
        .bind(self.default_limit)
        .fetch_one(&mut *conn)
        .await?;

        Ok(QuotaCounter {
            org_id: org_id.to_owned(),
            account_id: account_id.map(str::to_owned),
            day,
            sent_count,
            limit_count,
        })
    }

    /// Set the standing daily limit for a scope (`account_id = None` for the
    /// org level). Today's counter, if it exists, takes the new limit at once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRequest`] for a negative limit, or
    /// [`StoreError::Database`] if a write fails.
    pub async fn set_plan_limit(
        &self,
        org_id: &str,
        account_id: Option<&str>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if limit < 0 {
            return Err(StoreError::InvalidRequest(format!(
                "daily limit must not be negative, got {limit}"
            )));
        }
        let scope = account_id.unwrap_or(ORG_SCOPE);
        let mut tx = self.store.pool().begin().await?;
        sqlx::query(
            "INSERT INTO quota_plans (org_id, account_id, limit_count) VALUES (?1, ?2, ?3) \
             ON CONFLICT(org_id, account_id) DO UPDATE SET limit_count = excluded.limit_count",
        )
        .bind(org_id)
        .bind(scope)
        .bind(limit)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE daily_limits SET limit_count = ?1, updated_at = ?2 \
             WHERE org_id = ?3 AND account_id = ?4 AND day = ?5",
        )
        .bind(limit)
        .bind(format_ts(now))
        .bind(org_id)
        .bind(scope)
        .bind(day_key(now))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(org_id, account_id = scope, limit, "quota plan updated");
        Ok(())
    }
}
