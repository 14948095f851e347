//! Per-contact send status within a campaign.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{decode_params, parse_opt_ts, parse_ts, Store, StoreError};

/// Row type returned by SQLite queries for recipients.
type RecipientRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    String,
);

const RECIPIENT_COLUMNS: &str = "id, campaign_id, contact_id, phone_number, template_params, \
     status, sent_at, created_at";

/// Send status of one recipient.
///
/// `delivered` and `read` are written by provider delivery callbacks, which
/// live outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    /// Not yet sent; eligible for admission.
    Pending,
    /// Accepted by the provider.
    Sent,
    /// Provider reported delivery.
    Delivered,
    /// Provider reported the message as read.
    Read,
    /// Gave up after the retry budget.
    Failed,
}

impl RecipientStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
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
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "recipient.status",
                value: other.to_owned(),
            }),
        }
    }
}

/// One contact's send within a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Recipient id.
    pub id: String,
    /// Owning campaign.
    pub campaign_id: String,
    /// Optional contact reference.
    pub contact_id: Option<String>,
    /// Destination phone number.
    pub phone_number: String,
    /// Positional template parameters.
    pub template_params: Vec<String>,
    /// Current status.
    pub status: RecipientStatus,
    /// When the provider accepted the message.
    pub sent_at: Option<DateTime<Utc>>,
    /// Creation time; admission follows creation order.
    pub created_at: DateTime<Utc>,
}

fn recipient_from_row(row: RecipientRow) -> Result<Recipient, StoreError> {
    let (id, campaign_id, contact_id, phone_number, params, status, sent_at, created_at) = row;
    Ok(Recipient {
        id,
        campaign_id,
        contact_id,
        phone_number,
        template_params: decode_params(&params)?,
        status: RecipientStatus::parse(&status)?,
        sent_at: parse_opt_ts(sent_at)?,
        created_at: parse_ts(&created_at)?,
    })
}

impl Store {
    /// All pending recipients of a campaign in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn pending_recipients(&self, campaign_id: &str) -> Result<Vec<Recipient>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::pending_recipients_on(&mut conn, campaign_id).await
    }

    /// [`Store::pending_recipients`] on a caller-owned connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn pending_recipients_on(
        conn: &mut SqliteConnection,
        campaign_id: &str,
    ) -> Result<Vec<Recipient>, StoreError> {
        let sql = format!(
            "SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients \
             WHERE campaign_id = ?1 AND status = 'pending' \
             ORDER BY created_at ASC, rowid ASC"
        );
        let rows: Vec<RecipientRow> = sqlx::query_as(&sql)
            .bind(campaign_id)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(recipient_from_row).collect()
    }

    /// Fetch a recipient by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such recipient exists.
    pub async fn recipient(&self, id: &str) -> Result<Recipient, StoreError> {
        let sql = format!("SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients WHERE id = ?1");
        let row: Option<RecipientRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| StoreError::NotFound {
            entity: "recipient",
            id: id.to_owned(),
        })?;
        recipient_from_row(row)
    }

    /// Count a campaign's recipients by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_recipients(
        &self,
        campaign_id: &str,
        status: RecipientStatus,
    ) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM campaign_recipients WHERE campaign_id = ?1 AND status = ?2",
        )
        .bind(campaign_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        // count(*) is always non-negative, safe to cast.
        Ok(row.0.cast_unsigned())
    }
}
