//! Campaign definitions, provider accounts and recipient import.
//!
//! These rows are supplied by external collaborators (campaign authoring and
//! account onboarding). The engine only reads them, except for the campaign
//! status which mirrors the status of its latest run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{encode_params, format_ts, new_id, parse_ts, Recipient, RecipientStatus, Store, StoreError};

/// Row type returned by SQLite queries for campaigns.
type CampaignRow = (String, String, String, String, String, String, String, String, String);

/// Row type returned by SQLite queries for accounts.
type AccountRow = (String, String, String, String, Option<String>);

/// Lifecycle status of a campaign, mirroring its most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    /// Created, never scheduled.
    Draft,
    /// A run is waiting for its scheduled time.
    Scheduled,
    /// A run is admitting or dispatching recipients.
    Running,
    /// A run stopped admitting because a quota was exhausted.
    Paused,
    /// A run drained all of its queue work.
    Completed,
    /// A run aborted with an error.
    Failed,
}

impl CampaignStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
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
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "campaign.status",
                value: other.to_owned(),
            }),
        }
    }
}

/// A bulk-send definition: one provider template sent to many recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    /// Campaign id.
    pub id: String,
    /// Owning organization.
    pub org_id: String,
    /// Display name.
    pub name: String,
    /// Provider-side template name.
    pub template_name: String,
    /// Template language code (e.g. `en_US`).
    pub language_code: String,
    /// Template body with `{{n}}` placeholders, used for message history.
    pub body_text: String,
    /// Current status.
    pub status: CampaignStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Input for [`Store::create_campaign`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    /// Owning organization.
    pub org_id: String,
    /// Display name.
    pub name: String,
    /// Provider-side template name.
    pub template_name: String,
    /// Template language code.
    #[serde(default = "default_language")]
    pub language_code: String,
    /// Template body with `{{n}}` placeholders.
    #[serde(default)]
    pub body_text: String,
}

fn default_language() -> String {
    "en_US".to_owned()
}

/// Input for [`Store::add_recipients`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipient {
    /// Optional reference to the contact record.
    #[serde(default)]
    pub contact_id: Option<String>,
    /// Destination phone number (E.164).
    pub phone_number: String,
    /// Positional template parameters.
    #[serde(default)]
    pub template_params: Vec<String>,
}

/// Provider account credentials used to send on behalf of an organization.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    /// Account id.
    pub id: String,
    /// Owning organization.
    pub org_id: String,
    /// Provider-side sender id (phone number id).
    pub phone_number_id: String,
    /// Bearer token for the provider API.
    pub access_token: String,
    /// Optional display name.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("org_id", &self.org_id)
            .field("phone_number_id", &self.phone_number_id)
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

fn campaign_from_row(row: CampaignRow) -> Result<Campaign, StoreError> {
    let (id, org_id, name, template_name, language_code, body_text, status, created, updated) = row;
    Ok(Campaign {
        id,
        org_id,
        name,
        template_name,
        language_code,
        body_text,
        status: CampaignStatus::parse(&status)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

impl Store {
    /// Create a campaign in `draft` status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn create_campaign(
        &self,
        new: &NewCampaign,
        now: DateTime<Utc>,
    ) -> Result<Campaign, StoreError> {
        let id = new_id();
        let ts = format_ts(now);
        sqlx::query(
            "INSERT INTO campaigns \
             (id, org_id, name, template_name, language_code, body_text, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'draft', ?7, ?7)",
        )
        .bind(&id)
        .bind(&new.org_id)
        .bind(&new.name)
        .bind(&new.template_name)
        .bind(&new.language_code)
        .bind(&new.body_text)
        .bind(&ts)
        .execute(&self.pool)
        .await?;
        info!(campaign_id = %id, org_id = %new.org_id, "campaign created");
        self.campaign(&id).await
    }

    /// Fetch a campaign by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such campaign exists.
    pub async fn campaign(&self, id: &str) -> Result<Campaign, StoreError> {
        let row: Option<CampaignRow> = sqlx::query_as(
            "SELECT id, org_id, name, template_name, language_code, body_text, status, \
             created_at, updated_at FROM campaigns WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let row = row.ok_or_else(|| StoreError::NotFound {
            entity: "campaign",
            id: id.to_owned(),
        })?;
        campaign_from_row(row)
    }

    /// Insert or replace a provider account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the upsert fails.
    pub async fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO accounts (id, org_id, phone_number_id, access_token, display_name) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(id) DO UPDATE SET \
               org_id = excluded.org_id, \
               phone_number_id = excluded.phone_number_id, \
               access_token = excluded.access_token, \
               display_name = excluded.display_name",
        )
        .bind(&account.id)
        .bind(&account.org_id)
        .bind(&account.phone_number_id)
        .bind(&account.access_token)
        .bind(&account.display_name)
        .execute(&self.pool)
        .await?;
        debug!(account_id = %account.id, "account stored");
        Ok(())
    }

    /// Fetch an account by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such account exists.
    pub async fn account(&self, id: &str) -> Result<Account, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, org_id, phone_number_id, access_token, display_name \
             FROM accounts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let (id, org_id, phone_number_id, access_token, display_name) =
            row.ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: id.to_owned(),
            })?;
        Ok(Account {
            id,
            org_id,
            phone_number_id,
            access_token,
            display_name,
        })
    }

    /// Add pending recipients to a campaign, preserving input order as
    /// creation order. A phone number already on the campaign (or repeated in
    /// `recipients`) is skipped; only the rows actually created are returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the campaign does not exist, or
    /// [`StoreError::Database`] if an insert fails (no rows are kept then).
    pub async fn add_recipients(
        &self,
        campaign_id: &str,
        recipients: &[NewRecipient],
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>, StoreError> {
        self.campaign(campaign_id).await?;

        let ts = format_ts(now);
        let mut created = Vec::with_capacity(recipients.len());
        let mut tx = self.pool.begin().await?;
        for new in recipients {
            let id = new_id();
            let inserted = sqlx::query(
                "INSERT INTO campaign_recipients \
                 (id, campaign_id, contact_id, phone_number, template_params, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6) \
                 ON CONFLICT(campaign_id, phone_number) DO NOTHING",
            )
            .bind(&id)
            .bind(campaign_id)
            .bind(&new.contact_id)
            .bind(&new.phone_number)
            .bind(encode_params(&new.template_params)?)
            .bind(&ts)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                == 1;
            if !inserted {
                debug!(campaign_id, phone_number = %new.phone_number, "duplicate recipient skipped");
                continue;
            }
            created.push(Recipient {
                id,
                campaign_id: campaign_id.to_owned(),
                contact_id: new.contact_id.clone(),
                phone_number: new.phone_number.clone(),
                template_params: new.template_params.clone(),
                status: RecipientStatus::Pending,
                sent_at: None,
                created_at: now,
            });
        }
        tx.commit().await?;

        info!(campaign_id, count = created.len(), "recipients added");
        Ok(created)
    }

    /// Operator reset: return a campaign's failed recipients to `pending` so
    /// a resumed or new run admits them again. Returns the number reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn reset_failed_recipients(&self, campaign_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE campaign_recipients SET status = 'pending', sent_at = NULL \
             WHERE campaign_id = ?1 AND status = 'failed'",
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        info!(campaign_id, count, "failed recipients reset to pending");
        Ok(count)
    }
}
