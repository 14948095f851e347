//! Shared setup for engine tests: seeded store, scripted provider, recording
//! event sink.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use campaign_dispatch::events::EventSink;
use campaign_dispatch::provider::{MessageProvider, ProviderError, RenderedTemplate};
use campaign_dispatch::quota::QuotaTracker;
use campaign_dispatch::store::{Account, Campaign, CampaignRun, NewCampaign, NewRecipient, Store};

pub const ORG: &str = "org-1";
pub const ACCOUNT: &str = "acct-1";

/// Fixed start of every scenario.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// `t0() + secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    t0().checked_add_signed(TimeDelta::seconds(secs))
        .expect("in range")
}

pub async fn setup_store() -> Store {
    Store::open_in_memory().await.expect("store should open")
}

pub fn quota(store: &Store) -> QuotaTracker {
    QuotaTracker::new(store.clone(), 1000)
}

/// Account plus a campaign with `recipients` pending recipients, each
/// carrying one parameter (`name-<i>`).
pub async fn seed_campaign(store: &Store, recipients: usize) -> Campaign {
    store
        .upsert_account(&Account {
            id: ACCOUNT.to_owned(),
            org_id: ORG.to_owned(),
            phone_number_id: "1000".to_owned(),
            access_token: "token".to_owned(),
            display_name: None,
        })
        .await
        .expect("account should save");

    let campaign = store
        .create_campaign(
            &NewCampaign {
                org_id: ORG.to_owned(),
                name: "autumn sale".to_owned(),
                template_name: "autumn_sale".to_owned(),
                language_code: "en_US".to_owned(),
                body_text: "Hi {{1}}, the sale is on".to_owned(),
            },
            t0(),
        )
        .await
        .expect("campaign should save");

    let list: Vec<NewRecipient> = (0..recipients)
        .map(|i| NewRecipient {
            contact_id: Some(format!("contact-{i}")),
            phone_number: format!("+1555000{i:04}"),
            template_params: vec![format!("name-{i}")],
        })
        .collect();
    store
        .add_recipients(&campaign.id, &list, t0())
        .await
        .expect("recipients should save");
    campaign
}

pub async fn schedule_now(store: &Store, campaign: &Campaign, key: &str) -> CampaignRun {
    let (run, created) = store
        .schedule_run(&campaign.id, ACCOUNT, t0(), key, t0())
        .await
        .expect("run should schedule");
    assert!(created);
    run
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// One scripted provider response.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Accept,
    Reject(u16),
}

/// Provider that replays a script, then repeats `fallback`.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    sent_to: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn accepting() -> Arc<Self> {
        Self::scripted(Vec::new(), Step::Accept)
    }

    pub fn rejecting(status: u16) -> Arc<Self> {
        Self::scripted(Vec::new(), Step::Reject(status))
    }

    pub fn scripted(steps: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            fallback,
            sent_to: Mutex::new(Vec::new()),
        })
    }

    /// Destinations of every send call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.sent_to.lock().expect("lock").clone()
    }
}

#[async_trait]
impl MessageProvider for ScriptedProvider {
    async fn send(
        &self,
        _account: &Account,
        to: &str,
        _message: &RenderedTemplate,
    ) -> Result<String, ProviderError> {
        let call = {
            let mut sent = self.sent_to.lock().expect("lock");
            sent.push(to.to_owned());
            sent.len()
        };
        let step = self
            .script
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(self.fallback);
        match step {
            Step::Accept => Ok(format!("wamid.{call}")),
            Step::Reject(status) => Err(ProviderError::HttpStatus {
                status,
                body: "upstream unavailable".to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Event names in publish order.
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, name, _)| name.clone())
            .collect()
    }

    /// Payloads of events named `name`.
    pub fn payloads(&self, name: &str) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter(|(_, n, _)| n == name)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    pub fn orgs(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .map(|(org, _, _)| org.clone())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, org_id: &str, event: &str, payload: serde_json::Value) {
        self.events
            .lock()
            .expect("lock")
            .push((org_id.to_owned(), event.to_owned(), payload));
    }
}
