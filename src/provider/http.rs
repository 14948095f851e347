//! Graph-style messages API client.
//!
//! `POST {base_url}/{api_version}/{phone_number_id}/messages` with the
//! account's access token as a bearer credential. The response carries the
//! accepted message id at `messages[0].id`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{check_http_response, MessageProvider, ProviderError, RenderedTemplate};
use crate::config::ProviderConfig;
use crate::store::Account;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Messages API client.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

impl HttpProvider {
    /// Create a client from provider configuration.
    pub fn new(config: &ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_version: config.api_version.trim_matches('/').to_owned(),
        }
    }

    /// Endpoint for sending from `phone_number_id`.
    pub fn messages_url(&self, phone_number_id: &str) -> String {
        format!("{}/{}/{phone_number_id}/messages", self.base_url, self.api_version)
    }
}

/// Extract the provider message id from a success body.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] if the body is not JSON or has no id.
pub fn parse_message_id(body: &str) -> Result<String, ProviderError> {
    let parsed: SendResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    parsed
        .messages
        .into_iter()
        .next()
        .map(|m| m.id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProviderError::Parse("response has no message id".to_owned()))
}

#[async_trait]
impl MessageProvider for HttpProvider {
    async fn send(
        &self,
        account: &Account,
        to: &str,
        message: &RenderedTemplate,
    ) -> Result<String, ProviderError> {
        if account.phone_number_id.is_empty() || account.access_token.is_empty() {
            return Err(ProviderError::Credentials(account.id.clone()));
        }

        let body = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "template",
            "template": message.template,
        });

        let response = self
            .client
            .post(self.messages_url(&account.phone_number_id))
            .bearer_auth(&account.access_token)
            .json(&body)
            .send()
            .await?;
        let text = check_http_response(response).await?;
        let id = parse_message_id(&text)?;
        debug!(account_id = %account.id, message_id = %id, "provider accepted message");
        Ok(id)
    }
}
