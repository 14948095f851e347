//! External send collaborator.
//!
//! The dispatcher only sees [`MessageProvider`]: given account credentials, a
//! destination and a rendered template, return the provider's message id or
//! fail. [`http::HttpProvider`] speaks the Graph-style messages API.

pub mod http;
pub mod template;

use async_trait::async_trait;
use regex::Regex;

pub use self::http::HttpProvider;
pub use self::template::{render, RenderedTemplate, TemplateError};

use crate::store::Account;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by message providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure (connect, timeout, body read).
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Upstream responded with a non-success status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },

    /// Response did not carry a message id.
    #[error("provider response parse error: {0}")]
    Parse(String),

    /// The account cannot send (missing phone number id or token).
    #[error("account {0} has no usable credentials")]
    Credentials(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Sends one templated message.
///
/// Implementations must be `Send + Sync` so one instance can serve every
/// dispatcher tick.
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Send `message` to `to` from `account`; returns the provider message id.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport failure, any non-2xx response,
    /// or a response without a message id.
    async fn send(
        &self,
        account: &Account,
        to: &str,
        message: &RenderedTemplate,
    ) -> Result<String, ProviderError>;
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Maximum characters of an error body kept in `last_error`.
const MAX_ERROR_BODY_CHARS: usize = 256;

/// Check HTTP response status and return the body text or a structured error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure and
/// `ProviderError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_error_body(&body),
        });
    }
    Ok(body)
}

/// Collapse whitespace, redact bearer tokens and truncate.
pub fn sanitize_error_body(raw: &str) -> String {
    let mut sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    for pattern in [r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}", r"EAA[A-Za-z0-9]{20,}"] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}
