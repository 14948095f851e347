//! Template rendering: campaign template + per-recipient parameters.
//!
//! Produces two things from the same inputs: the provider's template object
//! (name, language, positional body parameters) and a plain-text preview of
//! the body for conversation history. Body placeholders are `{{1}}`, `{{2}}`,
//! ... and index the recipient's parameters from one.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::json;

use crate::store::Campaign;

static PLACEHOLDER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\d+)\s*\}\}"));

/// Errors from template rendering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// The campaign has no provider template name.
    #[error("campaign {0} has no template name")]
    MissingTemplateName(String),

    /// A body placeholder has no matching parameter.
    #[error("placeholder {{{{{index}}}}} has no parameter ({provided} provided)")]
    MissingParameter {
        /// One-based placeholder index.
        index: usize,
        /// Parameters the recipient supplied.
        provided: usize,
    },

    /// `{{0}}` or an index too large to address.
    #[error("invalid placeholder {0:?}")]
    InvalidPlaceholder(String),

    /// The placeholder pattern failed to compile.
    #[error("placeholder pattern: {0}")]
    Pattern(String),
}

/// A provider-ready message for one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedTemplate {
    /// Provider template object (`name`, `language`, `components`).
    pub template: serde_json::Value,
    /// Body text with placeholders substituted.
    pub preview: String,
}

/// Render `campaign`'s template for one recipient.
///
/// # Errors
///
/// Returns [`TemplateError`] if the template name is empty or a body
/// placeholder cannot be filled.
pub fn render(campaign: &Campaign, params: &[String]) -> Result<RenderedTemplate, TemplateError> {
    if campaign.template_name.trim().is_empty() {
        return Err(TemplateError::MissingTemplateName(campaign.id.clone()));
    }

    let preview = render_body(&campaign.body_text, params)?;

    let mut template = json!({
        "name": campaign.template_name,
        "language": { "code": campaign.language_code },
    });
    if !params.is_empty() {
        let parameters: Vec<serde_json::Value> = params
            .iter()
            .map(|text| json!({ "type": "text", "text": text }))
            .collect();
        template["components"] = json!([{ "type": "body", "parameters": parameters }]);
    }

    Ok(RenderedTemplate { template, preview })
}

/// Substitute `{{n}}` placeholders in `body` with `params[n - 1]`.
///
/// # Errors
///
/// Returns [`TemplateError::MissingParameter`] for an index past the end of
/// `params` and [`TemplateError::InvalidPlaceholder`] for `{{0}}`.
pub fn render_body(body: &str, params: &[String]) -> Result<String, TemplateError> {
    let pattern = PLACEHOLDER
        .as_ref()
        .map_err(|e| TemplateError::Pattern(e.to_string()))?;

    let mut failure: Option<TemplateError> = None;
    let rendered = pattern.replace_all(body, |caps: &Captures<'_>| {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let index = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .filter(|i| *i > 0);
        match index.and_then(|i| params.get(i.saturating_sub(1)).map(|p| (i, p))) {
            Some((_, value)) => value.clone(),
            None => {
                if failure.is_none() {
                    failure = Some(match index {
                        Some(i) => TemplateError::MissingParameter {
                            index: i,
                            provided: params.len(),
                        },
                        None => TemplateError::InvalidPlaceholder(whole.to_owned()),
                    });
                }
                whole.to_owned()
            }
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(rendered.into_owned()),
    }
}
