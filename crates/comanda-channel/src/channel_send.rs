//! Single-message dispatch through the external channel.
//!
//! [`MessageDispatcher::send`] never returns `Err`: every failure mode,
//! transport or provider, resolves through `SendResult { success: false }`
//! so campaign loops and panel actions share one uniform outcome shape.
//! Group identifiers ride the identical path; the transport layer does not
//! distinguish them from individual recipients.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::channel_provider::ChannelProviderConfig;

const SEND_NETWORK_ERROR_DETAIL: &str = "network error";
const SEND_DETAIL_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Per-recipient outcome of one dispatch attempt.
pub struct SendResult {
    pub success: bool,
    pub error: Option<String>,
}

impl SendResult {
    pub fn delivered() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(detail.into()),
        }
    }
}

/// Dispatch seam between the campaign runner and the provider transport.
#[async_trait]
pub trait OutboundSender {
    async fn send(&self, recipient: &str, content: &str, media_url: Option<&str>) -> SendResult;
}

#[derive(Debug, Clone)]
/// Reqwest-backed [`OutboundSender`] for the provider's message endpoint.
pub struct MessageDispatcher {
    http: reqwest::Client,
    config: ChannelProviderConfig,
}

impl MessageDispatcher {
    pub fn new(mut config: ChannelProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms.max(1)))
            .build()
            .context("failed to create message dispatcher client")?;
        config.api_base = config.api_base.trim_end_matches('/').to_string();
        Ok(Self { http, config })
    }

    fn messages_endpoint(&self) -> String {
        format!(
            "{}/api/channels/{}/messages",
            self.config.api_base, self.config.channel_id
        )
    }
}

#[async_trait]
impl OutboundSender for MessageDispatcher {
    async fn send(&self, recipient: &str, content: &str, media_url: Option<&str>) -> SendResult {
        // The provider rejects numeric recipient types; the payload always
        // carries a JSON string.
        let mut body = json!({
            "recipient": recipient,
            "content": content,
        });
        if let Some(url) = media_url {
            body["media_url"] = json!(url);
        }

        let mut request = self.http.post(self.messages_endpoint()).json(&body);
        if let Some(token) = self
            .config
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
        {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(_) => return SendResult::failed(SEND_NETWORK_ERROR_DETAIL),
        };
        let status = response.status();
        if status.is_success() {
            return SendResult::delivered();
        }
        let body_raw = response.text().await.unwrap_or_default();
        let detail = extract_provider_error(&body_raw)
            .unwrap_or_else(|| format!("provider returned http {}", status.as_u16()));
        SendResult::failed(detail)
    }
}

/// Coerces a panel-layer recipient value into the string form the provider
/// requires. Numbers are stringified; anything else is rejected.
pub fn normalize_recipient(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Best-effort extraction of a human-readable message from a provider error
/// body. Preference order: field-error array, flat message string, truncated
/// opaque body. Empty bodies yield `None`.
pub fn extract_provider_error(body_raw: &str) -> Option<String> {
    let trimmed = body_raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(items) = value.get("errors").and_then(Value::as_array) {
            for item in items {
                let message = item
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| {
                        item.get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .map(|message| message.trim().to_string())
                    .filter(|message| !message.is_empty());
                if let Some(message) = message {
                    return Some(message);
                }
            }
        }
        for key in ["message", "error", "detail"] {
            if let Some(message) = value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|message| !message.is_empty())
            {
                return Some(message.to_string());
            }
        }
    }
    Some(truncate_detail(trimmed))
}

fn truncate_detail(raw: &str) -> String {
    if raw.chars().count() <= SEND_DETAIL_MAX_CHARS {
        return raw.to_string();
    }
    let mut output: String = raw.chars().take(SEND_DETAIL_MAX_CHARS).collect();
    output.push_str("...");
    output
}
