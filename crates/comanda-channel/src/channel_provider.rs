//! HTTP client for the external messaging provider's channel endpoints.
//!
//! The provider API is eventually consistent: a 404 from the status endpoint
//! means "no active session", not a transport error, so probes fold every
//! HTTP response into a domain status and reserve `Err` for genuine network
//! failures. Callers decide whether that `Err` degrades or surfaces (the
//! forced-versus-unforced asymmetry lives in the connection controller).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::channel_send::extract_provider_error;
use crate::channel_status::{parse_channel_status, ChannelStatus};

const DEFAULT_PROVIDER_HTTP_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
/// Connection settings for one provider-managed channel.
pub struct ChannelProviderConfig {
    pub api_base: String,
    pub channel_id: String,
    pub api_token: Option<String>,
    pub http_timeout_ms: u64,
}

impl Default for ChannelProviderConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000".to_string(),
            channel_id: "default".to_string(),
            api_token: None,
            http_timeout_ms: DEFAULT_PROVIDER_HTTP_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Network-level probe failure, distinct from any HTTP response.
pub struct ProbeTransportError {
    pub detail: String,
}

impl ProbeTransportError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ProbeTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status probe transport failure: {}", self.detail)
    }
}

impl std::error::Error for ProbeTransportError {}

/// Provider operations the connection controller drives.
///
/// Implemented by [`ChannelProviderClient`] for the real provider and by
/// scripted fakes in tests.
#[async_trait]
pub trait ChannelGateway {
    /// Initiates channel bring-up on the provider side.
    async fn deploy(&self) -> Result<()>;

    /// Fetches the pairing QR image. Non-image bodies are a hard error.
    async fn fetch_qr(&self) -> Result<Vec<u8>>;

    /// Single-shot status query. Any HTTP response, 404 included, yields
    /// `Ok`; only a network failure yields `Err`.
    async fn probe_status(&self) -> Result<ChannelStatus, ProbeTransportError>;

    /// Tears the channel session down. A 404 is success (already gone).
    async fn disconnect(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
/// Reqwest-backed [`ChannelGateway`] implementation.
pub struct ChannelProviderClient {
    http: reqwest::Client,
    config: ChannelProviderConfig,
}

impl ChannelProviderClient {
    pub fn new(mut config: ChannelProviderConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("comanda-panel"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.http_timeout_ms.max(1)))
            .build()
            .context("failed to create channel provider client")?;
        config.api_base = config.api_base.trim_end_matches('/').to_string();
        Ok(Self { http, config })
    }

    fn endpoint(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!(
                "{}/api/channels/{}",
                self.config.api_base, self.config.channel_id
            )
        } else {
            format!(
                "{}/api/channels/{}/{}",
                self.config.api_base, self.config.channel_id, suffix
            )
        }
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(token) = self
            .config
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
        {
            request = request.bearer_auth(token);
        }
        request
    }
}

#[async_trait]
impl ChannelGateway for ChannelProviderClient {
    async fn deploy(&self) -> Result<()> {
        let response = self
            .request(Method::POST, self.endpoint("start"))
            .send()
            .await
            .context("deploy request failed")?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        bail!(
            "provider rejected deploy with http {}: {}",
            status.as_u16(),
            extract_provider_error(&body).unwrap_or_else(|| "no detail".to_string())
        );
    }

    async fn fetch_qr(&self) -> Result<Vec<u8>> {
        let response = self
            .request(Method::GET, self.endpoint("qr"))
            .send()
            .await
            .context("qr request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("provider rejected qr fetch with http {}", status.as_u16());
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("image/")
        {
            bail!("qr endpoint returned non-image content-type '{content_type}'");
        }
        let bytes = response.bytes().await.context("failed to read qr body")?;
        Ok(bytes.to_vec())
    }

    async fn probe_status(&self) -> Result<ChannelStatus, ProbeTransportError> {
        let response = self
            .request(Method::GET, self.endpoint("status"))
            .send()
            .await
            .map_err(|error| ProbeTransportError::new(error.to_string()))?;
        if !response.status().is_success() {
            // 404 means "no active session" on this provider.
            return Ok(ChannelStatus::Disconnected);
        }
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(parse_channel_status(&body))
    }

    async fn disconnect(&self) -> Result<()> {
        let response = self
            .request(Method::DELETE, self.endpoint(""))
            .send()
            .await
            .context("disconnect request failed")?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        bail!(
            "provider rejected disconnect with http {}: {}",
            status.as_u16(),
            extract_provider_error(&body).unwrap_or_else(|| "no detail".to_string())
        );
    }
}
