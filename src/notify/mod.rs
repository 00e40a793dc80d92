//! Provider-polymorphic notification dispatch.
//!
//! Each channel names a provider kind; each kind has its own request shape
//! and success rule. A failed send leaves the message undelivered — the next
//! sync pass retries it, so there is no retry counter or backoff here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::DaemonConfig;
use crate::storage::{ChannelRow, MessageRow};

/// Provider requests are small JSON posts; anything slower than this is a
/// failed send (the original service used the same bound).
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ProviderKind ─────────────────────────────────────────────────────────────

/// The notification dialects we can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Chat-bot push API: `{appkey, title, content[, group_id]}`; the
    /// response carries a payload-level `success` flag.
    Pushbot,
    /// Enterprise-chat webhook: token appended to the URL, text payload.
    Wecom,
    /// Generic webhook: flat JSON post, HTTP 200 is success.
    Webhook,
}

impl ProviderKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "pushbot" => Some(Self::Pushbot),
            "wecom" => Some(Self::Wecom),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pushbot => "pushbot",
            Self::Wecom => "wecom",
            Self::Webhook => "webhook",
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Why a single notification did not go out. Never fatal to a batch: the
/// orchestrator records the string and moves on to the next message.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("unsupported notification provider '{0}'")]
    UnsupportedProvider(String),
    #[error("no endpoint configured for provider '{0}'")]
    MissingEndpoint(&'static str),
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("provider rejected the notification: {0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

// ─── Payload rendering ────────────────────────────────────────────────────────

/// Notification title: the subject, or an explicit placeholder — providers
/// render an empty title as a blank card.
pub fn notification_title(message: &MessageRow) -> String {
    if message.subject.trim().is_empty() {
        "(no subject)".to_string()
    } else {
        message.subject.clone()
    }
}

/// Human-readable notification body embedding the message metadata. A
/// missing body renders as an explicit placeholder, never a silent blank.
pub fn notification_body(message: &MessageRow) -> String {
    let body = match message.body_text.as_deref() {
        Some(text) if !text.trim().is_empty() => text,
        _ => "(no body)",
    };
    format!(
        "From: {}\nTo: {}\nReceived: {}\nSubject: {}\nBody:\n{}",
        message.sender,
        message.account,
        message.reception_time,
        notification_title(message),
        body
    )
}

/// Build the target URL and JSON payload for one provider send.
///
/// Pure — unit-testable without a network.
fn build_request(
    kind: ProviderKind,
    endpoint: &str,
    channel: &ChannelRow,
    title: &str,
    body: &str,
) -> (String, Value) {
    match kind {
        ProviderKind::Pushbot => {
            let mut payload = json!({
                "appkey": channel.token,
                "title": title,
                "content": body,
            });
            if let Some(group) = channel.chat_id.as_deref() {
                payload["group_id"] = json!(group);
            }
            (endpoint.to_string(), payload)
        }
        ProviderKind::Wecom => (
            // The webhook key is the final URL path component.
            format!("{}{}", endpoint, channel.token),
            json!({
                "msgtype": "text",
                "text": { "content": format!("{title}\n{body}") },
            }),
        ),
        ProviderKind::Webhook => (
            endpoint.to_string(),
            json!({
                "appkey": channel.token,
                "title": title,
                "message": body,
                "channel": channel.name,
            }),
        ),
    }
}

/// Payload-level success rule for the pushbot API.
fn pushbot_accepted(response: &Value) -> Result<(), NotifyError> {
    if response.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    let detail = response
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("provider reported failure")
        .to_string();
    Err(NotifyError::Rejected(detail))
}

// ─── Notifier ─────────────────────────────────────────────────────────────────

/// The dispatch seam the sync core depends on; tests substitute their own.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one notification through the channel's provider. `Ok(())` means
    /// the provider confirmed the send — only then may the caller mark the
    /// message delivered.
    async fn send(&self, channel: &ChannelRow, message: &MessageRow) -> Result<(), NotifyError>;
}

/// Real HTTP dispatcher over the configured provider endpoints.
pub struct Dispatcher {
    client: reqwest::Client,
    endpoints: HashMap<ProviderKind, String>,
}

impl Dispatcher {
    pub fn new(config: &DaemonConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        let mut endpoints = HashMap::new();
        for provider in &config.providers {
            if let Some(kind) = ProviderKind::parse(&provider.kind) {
                endpoints.insert(kind, provider.endpoint.clone());
            }
        }
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl Notifier for Dispatcher {
    async fn send(&self, channel: &ChannelRow, message: &MessageRow) -> Result<(), NotifyError> {
        let kind = ProviderKind::parse(&channel.provider)
            .ok_or_else(|| NotifyError::UnsupportedProvider(channel.provider.clone()))?;
        let endpoint = self
            .endpoints
            .get(&kind)
            .ok_or(NotifyError::MissingEndpoint(kind.as_str()))?;

        let title = notification_title(message);
        let body = notification_body(message);
        let (url, payload) = build_request(kind, endpoint, channel, &title, &body);

        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        if kind == ProviderKind::Pushbot {
            let parsed: Value = response.json().await?;
            pushbot_accepted(&parsed)?;
        }

        debug!(
            provider = kind.as_str(),
            channel = %channel.name,
            sender = %message.sender,
            "notification sent"
        );
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
