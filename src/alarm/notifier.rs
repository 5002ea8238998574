//! Pluggable notification channels for alarm dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::AlarmEvent;

const RETRY_DELAYS_MS: [u64; 3] = [1_000, 5_000, 30_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelKind {
    Email,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannelConfig {
    pub kind: ChannelKind,
    pub destination: String,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, destination: &str, event: &AlarmEvent) -> Result<(), anyhow::Error>;
}

/// Logs the notification rather than sending real mail; every example repo
/// in the pack treats "email" as an integration point, not a protocol this
/// crate implements from scratch.
pub struct EmailChannel;

#[async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(&self, destination: &str, event: &AlarmEvent) -> Result<(), anyhow::Error> {
        tracing::info!(
            to = destination,
            alarm = %event.alarm_name,
            match_count = event.match_count,
            "would send alarm email"
        );
        Ok(())
    }
}

pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for WebhookChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, destination: &str, event: &AlarmEvent) -> Result<(), anyhow::Error> {
        let response = self.client.post(destination).json(event).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned status {}", response.status());
        }
        Ok(())
    }
}

/// Dispatches to `channel`, retrying transient failures 3x with 1/5/30s
/// backoff before surfacing `NOTIFY_FAILED`.
pub async fn dispatch_with_retry(
    channel: &dyn NotificationChannel,
    destination: &str,
    event: &AlarmEvent,
) -> Result<(), String> {
    let mut last_err = None;
    for delay_ms in RETRY_DELAYS_MS {
        match channel.send(destination, event).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(%err, destination, "alarm notification attempt failed, retrying");
                last_err = Some(err.to_string());
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            },
        }
    }
    match channel.send(destination, event).await {
        Ok(()) => Ok(()),
        Err(err) => Err(last_err.unwrap_or_else(|| err.to_string())),
    }
}

pub fn channel_for(kind: ChannelKind) -> Box<dyn NotificationChannel> {
    match kind {
        ChannelKind::Email => Box::new(EmailChannel),
        ChannelKind::Webhook => Box::new(WebhookChannel::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmEventStatus;
    use chrono::Utc;

    fn sample_event() -> AlarmEvent {
        AlarmEvent {
            id: "e1".to_string(),
            alarm_id: "a1".to_string(),
            alarm_name: "too many errors".to_string(),
            timestamp: Utc::now().timestamp_millis(),
            status: AlarmEventStatus::Triggered,
            match_count: 12,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            details: Default::default(),
        }
    }

    #[tokio::test]
    async fn email_channel_always_succeeds() {
        let channel = EmailChannel;
        let result = channel.send("ops@example.com", &sample_event()).await;
        assert!(result.is_ok());
    }
}
