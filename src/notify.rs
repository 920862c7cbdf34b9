//! Change notifications.
//!
//! After a sync, the change events detected in that run are filtered by
//! severity and type, rendered into a plain-text alert, and POSTed as
//! `{"text": ...}` to the configured webhook (Slack-compatible).

use anyhow::{bail, Result};
use async_trait::async_trait;

use docmirror_core::models::{ChangeEvent, EventType, Severity};

use crate::config::NotificationsConfig;

/// Recommended follow-ups for an event, most important first.
pub fn recommended_actions(event: &ChangeEvent) -> Vec<&'static str> {
    let mut actions = match event.event_type {
        EventType::BreakingChange => vec![
            "Open migration task and block deploy until compatibility checks pass.",
            "Run integration tests against affected API paths.",
        ],
        EventType::Deprecation => vec![
            "Create deprecation remediation ticket and assign owner.",
            "Identify deprecated usage and schedule replacement changes.",
        ],
        EventType::Updated => vec!["Review updated docs and validate impacted runbooks."],
        EventType::DocumentAdded => {
            vec!["Review newly added docs and update internal integration notes."]
        }
    };
    if event.severity >= Severity::High {
        actions.push("Escalate to platform owner for pre-merge review.");
    }
    actions
}

/// Events worth alerting on, most severe then most recent first.
pub fn select_alert_events<'a>(
    events: &'a [ChangeEvent],
    config: &NotificationsConfig,
) -> Vec<&'a ChangeEvent> {
    let mut selected: Vec<&ChangeEvent> = events
        .iter()
        .filter(|e| e.severity >= config.min_severity)
        .filter(|e| {
            config.include_updated
                || !matches!(e.event_type, EventType::Updated | EventType::DocumentAdded)
        })
        .collect();
    selected.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.detected_at.cmp(&a.detected_at))
    });
    selected.truncate(config.max_events.max(1));
    selected
}

/// Render the alert text, or `None` when nothing passes the filter.
pub fn build_change_message(
    source: &str,
    events: &[ChangeEvent],
    config: &NotificationsConfig,
) -> Option<String> {
    let selected = select_alert_events(events, config);
    if selected.is_empty() {
        return None;
    }

    let mut lines = vec![format!(
        "docmirror change alert for `{}` ({} event{})",
        source,
        selected.len(),
        if selected.len() == 1 { "" } else { "s" }
    )];
    for event in selected {
        let actions = recommended_actions(event);
        lines.push(format!(
            "• [{}] {} - {}",
            event.severity.as_str().to_uppercase(),
            event.event_type,
            event.title
        ));
        lines.push(format!("  {}", event.summary));
        lines.push(format!("  Action: {}", actions[0]));
        lines.push(format!("  {}", event.canonical_url));
    }
    Some(lines.join("\n"))
}

/// Destination for change alerts.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Alert on the events of one run. Sends nothing if no event qualifies.
    async fn notify(&self, source: &str, events: &[ChangeEvent]) -> Result<()>;
}

/// Posts alerts to an incoming-webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
    config: NotificationsConfig,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str, config: NotificationsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
            config,
        }
    }

    /// A notifier for `[notifications]`, or `None` without a webhook URL.
    pub fn from_config(config: &NotificationsConfig) -> Option<Self> {
        config
            .webhook_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| Self::new(url, config.clone()))
    }

    pub async fn post_text(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("webhook failed status={} body={}", status.as_u16(), body);
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeNotifier for WebhookNotifier {
    async fn notify(&self, source: &str, events: &[ChangeEvent]) -> Result<()> {
        let Some(text) = build_change_message(source, events, &self.config) else {
            return Ok(());
        };
        self.post_text(&text).await?;
        tracing::info!(source = %source, "sent change alert");
        Ok(())
    }
}
