//! Alert delivery. The engine only knows the [`Notifier`] trait; the
//! concrete channel is picked at startup from config.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::state::{Alert, Severity};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, alert: &Alert) -> Result<()>;
}

/// Posts alert cards to a chat webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    dashboard_url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, dashboard_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self {
            client,
            url: url.into(),
            dashboard_url: dashboard_url.into(),
        })
    }

    fn severity_icon(severity: Severity) -> &'static str {
        match severity {
            Severity::Critical => "\u{1F525}",
            Severity::Warning => "\u{26A0}\u{FE0F}",
            Severity::Info => "\u{2139}\u{FE0F}",
        }
    }

    fn severity_label(severity: Severity) -> &'static str {
        match severity {
            Severity::Critical => "CRITICAL",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        }
    }

    fn build_card(&self, alert: &Alert) -> serde_json::Value {
        let mut widgets: Vec<serde_json::Value> = vec![json!({
            "decoratedText": { "topLabel": "Message", "text": alert.message }
        })];
        let mut keys: Vec<_> = alert.details.keys().collect();
        keys.sort();
        for key in keys {
            let value = &alert.details[key];
            let text = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            widgets.push(json!({
                "decoratedText": { "topLabel": key, "text": text }
            }));
        }
        widgets.push(json!({
            "decoratedText": {
                "topLabel": "Triggered",
                "text": alert.triggered_at.to_rfc3339()
            }
        }));

        let mut sections = vec![json!({ "widgets": widgets })];
        if !self.dashboard_url.is_empty() {
            sections.push(json!({
                "widgets": [{
                    "buttonList": {
                        "buttons": [{
                            "text": "Open dashboard",
                            "onClick": { "openLink": { "url": self.dashboard_url } }
                        }]
                    }
                }]
            }));
        }

        json!({
            "text": format!(
                "{} {}: {} on {}",
                Self::severity_icon(alert.severity),
                Self::severity_label(alert.severity),
                alert.alert_type,
                alert.agent_name
            ),
            "cardsV2": [{
                "cardId": alert.id,
                "card": {
                    "header": {
                        "title": format!(
                            "{} {}: {}",
                            Self::severity_icon(alert.severity),
                            Self::severity_label(alert.severity),
                            alert.alert_type
                        ),
                        "subtitle": alert.agent_name
                    },
                    "sections": sections
                }
            }]
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        // Same agent+type lands in the same chat thread.
        let thread_key = format!("{}-{}", alert.agent_name, alert.alert_type);
        let response = self
            .client
            .post(&self.url)
            .query(&[("threadKey", thread_key.as_str())])
            .json(&self.build_card(alert))
            .send()
            .await
            .context("webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {status}: {body}");
        }

        debug!(alert_id = %alert.id, alert_type = %alert.alert_type, "webhook notification delivered");
        Ok(())
    }
}

/// Fallback channel when no webhook is configured: logs the alert.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        info!(
            alert_id = %alert.id,
            agent = %alert.agent_name,
            alert_type = %alert.alert_type,
            severity = ?alert.severity,
            "ALERT: {}",
            alert.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AlertStatus;
    use chrono::Utc;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        let mut details = HashMap::new();
        details.insert("cpu_percent".to_string(), json!(93.5));
        Alert {
            id: "a1".to_string(),
            agent_name: "web-1".to_string(),
            alert_type: "high_cpu".to_string(),
            severity: Severity::Critical,
            message: "CPU usage at 93.5%".to_string(),
            details,
            triggered_at: Utc::now(),
            resolved_at: None,
            status: AlertStatus::Active,
            notified_at: None,
        }
    }

    #[tokio::test]
    async fn webhook_posts_card_with_thread_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(query_param("threadKey", "web-1-high_cpu"))
            .and(body_partial_json(json!({
                "cardsV2": [{ "cardId": "a1" }]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/hook", server.uri()), "https://dash.example").unwrap();
        notifier.send_alert(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri(), "").unwrap();
        assert!(notifier.send_alert(&alert()).await.is_err());
    }

    #[test]
    fn dashboard_button_only_when_configured() {
        let with = WebhookNotifier::new("http://x", "https://dash.example").unwrap();
        let without = WebhookNotifier::new("http://x", "").unwrap();
        let a = alert();

        let card = with.build_card(&a);
        let sections = &card["cardsV2"][0]["card"]["sections"];
        assert_eq!(sections.as_array().unwrap().len(), 2);

        let card = without.build_card(&a);
        let sections = &card["cardsV2"][0]["card"]["sections"];
        assert_eq!(sections.as_array().unwrap().len(), 1);
    }
}
