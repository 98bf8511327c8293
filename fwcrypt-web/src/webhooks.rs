//! Slack and Teams notifications.
//!
//! A completed report triggers a notification when its risk score exceeds the
//! configured threshold or when any weak or deprecated algorithm is in use. Delivery
//! runs on its own task, outside the analysis; failures are logged and dropped.

use fwcrypt_core::engine::jobs::ReportListener;
use fwcrypt_core::AnalysisReport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub slack_url: Option<String>,
    pub teams_url: Option<String>,
    /// Notify when the risk score is strictly above this value
    pub risk_threshold: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            slack_url: None,
            teams_url: None,
            risk_threshold: 80,
        }
    }
}

/// Whether a report warrants a notification.
pub fn should_notify(report: &AnalysisReport, risk_threshold: u32) -> bool {
    report.compliance.risk_score > risk_threshold || report.compliance.has_weak_algorithm()
}

/// Plain-text notification body.
pub fn summary_text(report: &AnalysisReport) -> String {
    let weak: Vec<&str> = report.compliance.weak_algorithms().collect();
    let mut text = format!(
        "Firmware {} ({}): risk score {} ({})",
        report.display_name(),
        report.architecture.name(),
        report.compliance.risk_score,
        report.compliance.risk_level
    );
    if !weak.is_empty() {
        text.push_str(&format!("; weak algorithms: {}", weak.join(", ")));
    }
    if let Some(first) = report.compliance.recommendations.first() {
        text.push_str(&format!("; top recommendation: {}", first.title));
    }
    text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Slack,
    Teams,
}

impl Target {
    fn name(&self) -> &'static str {
        match self {
            Target::Slack => "Slack",
            Target::Teams => "Teams",
        }
    }

    fn payload(&self, text: &str) -> serde_json::Value {
        match self {
            Target::Slack => serde_json::json!({ "text": text }),
            Target::Teams => serde_json::json!({
                "@type": "MessageCard",
                "@context": "https://schema.org/extensions",
                "summary": "Firmware cryptographic risk",
                "title": "Firmware cryptographic risk",
                "text": text,
            }),
        }
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    targets: Vec<(Target, String)>,
    risk_threshold: u32,
}

impl WebhookNotifier {
    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &WebhookConfig) -> Option<Self> {
        let mut targets: Vec<(Target, String)> = Vec::new();
        if let Some(url) = &config.slack_url {
            targets.push((Target::Slack, url.clone()));
        }
        if let Some(url) = &config.teams_url {
            targets.push((Target::Teams, url.clone()));
        }
        if targets.is_empty() {
            return None;
        }
        let client = match reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build() {
            Ok(client) => client,
            Err(err) => {
                log::warn!("Webhook client unavailable, notifications disabled: {}", err);
                return None;
            }
        };
        log::info!("Webhook notifications enabled for {} targets", targets.len());
        Some(Self {
            client,
            targets,
            risk_threshold: config.risk_threshold,
        })
    }
}

async fn deliver(client: reqwest::Client, target: Target, url: String, payload: serde_json::Value) {
    match client.post(&url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {
            log::debug!("{} webhook delivered", target.name());
        }
        Ok(response) => log::warn!("{} webhook returned status {}", target.name(), response.status()),
        Err(err) => log::warn!("{} webhook failed: {}", target.name(), err),
    }
}

impl ReportListener for WebhookNotifier {
    fn report_ready(&self, report: &Arc<AnalysisReport>) {
        if !should_notify(report, self.risk_threshold) {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("No runtime for webhook delivery of {}", report.content_hash);
                return;
            }
        };
        let text: String = summary_text(report);
        log::info!("Notifying webhooks for {}", report.content_hash);
        for (target, url) in self.targets.iter() {
            runtime.spawn(deliver(self.client.clone(), *target, url.clone(), target.payload(&text)));
        }
    }
}
