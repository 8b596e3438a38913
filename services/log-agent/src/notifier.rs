//! Notification delivery.
//!
//! Senders are fire-and-forget: a failed delivery is logged and dropped, it
//! never reaches the worker that produced the alert.
//!
//! Supported channels:
//! - ntfy (`POST {url}/{topic}` with Title/Tags/Priority headers)
//! - Generic JSON webhook

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::AppConfig;

/// ntfy rejects larger bodies as attachments.
const NTFY_MAX_BODY_CHARS: usize = 3900;

/// Timeout for every outgoing notification request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A single alert or lifecycle message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    /// Container name, or the agent itself for lifecycle messages.
    pub source: String,

    pub title: String,
    pub body: String,

    /// Keywords that triggered the alert (empty for lifecycle messages).
    pub keywords: Vec<String>,

    /// Host label, set when more than one engine host is monitored.
    pub hostname: Option<String>,
}

impl Notification {
    /// Title as delivered, prefixed with the host label when there is one.
    pub fn display_title(&self) -> String {
        match &self.hostname {
            Some(host) => format!("[{}] - {}", host, self.title),
            None => self.title.clone(),
        }
    }
}

/// Delivers notifications to the configured channels.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `notification` using the channels in `config`. Never fails.
    async fn notify(&self, config: &AppConfig, notification: Notification);
}

// =============================================================================
// HTTP Notifier
// =============================================================================

/// reqwest-backed ntfy and webhook sender.
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client })
    }

    async fn send_ntfy(&self, request: NtfyRequest) {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Title", request.title)
            .header("Tags", request.tags)
            .header("Priority", request.priority)
            .body(request.body);

        builder = match request.auth {
            Some(NtfyAuth::Bearer(token)) => builder.bearer_auth(token),
            Some(NtfyAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            None => builder,
        };

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                info!(url = %request.url, "ntfy notification sent");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, "ntfy rejected notification");
            }
            Err(e) => {
                error!(error = %e, "Failed to reach ntfy");
            }
        }
    }

    async fn send_webhook(&self, url: &str, headers: &[(String, String)], payload: &WebhookPayload) {
        let mut builder = self.client.post(url).json(payload);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                info!(url = %url, "Webhook sent");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(url = %url, status = %status, body = %body, "Webhook rejected notification");
            }
            Err(e) => {
                error!(url = %url, error = %e, "Failed to send webhook");
            }
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, config: &AppConfig, notification: Notification) {
        debug!(source = %notification.source, title = %notification.title, "Dispatching notification");

        if let Some(request) = ntfy_request(config, &notification) {
            self.send_ntfy(request).await;
        }

        if let Some(webhook) = &config.notifications.webhook {
            let url = config
                .container(&notification.source)
                .and_then(|c| c.webhook_url.clone())
                .unwrap_or_else(|| webhook.url.clone());
            let headers: Vec<_> = webhook
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.send_webhook(&url, &headers, &WebhookPayload::from(&notification))
                .await;
        }
    }
}

// =============================================================================
// Request building
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum NtfyAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NtfyRequest {
    url: String,
    title: String,
    tags: String,
    priority: String,
    body: String,
    auth: Option<NtfyAuth>,
}

/// Build the ntfy request, applying per-container topic/tags/priority overrides.
fn ntfy_request(config: &AppConfig, notification: &Notification) -> Option<NtfyRequest> {
    let ntfy = config.notifications.ntfy.as_ref()?;
    let container = config.container(&notification.source);

    let topic = container
        .and_then(|c| c.ntfy_topic.clone())
        .unwrap_or_else(|| ntfy.topic.clone());
    let tags = container
        .and_then(|c| c.ntfy_tags.clone())
        .unwrap_or_else(|| ntfy.tags.clone());
    let priority = container
        .and_then(|c| c.ntfy_priority.clone())
        .unwrap_or_else(|| ntfy.priority.clone());

    let auth = match (&ntfy.token, &ntfy.username, &ntfy.password) {
        (Some(token), _, _) => Some(NtfyAuth::Bearer(token.clone())),
        (None, Some(username), Some(password)) => Some(NtfyAuth::Basic {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };

    Some(NtfyRequest {
        url: format!("{}/{}", ntfy.url.trim_end_matches('/'), topic),
        title: notification.display_title(),
        tags,
        priority,
        body: shorten(notification.body.trim(), NTFY_MAX_BODY_CHARS),
        auth,
    })
}

/// Cut `body` to `limit` characters, flagging that it was shortened.
fn shorten(body: &str, limit: usize) -> String {
    if body.chars().count() <= limit {
        return body.to_string();
    }
    let kept: String = body.chars().take(limit).collect();
    format!("This message had to be shortened: \n{kept}")
}

#[derive(Debug, Serialize, PartialEq)]
struct WebhookPayload {
    container: String,
    keywords: Vec<String>,
    title: String,
    message: String,
    host: Option<String>,
}

impl From<&Notification> for WebhookPayload {
    fn from(notification: &Notification) -> Self {
        Self {
            container: notification.source.clone(),
            keywords: notification.keywords.clone(),
            title: notification.display_title(),
            message: notification.body.trim().to_string(),
            host: notification.hostname.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn config() -> AppConfig {
        AppConfig::from_text(
            r#"
containers:
  web:
    keywords: [error]
    ntfy_topic: web-alerts
    ntfy_priority: "5"
  db: [deadlock]
notifications:
  ntfy:
    url: http://ntfy.local/
    topic: alerts
    token: secret
"#,
            FileFormat::Yaml,
        )
        .unwrap()
    }

    fn notification(source: &str) -> Notification {
        Notification {
            source: source.to_string(),
            title: "'error' found in web".to_string(),
            body: "  something broke \n".to_string(),
            keywords: vec!["error".to_string()],
            hostname: None,
        }
    }

    #[test]
    fn test_display_title_with_host() {
        let mut n = notification("web");
        assert_eq!(n.display_title(), "'error' found in web");

        n.hostname = Some("nas".to_string());
        assert_eq!(n.display_title(), "[nas] - 'error' found in web");
    }

    #[test]
    fn test_ntfy_request_uses_container_overrides() {
        let request = ntfy_request(&config(), &notification("web")).unwrap();

        assert_eq!(request.url, "http://ntfy.local/web-alerts");
        assert_eq!(request.priority, "5");
        assert_eq!(request.tags, "kite,mag");
        assert_eq!(request.body, "something broke");
        assert_eq!(request.auth, Some(NtfyAuth::Bearer("secret".to_string())));
    }

    #[test]
    fn test_ntfy_request_falls_back_to_global() {
        let request = ntfy_request(&config(), &notification("db")).unwrap();
        assert_eq!(request.url, "http://ntfy.local/alerts");
        assert_eq!(request.priority, "3");
    }

    #[test]
    fn test_no_ntfy_without_config() {
        let mut config = config();
        config.notifications.ntfy = None;
        assert!(ntfy_request(&config, &notification("web")).is_none());
    }

    #[test]
    fn test_shorten_long_body() {
        assert_eq!(shorten("short", 10), "short");

        let long = "ü".repeat(20);
        let shortened = shorten(&long, 10);
        assert!(shortened.starts_with("This message had to be shortened"));
        assert!(shortened.ends_with(&"ü".repeat(10)));
        assert_eq!(shortened.matches('ü').count(), 10);
    }

    #[test]
    fn test_webhook_payload_shape() {
        let mut n = notification("web");
        n.hostname = Some("nas".to_string());

        let value = serde_json::to_value(WebhookPayload::from(&n)).unwrap();
        assert_eq!(value["container"], "web");
        assert_eq!(value["keywords"][0], "error");
        assert_eq!(value["title"], "[nas] - 'error' found in web");
        assert_eq!(value["message"], "something broke");
        assert_eq!(value["host"], "nas");
    }
}
