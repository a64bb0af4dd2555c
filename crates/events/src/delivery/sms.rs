//! SMS delivery through an HTTP gateway.
//!
//! [`HttpSmsSender`] POSTs `{to, from, body}` as JSON to `SMS_API_URL`,
//! authenticating with a bearer token when `SMS_API_TOKEN` is set.

use std::time::Duration;

use async_trait::async_trait;
use beacon_core::notification::Priority;

use super::{DeliveryError, SmsSender};

/// Longest SMS body sent, in characters.
pub const SMS_MAX_LEN: usize = 160;

/// HTTP request timeout for a single gateway call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const ELLIPSIS: &str = "...";

/// Render the SMS text for a notification: a priority prefix for high and
/// urgent messages, then `title: message`, capped at [`SMS_MAX_LEN`].
pub fn format_sms(priority: Priority, title: &str, message: &str) -> String {
    let prefix = match priority {
        Priority::Urgent => "URGENT: ",
        Priority::High => "HIGH: ",
        Priority::Low | Priority::Medium => "",
    };
    let text = format!("{prefix}{title}: {message}");
    if text.chars().count() <= SMS_MAX_LEN {
        return text;
    }
    let keep = SMS_MAX_LEN - ELLIPSIS.len();
    let mut capped: String = text.chars().take(keep).collect();
    capped.push_str(ELLIPSIS);
    capped
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("SMS gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The gateway returned a non-2xx status code.
    #[error("SMS gateway returned HTTP {0}")]
    HttpStatus(u16),
}

// ---------------------------------------------------------------------------
// SmsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub from: Option<String>,
}

impl SmsConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` if `SMS_API_URL` is not set.
    ///
    /// | Variable        | Required | Default |
    /// |-----------------|----------|---------|
    /// | `SMS_API_URL`   | yes      | -       |
    /// | `SMS_API_TOKEN` | no       | -       |
    /// | `SMS_FROM`      | no       | -       |
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_url: std::env::var("SMS_API_URL").ok()?,
            api_token: std::env::var("SMS_API_TOKEN").ok(),
            from: std::env::var("SMS_FROM").ok(),
        })
    }
}

// ---------------------------------------------------------------------------
// HttpSmsSender
// ---------------------------------------------------------------------------

pub struct HttpSmsSender {
    client: reqwest::Client,
    config: SmsConfig,
}

impl HttpSmsSender {
    pub fn new(config: SmsConfig) -> Result<Self, SmsError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, config })
    }

    async fn try_send(&self, to: &str, text: &str) -> Result<(), SmsError> {
        let payload = serde_json::json!({
            "to": to,
            "from": self.config.from,
            "body": text,
        });
        let mut request = self.client.post(&self.config.api_url).json(&payload);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SmsError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    async fn send_sms(&self, to: &str, text: &str) -> Result<(), DeliveryError> {
        self.try_send(to, text).await?;
        tracing::info!(to, chars = text.chars().count(), "Notification SMS sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_messages_are_prefixed() {
        assert_eq!(
            format_sms(Priority::Urgent, "Server down", "api-1 is unreachable"),
            "URGENT: Server down: api-1 is unreachable"
        );
        assert_eq!(format_sms(Priority::High, "T", "M"), "HIGH: T: M");
        assert_eq!(format_sms(Priority::Medium, "T", "M"), "T: M");
    }

    #[test]
    fn long_messages_are_capped_with_ellipsis() {
        let text = format_sms(Priority::Low, "Weekly report", &"x".repeat(400));
        assert_eq!(text.chars().count(), SMS_MAX_LEN);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn cap_counts_characters_not_bytes() {
        let text = format_sms(Priority::Low, "Grüße", &"é".repeat(200));
        assert_eq!(text.chars().count(), SMS_MAX_LEN);
    }

    #[test]
    fn sms_error_display_http_status() {
        assert_eq!(
            SmsError::HttpStatus(502).to_string(),
            "SMS gateway returned HTTP 502"
        );
    }
}
