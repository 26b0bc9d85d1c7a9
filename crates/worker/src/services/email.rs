//! Outbound email delivery.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{error, info, instrument};

use crate::config::BrevoConfig;

const BREVO_BASE_URL: &str = "https://api.brevo.com/v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    /// Provider-side template; when set, content fields are ignored
    pub template_id: Option<i64>,
    pub params: Option<Map<String, JsonValue>>,
}

/// The provider refused or failed to deliver a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// 401/403 from the provider: bad key, or the caller's IP is not allowed.
    #[error("email provider rejected credentials (status {status})")]
    Unauthorized { status: u16 },
    #[error("email provider returned status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("email transport error: {0}")]
    Transport(String),
}

impl DeliveryError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, DeliveryError::Unauthorized { .. })
    }
}

#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

#[async_trait::async_trait]
impl<S> EmailSender for std::sync::Arc<S>
where
    S: EmailSender + ?Sized,
{
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        (**self).send(message).await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendSmtpEmail<'a> {
    sender: Contact<'a>,
    to: [Contact<'a>; 1],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html_content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<JsonValue>,
}

#[derive(Serialize)]
struct Contact<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

/// Brevo transactional email API.
pub struct BrevoEmailSender {
    client: Client,
    base_url: String,
    config: BrevoConfig,
}

impl BrevoEmailSender {
    pub fn new(config: BrevoConfig) -> Result<Self, DeliveryError> {
        Self::with_base_url(config, BREVO_BASE_URL)
    }

    /// Point at a Brevo-compatible endpoint, e.g. a local mock.
    pub fn with_base_url(config: BrevoConfig, base_url: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
        })
    }

    fn body<'a>(&'a self, message: &'a EmailMessage) -> SendSmtpEmail<'a> {
        let templated = message.template_id.is_some();
        SendSmtpEmail {
            sender: Contact {
                email: &self.config.sender_email,
                name: Some(&self.config.sender_name),
            },
            to: [Contact {
                email: &message.to,
                name: None,
            }],
            subject: &message.subject,
            html_content: message.html_content.as_deref().filter(|_| !templated),
            text_content: message.text_content.as_deref().filter(|_| !templated),
            template_id: message.template_id,
            params: templated
                .then(|| JsonValue::Object(message.params.clone().unwrap_or_default())),
        }
    }
}

#[async_trait::async_trait]
impl EmailSender for BrevoEmailSender {
    #[instrument(skip(self, message), fields(to = %message.to), err)]
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(format!("{}/smtp/email", self.base_url))
            .header("api-key", &self.config.api_key)
            .json(&self.body(message))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            info!(to = %message.to, "email sent");
            return Ok(());
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(to = %message.to, status = status.as_u16(), "email provider rejected credentials");
            return Err(DeliveryError::Unauthorized {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Logs messages instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogEmailSender;

#[async_trait::async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            template_id = ?message.template_id,
            params = ?message.params,
            html_len = message.html_content.as_ref().map_or(0, String::len),
            text = message.text_content.as_deref().unwrap_or(""),
            "email not sent (delivery disabled)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sender() -> BrevoEmailSender {
        BrevoEmailSender::new(BrevoConfig {
            api_key: "xkeysib-test".to_string(),
            sender_name: "Courier".to_string(),
            sender_email: "noreply@example.com".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn content_message_body() {
        let sender = sender();
        let message = EmailMessage {
            to: "a@example.com".to_string(),
            subject: "Hi".to_string(),
            html_content: Some("<p>Hi</p>".to_string()),
            text_content: Some("Hi".to_string()),
            ..EmailMessage::default()
        };

        let body = serde_json::to_value(sender.body(&message)).unwrap();
        assert_eq!(
            body,
            json!({
                "sender": {"email": "noreply@example.com", "name": "Courier"},
                "to": [{"email": "a@example.com"}],
                "subject": "Hi",
                "htmlContent": "<p>Hi</p>",
                "textContent": "Hi"
            })
        );
    }

    #[test]
    fn template_message_drops_content() {
        let sender = sender();
        let message = EmailMessage {
            to: "a@example.com".to_string(),
            subject: "Hi".to_string(),
            html_content: Some("<p>ignored</p>".to_string()),
            template_id: Some(12),
            ..EmailMessage::default()
        };

        let body = serde_json::to_value(sender.body(&message)).unwrap();
        assert_eq!(body["templateId"], json!(12));
        assert_eq!(body["params"], json!({}));
        assert!(body.get("htmlContent").is_none());
    }

    #[tokio::test]
    async fn log_sender_always_succeeds() {
        let message = EmailMessage {
            to: "a@example.com".to_string(),
            subject: "Hi".to_string(),
            ..EmailMessage::default()
        };
        assert!(LogEmailSender.send(&message).await.is_ok());
    }
}
