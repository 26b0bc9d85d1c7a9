//! `email-queue` processor.

use serde_json::{json, Value as JsonValue};
use tracing::{error, info, warn};

use courier_infra::jobs::{Job, JobHandler, ProcessError};

use crate::payloads::{
    decode, CustomEmailJob, PasswordResetEmailJob, WelcomeEmailJob, CUSTOM_EMAIL,
    PASSWORD_RESET_EMAIL, WELCOME_EMAIL,
};
use crate::services::{DeliveryError, EmailMessage, EmailSender};
use crate::templates::{self, EmailTemplate};

/// Handles every job type of `email-queue`.
pub struct EmailProcessor<S> {
    sender: S,
    /// Treat provider authorization failures on welcome emails as success
    soft_fail_unauthorized: bool,
}

impl<S: EmailSender> EmailProcessor<S> {
    pub fn new(sender: S, soft_fail_unauthorized: bool) -> Self {
        Self {
            sender,
            soft_fail_unauthorized,
        }
    }

    async fn welcome(&self, job: WelcomeEmailJob) -> Result<Option<JsonValue>, ProcessError> {
        let template = templates::welcome_email(&job.name);
        match self.sender.send(&message(&job.email, template)).await {
            Ok(()) => Ok(None),
            Err(err @ DeliveryError::Unauthorized { .. }) if self.soft_fail_unauthorized => {
                warn!(
                    email = %job.email,
                    error = %err,
                    "welcome email skipped: provider authorization failed"
                );
                Ok(Some(json!({ "skipped": "unauthorized" })))
            }
            Err(err) => Err(ProcessError::failed(err)),
        }
    }

    async fn password_reset(&self, job: PasswordResetEmailJob) -> Result<Option<JsonValue>, ProcessError> {
        let url = templates::reset_url(&job.frontend_url, &job.reset_token);
        let template = templates::password_reset_email(templates::name_from_email(&job.email), &url);
        self.sender
            .send(&message(&job.email, template))
            .await
            .map_err(ProcessError::failed)?;
        Ok(None)
    }

    async fn custom(&self, job: CustomEmailJob) -> Result<Option<JsonValue>, ProcessError> {
        let message = EmailMessage {
            to: job.to,
            subject: job.subject,
            html_content: job.html_content,
            text_content: job.text_content,
            template_id: job.template_id,
            params: job.params,
        };
        self.sender.send(&message).await.map_err(ProcessError::failed)?;
        Ok(None)
    }
}

fn message(to: &str, template: EmailTemplate) -> EmailMessage {
    EmailMessage {
        to: to.to_string(),
        subject: template.subject,
        html_content: Some(template.html),
        text_content: Some(template.text),
        ..EmailMessage::default()
    }
}

#[async_trait::async_trait]
impl<S: EmailSender> JobHandler for EmailProcessor<S> {
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, ProcessError> {
        info!(job_id = %job.id, job_type = %job.job_type, "processing email job");

        let result = match job.job_type.as_str() {
            WELCOME_EMAIL => self.welcome(decode(&job.payload)?).await,
            PASSWORD_RESET_EMAIL => self.password_reset(decode(&job.payload)?).await,
            CUSTOM_EMAIL => self.custom(decode(&job.payload)?).await,
            other => Err(ProcessError::UnknownJobType {
                queue: job.queue_name.clone(),
                job_type: other.to_string(),
            }),
        };

        if let Err(e) = &result {
            error!(job_id = %job.id, job_type = %job.job_type, error = %e, "email job failed");
        }
        result
    }
}
