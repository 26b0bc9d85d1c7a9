//! Typed job payloads and the catalog that declares them.
//!
//! Each payload rejects unknown fields, except the `historyId` the producer adds.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;
use validator::Validate;

use courier_core::{FieldError, ValidationError};
use courier_infra::jobs::{JobCatalog, JobDefinition, JobPayload, ProcessError};

pub const EMAIL_QUEUE: &str = "email-queue";
pub const USER_SYNC_QUEUE: &str = "user-sync-queue";

pub const WELCOME_EMAIL: &str = "welcome-email";
pub const PASSWORD_RESET_EMAIL: &str = "password-reset-email";
pub const CUSTOM_EMAIL: &str = "custom-email";
pub const CREATE_USER: &str = "create-user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WelcomeEmailJob {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: String,
    #[serde(rename = "historyId", default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

impl JobPayload for WelcomeEmailJob {
    const QUEUE: &'static str = EMAIL_QUEUE;
    const JOB_TYPE: &'static str = WELCOME_EMAIL;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PasswordResetEmailJob {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 1, message = "Reset token is required"))]
    pub reset_token: String,
    #[validate(url(message = "Invalid frontend URL"))]
    pub frontend_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

impl JobPayload for PasswordResetEmailJob {
    const QUEUE: &'static str = EMAIL_QUEUE;
    const JOB_TYPE: &'static str = PASSWORD_RESET_EMAIL;
}

/// Arbitrary message: explicit content or a provider-side template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CustomEmailJob {
    #[validate(email(message = "Invalid recipient email"))]
    pub to: String,
    #[validate(length(min = 1, message = "Subject is required"))]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

impl JobPayload for CustomEmailJob {
    const QUEUE: &'static str = EMAIL_QUEUE;
    const JOB_TYPE: &'static str = CUSTOM_EMAIL;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateUserJob {
    pub id: Uuid,
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

impl JobPayload for CreateUserJob {
    const QUEUE: &'static str = USER_SYNC_QUEUE;
    const JOB_TYPE: &'static str = CREATE_USER;
}

/// Check an untyped payload against `P`'s shape and constraints.
pub fn validate_payload<P>(payload: &JsonValue) -> Result<(), ValidationError>
where
    P: DeserializeOwned + Validate,
{
    let typed: P = serde_json::from_value(payload.clone())
        .map_err(|e| ValidationError::field("", e.to_string()))?;
    typed.validate().map_err(from_validator)
}

/// Decode a leased payload. Failures are not retried into success, but still count as attempts.
pub fn decode<P: DeserializeOwned>(payload: &JsonValue) -> Result<P, ProcessError> {
    Ok(serde_json::from_value(payload.clone())?)
}

fn from_validator(errors: validator::ValidationErrors) -> ValidationError {
    let mut fields: Vec<FieldError> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            let field = field.to_string();
            errs.iter().map(move |e| {
                let message = e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string());
                FieldError::new(field.clone(), message)
            })
        })
        .collect();
    fields.sort_by(|a, b| a.field.cmp(&b.field));
    ValidationError::new(fields)
}

fn definition<P>() -> JobDefinition
where
    P: JobPayload + DeserializeOwned + Validate + 'static,
{
    JobDefinition::for_payload::<P>().with_validator(validate_payload::<P>)
}

/// Every job type the worker serves. All use 3 attempts with 2s exponential backoff.
pub fn build_catalog() -> JobCatalog {
    JobCatalog::new()
        .with(definition::<WelcomeEmailJob>())
        .with(definition::<PasswordResetEmailJob>())
        .with(definition::<CustomEmailJob>())
        .with(definition::<CreateUserJob>())
}
