//! Declared queues and job types, with their payload schemas and enqueue options.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use courier_core::ValidationError;

use super::types::JobOptions;

/// Validates an untyped payload against a job type's schema.
pub type PayloadValidator = Arc<dyn Fn(&JsonValue) -> Result<(), ValidationError> + Send + Sync>;

/// A payload type bound to one `(queue, job type)` pair.
pub trait JobPayload: Serialize + Send + Sync {
    const QUEUE: &'static str;
    const JOB_TYPE: &'static str;
}

/// Everything the producer and dispatcher need to know about one job type.
#[derive(Clone)]
pub struct JobDefinition {
    pub queue: String,
    pub job_type: String,
    pub options: JobOptions,
    /// Create and maintain a history record for every submission
    pub track_history: bool,
    validator: Option<PayloadValidator>,
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("queue", &self.queue)
            .field("job_type", &self.job_type)
            .field("options", &self.options)
            .field("track_history", &self.track_history)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

impl JobDefinition {
    /// A tracked job type with default options and no schema.
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            options: JobOptions::default(),
            track_history: true,
            validator: None,
        }
    }

    pub fn for_payload<P: JobPayload>() -> Self {
        Self::new(P::QUEUE, P::JOB_TYPE)
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn untracked(mut self) -> Self {
        self.track_history = false;
        self
    }

    /// Run the schema, if any.
    pub fn validate(&self, payload: &JsonValue) -> Result<(), ValidationError> {
        match &self.validator {
            Some(validate) => validate(payload),
            None => Ok(()),
        }
    }
}

/// Registry of known job types, keyed by `(queue, job type)`.
#[derive(Debug, Clone, Default)]
pub struct JobCatalog {
    definitions: BTreeMap<(String, String), JobDefinition>,
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, replacing any previous one for the same pair.
    pub fn register(&mut self, definition: JobDefinition) -> &mut Self {
        let key = (definition.queue.clone(), definition.job_type.clone());
        self.definitions.insert(key, definition);
        self
    }

    pub fn with(mut self, definition: JobDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn definition(&self, queue: &str, job_type: &str) -> Option<&JobDefinition> {
        self.definitions.get(&(queue.to_string(), job_type.to_string()))
    }

    /// Distinct queue names, sorted.
    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = self.definitions.keys().map(|(q, _)| q.as_str()).collect();
        queues.dedup();
        queues
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.definitions.keys().any(|(q, _)| q == queue)
    }

    pub fn job_types_for(&self, queue: &str) -> Vec<&str> {
        self.definitions
            .keys()
            .filter(|(q, _)| q == queue)
            .map(|(_, t)| t.as_str())
            .collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &JobDefinition> {
        self.definitions.values()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn lists_queues_and_types() {
        let catalog = JobCatalog::new()
            .with(JobDefinition::new("email-queue", "welcome-email"))
            .with(JobDefinition::new("email-queue", "custom-email"))
            .with(JobDefinition::new("user-sync-queue", "create-user"));

        assert_eq!(catalog.queues(), vec!["email-queue", "user-sync-queue"]);
        assert_eq!(
            catalog.job_types_for("email-queue"),
            vec!["custom-email", "welcome-email"]
        );
        assert!(catalog.has_queue("user-sync-queue"));
        assert!(!catalog.has_queue("nope"));
        assert!(catalog.definition("email-queue", "create-user").is_none());
    }

    #[test]
    fn validator_is_applied() {
        let definition = JobDefinition::new("q", "t").with_validator(|payload| {
            if payload.get("email").is_some() {
                Ok(())
            } else {
                Err(ValidationError::field("email", "is required"))
            }
        });

        assert!(definition.validate(&json!({"email": "a@b.c"})).is_ok());
        let err = definition.validate(&json!({})).unwrap_err();
        assert_eq!(err.messages_for("email"), vec!["is required"]);
    }
}
