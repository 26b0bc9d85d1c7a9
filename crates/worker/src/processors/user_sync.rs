//! `user-sync-queue` processor.

use serde_json::Value as JsonValue;
use tracing::{error, info};

use courier_infra::jobs::{Job, JobHandler, ProcessError};

use crate::payloads::{decode, CreateUserJob, CREATE_USER};
use crate::services::UserSyncTarget;

pub struct UserSyncProcessor<T> {
    target: T,
}

impl<T: UserSyncTarget> UserSyncProcessor<T> {
    pub fn new(target: T) -> Self {
        Self { target }
    }
}

#[async_trait::async_trait]
impl<T: UserSyncTarget> JobHandler for UserSyncProcessor<T> {
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, ProcessError> {
        if job.job_type != CREATE_USER {
            return Err(ProcessError::UnknownJobType {
                queue: job.queue_name.clone(),
                job_type: job.job_type.clone(),
            });
        }

        let user: CreateUserJob = decode(&job.payload)?;
        info!(job_id = %job.id, email = %user.email, "syncing user to backend");

        self.target
            .create_user(user.id, &user.name, &user.email)
            .await
            .map_err(|e| {
                error!(job_id = %job.id, email = %user.email, error = %e, "user sync failed");
                ProcessError::failed(e)
            })?;
        Ok(None)
    }
}
