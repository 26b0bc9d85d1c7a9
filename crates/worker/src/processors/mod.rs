//! Job handlers and their registration.

pub mod email;
pub mod user_sync;

use std::sync::Arc;

use courier_infra::jobs::{HandlerRegistry, JobHandler};

use crate::payloads::{
    CREATE_USER, CUSTOM_EMAIL, EMAIL_QUEUE, PASSWORD_RESET_EMAIL, USER_SYNC_QUEUE, WELCOME_EMAIL,
};
use crate::services::{EmailSender, UserSyncTarget};

pub use email::EmailProcessor;
pub use user_sync::UserSyncProcessor;

/// Wire every catalog job type to its processor.
pub fn build_registry<S, T>(sender: S, target: T, soft_fail_unauthorized: bool) -> HandlerRegistry
where
    S: EmailSender + 'static,
    T: UserSyncTarget + 'static,
{
    let email: Arc<dyn JobHandler> = Arc::new(EmailProcessor::new(sender, soft_fail_unauthorized));

    let mut registry = HandlerRegistry::new();
    registry
        .register_shared(
            EMAIL_QUEUE,
            &[WELCOME_EMAIL, PASSWORD_RESET_EMAIL, CUSTOM_EMAIL],
            email,
        )
        .register(USER_SYNC_QUEUE, CREATE_USER, UserSyncProcessor::new(target));
    registry
}
