//! Collaborators the processors call out to.

pub mod email;
pub mod user_sync;

pub use email::{BrevoEmailSender, DeliveryError, EmailMessage, EmailSender, LogEmailSender};
pub use user_sync::{HttpUserSyncTarget, RemoteError, UserSyncTarget};
