//! `courier-core`: shared building blocks for the job queue.
//!
//! Identifiers, the validation error model and the clock abstraction. No IO lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{FieldError, InvalidId, ValidationError};
pub use id::{HistoryId, JobId};
