//! Infrastructure layer: queue stores (in-memory, Redis), job history (in-memory, Postgres),
//! and the producer, dispatcher and admin built on top of them.

pub mod jobs;
