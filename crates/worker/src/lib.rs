//! `courier-worker`: the job processing service.
//!
//! Declares the job types (`payloads`), renders emails (`templates`), talks to external
//! collaborators (`services`), handles jobs (`processors`) and wires everything onto the
//! queue infrastructure (`app`, `cli`).

pub mod app;
pub mod cli;
pub mod config;
pub mod payloads;
pub mod processors;
pub mod services;
pub mod templates;
