//! Domain logic for the Miktos bridge.
//!
//! Everything in this crate is pure (no network or filesystem access):
//! identifiers, the error taxonomy, workflow definitions and parameter
//! validation, the task model, and the in-memory [`tracker::TaskTracker`].

pub mod builtin;
pub mod error;
pub mod task;
pub mod tracker;
pub mod types;
pub mod validation;
pub mod workflow;
