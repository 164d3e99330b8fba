//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection setup, HTTP API
//! wrappers, history/output parsing, and the backoff used to poll
//! history when the live connection drops.

pub mod api;
pub mod backoff;
pub mod client;
pub mod history;
pub mod messages;
pub mod processor;
