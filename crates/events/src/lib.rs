//! Progress fan-out for running tasks.
//!
//! - [`ProgressBroadcaster`]: per-task publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`ProgressSubscription`]: a finite, non-restartable stream of
//!   [`ProgressEvent`](miktos_core::task::ProgressEvent)s that ends with
//!   the task's terminal event.

pub mod broadcaster;

pub use broadcaster::{ProgressBroadcaster, ProgressSubscription};
