//! Workflow execution pipeline.
//!
//! - [`executor`]: the [`Executor`](executor::Executor) capability with a
//!   ComfyUI-backed variant and an in-process standalone simulation.
//! - [`texture`]: texture request decoding and ComfyUI graph building.
//! - [`orchestrator`]: [`BridgeOrchestrator`](orchestrator::BridgeOrchestrator),
//!   the façade tying registry, tracker, executor and broadcaster together.
//! - [`config`]: environment-driven [`BridgeConfig`](config::BridgeConfig).
//! - [`retention`]: periodic eviction of finished tasks.

pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod retention;
pub mod texture;
