//! Application layer - the engine and its runtime
//!
//! This layer owns the handle arena and drives the protocol state machines:
//! - `engine`: sans-IO request routing, timers and handle lifecycle
//! - `runtime`: tokio task wrapping an engine and a transport

pub mod engine;
pub mod runtime;

pub use engine::{Engine, HandleParameters};
pub use runtime::{EngineHandle, EngineRuntime};
