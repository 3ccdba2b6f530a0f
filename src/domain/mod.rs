//! Domain layer - Core types shared by every layer
//!
//! This layer contains the value objects (handle and operation ids,
//! application-visible status) and the engine error type.

pub mod shared;

// Re-export commonly used types
pub use shared::{EngineError, Result};
