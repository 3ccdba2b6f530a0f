//! Shared kernel - Common types and utilities used across all layers

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::EngineError;
pub use result::Result;
pub use value_objects::*;
