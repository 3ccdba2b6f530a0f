//! sipua - a SIP (RFC 3261) user agent signalling engine
//!
//! The core is sans-IO: [`application::Engine`] consumes received messages,
//! time and application operations, and produces messages to send plus
//! application events. [`application::EngineRuntime`] runs it on a tokio
//! task against a real [`Transport`](infrastructure::protocols::sip::Transport).

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::EngineError;
pub use domain::shared::result::Result;
