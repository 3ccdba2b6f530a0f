//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - SIP message model, transactions, dialogs and handle state machines
//! - The transport collaborator (UDP)

pub mod protocols;
