//! Shared value objects used across the engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Application-visible identity of a call, registration or subscription.
///
/// Handles live in an arena owned by the engine; dialogs and transactions
/// refer back to their owner through this index only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Identifies one application-issued operation; every operation yields
/// exactly one final result event carrying the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Kind of handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    Call,
    Registration,
    Subscription,
}

/// Where a status originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusOrigin {
    /// Received from the peer
    Remote,
    /// Synthesized on transaction timeout
    LocalTimeout,
    /// Synthesized when a request was abandoned before any response
    LocalCancelled,
    /// Synthesized on a transport failure
    LocalTransport,
    /// Any other locally generated status
    Local,
}

/// SIP status class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Provisional,
    Success,
    Redirect,
    ClientFailure,
    ServerFailure,
    GlobalFailure,
}

/// Status surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub reason: String,
    pub origin: StatusOrigin,
}

impl Status {
    pub fn remote(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            origin: StatusOrigin::Remote,
        }
    }

    pub fn local(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            origin: StatusOrigin::Local,
        }
    }

    /// Synthetic 408 for a transaction that never completed
    pub fn local_timeout() -> Self {
        Self {
            code: 408,
            reason: "Request Timeout".to_string(),
            origin: StatusOrigin::LocalTimeout,
        }
    }

    /// Synthetic 487 for a request abandoned before it got any response
    pub fn local_cancelled() -> Self {
        Self {
            code: 487,
            reason: "Request Terminated".to_string(),
            origin: StatusOrigin::LocalCancelled,
        }
    }

    /// Synthetic 503 for a message the transport could not deliver
    pub fn transport_failure() -> Self {
        Self {
            code: 503,
            reason: "Service Unavailable".to_string(),
            origin: StatusOrigin::LocalTransport,
        }
    }

    pub fn ok() -> Self {
        Self::local(200, "OK")
    }

    pub fn class(&self) -> StatusClass {
        match self.code {
            100..=199 => StatusClass::Provisional,
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirect,
            400..=499 => StatusClass::ClientFailure,
            500..=599 => StatusClass::ServerFailure,
            _ => StatusClass::GlobalFailure,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.class() == StatusClass::Provisional
    }

    pub fn is_success(&self) -> bool {
        self.class() == StatusClass::Success
    }

    pub fn is_failure(&self) -> bool {
        self.code >= 300
    }

    pub fn is_local(&self) -> bool {
        self.origin != StatusOrigin::Remote
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            StatusOrigin::Remote => write!(f, "{} {}", self.code, self.reason),
            _ => write!(f, "{} {} (local)", self.code, self.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(Status::remote(180, "Ringing").class(), StatusClass::Provisional);
        assert_eq!(Status::remote(200, "OK").class(), StatusClass::Success);
        assert_eq!(Status::remote(302, "Moved").class(), StatusClass::Redirect);
        assert_eq!(Status::remote(486, "Busy Here").class(), StatusClass::ClientFailure);
        assert_eq!(Status::remote(503, "Unavailable").class(), StatusClass::ServerFailure);
        assert_eq!(Status::remote(603, "Decline").class(), StatusClass::GlobalFailure);
    }

    #[test]
    fn test_synthetic_statuses_are_local() {
        let timeout = Status::local_timeout();
        assert_eq!(timeout.code, 408);
        assert!(timeout.is_local());
        assert_eq!(timeout.origin, StatusOrigin::LocalTimeout);

        let cancelled = Status::local_cancelled();
        assert_eq!(cancelled.code, 487);
        assert_eq!(cancelled.origin, StatusOrigin::LocalCancelled);

        assert!(!Status::remote(408, "Request Timeout").is_local());
    }

    #[test]
    fn test_display() {
        assert_eq!(HandleId(7).to_string(), "h7");
        assert_eq!(Status::remote(200, "OK").to_string(), "200 OK");
        assert_eq!(Status::local_timeout().to_string(), "408 Request Timeout (local)");
    }
}
