//! SIP protocol implementation
//!
//! This module implements a SIP (Session Initiation Protocol) user agent core
//! based on RFC 3261 with its extensions for reliable provisional responses
//! (RFC 3262), UPDATE (RFC 3311), session timers (RFC 4028), event
//! subscriptions (RFC 6665) and REFER (RFC 3515).
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Handle Layer          │
//! │ (Call, Registration,    │
//! │  Subscription)          │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Dialog Layer         │
//! │   (SIP Dialogs)         │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP)                  │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call;
pub mod call_state;
pub mod context;
pub mod dialog;
pub mod events;
pub mod headers;
pub mod message;
pub mod offer_answer;
pub mod registration;
pub mod rport;
pub mod subscription;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use auth::{AuthManager, Credential};
pub use call::{ByeOptions, Call, CallOptions, CallParameters, ResponseOptions, SessionOptions};
pub use call_state::{CallDirection, CallEvent, CallState, CallStateMachine, CallTimes};
pub use dialog::{Dialog, DialogId, DialogStore};
pub use events::{EngineEvent, Indication, OperationKind, PendingResponse};
pub use headers::{NameAddr, SubState};
pub use message::{Body, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use offer_answer::{OfferAnswer, StaticOfferAnswer};
pub use registration::{Registration, RegistrationOptions, RegistrationParameters, RegistrationState};
pub use subscription::{
    NotifyOptions, ReferOptions, Subscription, SubscriptionOptions, SubscriptionRole,
    SubscriptionState,
};
pub use timer::{TimerToken, TimerWheel};
pub use transaction::{SipTimers, TimerType, TransactionKey, TransactionLayer};
pub use transport::{Destination, Outgoing, Transport, TransportEvent, TransportProtocol, UdpTransport};
