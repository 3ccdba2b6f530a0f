//! Application-facing events
//!
//! Every operation the application issues produces result events carrying
//! its [`OperationId`], ending with exactly one final one. Everything the
//! peer does surfaces as an [`Indication`]. Both flow through one FIFO so
//! the application sees them in the order the exchanges completed.

use super::call_state::CallState;
use super::headers::SubState;
use super::message::{Body, SipMethod, SipRequest};
use super::registration::RegistrationState;
use super::subscription::SubscriptionState;
use super::transaction::TransactionKey;
use crate::domain::shared::{HandleId, OperationId, Status};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// What an operation was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    StartCall,
    Respond,
    Cancel,
    Bye,
    Reinvite,
    Update,
    Refer,
    Register,
    Unregister,
    Subscribe,
    Unsubscribe,
    Notify,
    SetParameters,
    Authenticate,
}

/// Incoming request waiting for the application's answer.
///
/// The token is neither `Clone` nor `Copy`; answering it through
/// `Engine::respond` consumes it, so a request is answered at most once.
#[derive(Debug)]
pub struct PendingResponse {
    handle: HandleId,
    key: TransactionKey,
    request: SipRequest,
}

impl PendingResponse {
    pub(crate) fn new(handle: HandleId, key: TransactionKey, request: SipRequest) -> Self {
        Self {
            handle,
            key,
            request,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn method(&self) -> SipMethod {
        self.request.method
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub(crate) fn into_parts(self) -> (HandleId, TransactionKey, SipRequest) {
        (self.handle, self.key, self.request)
    }
}

/// Peer-initiated happenings
#[derive(Debug)]
pub enum Indication {
    /// New INVITE; answer it with `respond`
    IncomingCall {
        token: PendingResponse,
        from: String,
        to: String,
        offer: Option<Body>,
    },
    CallStateChanged {
        state: CallState,
        status: Option<Status>,
    },
    /// Provisional response to our INVITE
    CallProgress {
        status: Status,
        remote_tag: Option<String>,
        body: Option<Body>,
    },
    /// Peer hung up; the BYE has been answered
    IncomingBye,
    /// An additional 2xx for our INVITE created another dialog
    ForkedDialog { remote_tag: String },
    /// Peer changed the session with re-INVITE or UPDATE
    SessionUpdated {
        method: SipMethod,
        body: Option<Body>,
    },
    /// Nobody refreshed the session in time
    SessionExpired,
    /// NOTIFY received on a subscription
    IncomingNotify {
        event: String,
        state: SubState,
        body: Option<Body>,
    },
    /// REFER received on a call. `token` is present only when the REFER
    /// was not accepted automatically.
    IncomingRefer {
        refer_to: String,
        referred_by: Option<String>,
        subscription: HandleId,
        token: Option<PendingResponse>,
    },
    /// New SUBSCRIBE; answer it with `respond`
    IncomingSubscribe {
        token: PendingResponse,
        event: String,
        expires: u32,
    },
    SubscriptionStateChanged {
        state: SubscriptionState,
        reason: Option<String>,
    },
    RegistrationStateChanged {
        state: RegistrationState,
        status: Option<Status>,
    },
    /// Registrar reported a public address differing from our Contact
    NatBindingChanged { public_address: String },
    /// A challenge could not be answered with the cached credentials
    AuthenticationRequired { realm: String },
    /// Progress of the call a REFER we sent triggered
    TransferProgress { status: Status, terminated: bool },
}

/// Event delivered to the application
#[derive(Debug)]
pub enum EngineEvent {
    Result {
        handle: HandleId,
        operation: OperationId,
        kind: OperationKind,
        status: Status,
        is_final: bool,
    },
    Indication {
        handle: HandleId,
        indication: Indication,
    },
}

impl EngineEvent {
    pub fn handle(&self) -> HandleId {
        match self {
            EngineEvent::Result { handle, .. } => *handle,
            EngineEvent::Indication { handle, .. } => *handle,
        }
    }
}

/// Ordered event queue
#[derive(Debug, Default)]
pub struct EventDispatcher {
    queue: VecDeque<EngineEvent>,
    suppressed: HashSet<HandleId>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(
        &mut self,
        handle: HandleId,
        operation: OperationId,
        kind: OperationKind,
        status: Status,
        is_final: bool,
    ) {
        if self.suppressed.contains(&handle) {
            debug!("Dropping {:?} result for zombie {}", kind, handle);
            return;
        }
        debug!("{} {} {:?} -> {} (final={})", handle, operation, kind, status, is_final);
        self.queue.push_back(EngineEvent::Result {
            handle,
            operation,
            kind,
            status,
            is_final,
        });
    }

    pub fn indicate(&mut self, handle: HandleId, indication: Indication) {
        if self.suppressed.contains(&handle) {
            debug!("Dropping indication for zombie {}", handle);
            return;
        }
        self.queue.push_back(EngineEvent::Indication { handle, indication });
    }

    /// Stop reporting anything for a destroyed handle
    pub fn suppress(&mut self, handle: HandleId) {
        self.suppressed.insert(handle);
        self.queue.retain(|e| e.handle() != handle);
    }

    /// Forget a reclaimed handle
    pub fn release(&mut self, handle: HandleId) {
        self.suppressed.remove(&handle);
    }

    pub fn pop(&mut self) -> Option<EngineEvent> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_fifo() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.indicate(HandleId(1), Indication::IncomingBye);
        dispatcher.result(HandleId(1), OperationId(4), OperationKind::Bye, Status::ok(), true);

        assert!(matches!(
            dispatcher.pop(),
            Some(EngineEvent::Indication {
                indication: Indication::IncomingBye,
                ..
            })
        ));
        assert!(matches!(
            dispatcher.pop(),
            Some(EngineEvent::Result {
                operation: OperationId(4),
                is_final: true,
                ..
            })
        ));
        assert!(dispatcher.pop().is_none());
    }

    #[test]
    fn test_suppressed_handles_are_silent() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.indicate(HandleId(2), Indication::SessionExpired);
        dispatcher.indicate(HandleId(3), Indication::SessionExpired);
        dispatcher.suppress(HandleId(2));
        dispatcher.result(HandleId(2), OperationId(1), OperationKind::Cancel, Status::ok(), true);

        assert_eq!(dispatcher.len(), 1);
        assert_eq!(dispatcher.pop().map(|e| e.handle()), Some(HandleId(3)));

        dispatcher.release(HandleId(2));
        dispatcher.indicate(HandleId(2), Indication::IncomingBye);
        assert_eq!(dispatcher.len(), 1);
    }
}
