//! SIP Transaction Layer
//!
//! Implements client and server transactions as per RFC 3261 Section 17,
//! with the 2xx handling of RFC 6026.
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2
//!
//! Every input is a transition: the transaction updates its state and
//! returns the [`TransactionAction`]s the caller must carry out (transmit,
//! arm or disarm a timer, pass a response up). Nothing here owns a socket or
//! a clock.

use super::builder::build_non2xx_ack;
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::Destination;
use crate::domain::shared::HandleId;
use metrics::counter;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transaction ID - the branch parameter of the top Via
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    /// Create transaction ID from branch parameter
    pub fn from_branch(branch: &str) -> Self {
        Self(branch.to_string())
    }

    /// Generate a new RFC 3261 compliant branch
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        Self(format!("z9hG4bK{:x}", random))
    }
}

/// Which side of the transaction we are
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Lookup key: branch, method and role.
///
/// ACK is keyed under INVITE so that it finds the INVITE server
/// transaction; CANCEL gets a transaction of its own.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub id: TransactionId,
    pub method: SipMethod,
    pub role: TransactionRole,
}

impl TransactionKey {
    pub fn client(branch: &str, method: SipMethod) -> Self {
        Self {
            id: TransactionId::from_branch(branch),
            method,
            role: TransactionRole::Client,
        }
    }

    pub fn server(branch: &str, method: SipMethod) -> Self {
        let method = if method == SipMethod::Ack {
            SipMethod::Invite
        } else {
            method
        };
        Self {
            id: TransactionId::from_branch(branch),
            method,
            role: TransactionRole::Server,
        }
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self.role {
            TransactionRole::Client => "client",
            TransactionRole::Server => "server",
        };
        write!(f, "{}/{}/{}", self.id.0, self.method, role)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer types for SIP transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (default: T1)
    TimerA,
    /// Timer B: INVITE transaction timeout (default: 64*T1)
    TimerB,
    /// Timer D: Wait time for response retransmits (default: >32s for UDP, 0s for TCP)
    TimerD,
    /// Timer E: Non-INVITE request retransmit (default: T1)
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (default: 64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (default: T1)
    TimerG,
    /// Timer H: Wait time for ACK receipt (default: 64*T1)
    TimerH,
    /// Timer I: Wait time for ACK retransmits (default: T4 for UDP, 0s for TCP)
    TimerI,
    /// Timer J: Wait time for retransmits of non-INVITE requests (default: 64*T1 for UDP, 0s for TCP)
    TimerJ,
    /// Timer K: Wait time for response retransmits (default: T4 for UDP, 0s for TCP)
    TimerK,
    /// Timer L: Wait time for INVITE retransmits after a 2xx (RFC 6026, 64*T1)
    TimerL,
    /// Timer M: Wait time for forked or retransmitted 2xx (RFC 6026, 64*T1)
    TimerM,
}

impl TimerType {
    /// Get default duration for this timer
    pub fn default_duration(&self, timers: &SipTimers, is_reliable: bool) -> Duration {
        match self {
            TimerType::TimerA => timers.t1,
            TimerType::TimerB => timers.t1 * 64,
            TimerType::TimerD => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    std::cmp::max(Duration::from_secs(32), timers.t1 * 64)
                }
            }
            TimerType::TimerE => timers.t1,
            TimerType::TimerF => timers.t1 * 64,
            TimerType::TimerG => timers.t1,
            TimerType::TimerH => timers.t1 * 64,
            TimerType::TimerI => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    timers.t4
                }
            }
            TimerType::TimerJ => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    timers.t1 * 64
                }
            }
            TimerType::TimerK => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    timers.t4
                }
            }
            TimerType::TimerL => timers.t1 * 64,
            TimerType::TimerM => timers.t1 * 64,
        }
    }
}

/// INVITE Client Transaction States (RFC 3261 Section 17.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    /// Initial state - request sent
    Calling,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received non-2xx final response, ACKing retransmissions until Timer D
    Completed,
    /// Received 2xx, passing further 2xx up for ACK until Timer M
    Confirmed,
    /// Transaction terminated
    Terminated,
}

/// INVITE Server Transaction States (RFC 3261 Section 17.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    /// Request received, provisional response sent
    Proceeding,
    /// Non-2xx final response sent
    Completed,
    /// ACK received
    Confirmed,
    /// 2xx sent, absorbing INVITE retransmissions until Timer L
    Accepted,
    /// Transaction terminated
    Terminated,
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    /// Request sent, no response yet
    Trying,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received final response (2xx-6xx)
    Completed,
    /// Transaction terminated
    Terminated,
}

/// Non-INVITE Server Transaction States (RFC 3261 Section 17.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    /// Request received
    Trying,
    /// Provisional response sent
    Proceeding,
    /// Final response sent
    Completed,
    /// Transaction terminated
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// INVITE Client Transaction
    InviteClient(InviteClientState),
    /// INVITE Server Transaction
    InviteServer(InviteServerState),
    /// Non-INVITE Client Transaction
    NonInviteClient(NonInviteClientState),
    /// Non-INVITE Server Transaction
    NonInviteServer(NonInviteServerState),
}

impl TransactionState {
    /// Check if transaction is terminated
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
        )
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::InviteClient(InviteClientState::Calling) => "ICT-Calling",
            TransactionState::InviteClient(InviteClientState::Proceeding) => "ICT-Proceeding",
            TransactionState::InviteClient(InviteClientState::Completed) => "ICT-Completed",
            TransactionState::InviteClient(InviteClientState::Confirmed) => "ICT-Confirmed",
            TransactionState::InviteClient(InviteClientState::Terminated) => "ICT-Terminated",
            TransactionState::InviteServer(InviteServerState::Proceeding) => "IST-Proceeding",
            TransactionState::InviteServer(InviteServerState::Completed) => "IST-Completed",
            TransactionState::InviteServer(InviteServerState::Confirmed) => "IST-Confirmed",
            TransactionState::InviteServer(InviteServerState::Accepted) => "IST-Accepted",
            TransactionState::InviteServer(InviteServerState::Terminated) => "IST-Terminated",
            TransactionState::NonInviteClient(NonInviteClientState::Trying) => "NICT-Trying",
            TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => {
                "NICT-Proceeding"
            }
            TransactionState::NonInviteClient(NonInviteClientState::Completed) => "NICT-Completed",
            TransactionState::NonInviteClient(NonInviteClientState::Terminated) => {
                "NICT-Terminated"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Trying) => "NIST-Trying",
            TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                "NIST-Proceeding"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Completed) => "NIST-Completed",
            TransactionState::NonInviteServer(NonInviteServerState::Terminated) => {
                "NIST-Terminated"
            }
        }
    }
}

/// CANCEL bookkeeping of an INVITE client transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    None,
    /// Asked for while still Calling; waits for a provisional
    Deferred,
    Sent,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionAction {
    /// Send (or resend) a message to the transaction's peer
    Transmit(SipMessage),
    /// Arm a timer, replacing any running timer of the same type
    StartTimer(TimerType, Duration),
    /// Disarm a timer
    StopTimer(TimerType),
    /// Deliver a response to the transaction user
    PassUp(SipResponse),
    /// Transaction timed out; the owner sees a synthetic 408
    Timeout,
    /// The transport refused the message; the owner sees a synthetic 503
    TransportFailure,
    /// A deferred CANCEL may now be sent
    SendCancel,
    /// A deferred CANCEL is no longer needed
    ReleaseCancel,
    /// Remove the transaction
    Terminate,
}

/// SIP Transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Unique transaction key
    pub key: TransactionKey,
    /// Current state
    pub state: TransactionState,
    /// Original request
    pub request: SipRequest,
    /// Peer address (next hop for clients, response address for servers)
    pub destination: Destination,
    /// Is transport reliable (TCP/TLS vs UDP)
    pub is_reliable: bool,
    /// Owning handle, if any
    pub owner: Option<HandleId>,
    /// Last response (for retransmission)
    pub last_response: Option<SipResponse>,
    /// ACK sent for a non-2xx final response
    pub ack: Option<SipRequest>,
    /// Number of retransmissions performed
    pub retransmissions: u32,
    /// CANCEL bookkeeping (INVITE client only)
    pub cancel: CancelState,
    /// SIP timer configuration
    pub sip_timers: SipTimers,
    interval: Duration,
}

impl Transaction {
    fn new(
        key: TransactionKey,
        state: TransactionState,
        request: SipRequest,
        destination: Destination,
        sip_timers: SipTimers,
    ) -> Self {
        let is_reliable = destination.is_reliable();
        Self {
            key,
            state,
            request,
            destination,
            is_reliable,
            owner: None,
            last_response: None,
            ack: None,
            retransmissions: 0,
            cancel: CancelState::None,
            sip_timers,
            interval: sip_timers.t1,
        }
    }

    /// Create a client transaction and return the actions that start it
    pub fn client(
        request: SipRequest,
        destination: Destination,
        sip_timers: SipTimers,
    ) -> Result<(Self, Vec<TransactionAction>), SipError> {
        let branch = request
            .branch()
            .ok_or_else(|| SipError::TransactionError("No branch parameter in Via header".to_string()))?;
        let key = TransactionKey::client(&branch, request.method);

        let state = if request.method == SipMethod::Invite {
            TransactionState::InviteClient(InviteClientState::Calling)
        } else {
            TransactionState::NonInviteClient(NonInviteClientState::Trying)
        };
        let txn = Self::new(key, state, request, destination, sip_timers);

        let mut actions = vec![TransactionAction::Transmit(SipMessage::Request(txn.request.clone()))];
        let (retransmit, timeout) = if txn.is_invite() {
            (TimerType::TimerA, TimerType::TimerB)
        } else {
            (TimerType::TimerE, TimerType::TimerF)
        };
        if !txn.is_reliable {
            actions.push(TransactionAction::StartTimer(retransmit, txn.sip_timers.t1));
        }
        actions.push(TransactionAction::StartTimer(
            timeout,
            timeout.default_duration(&txn.sip_timers, txn.is_reliable),
        ));

        Ok((txn, actions))
    }

    /// Create a server transaction for an incoming request
    pub fn server(
        request: SipRequest,
        source: Destination,
        sip_timers: SipTimers,
    ) -> Result<Self, SipError> {
        let branch = request
            .branch()
            .ok_or_else(|| SipError::TransactionError("No branch parameter in Via header".to_string()))?;
        let key = TransactionKey::server(&branch, request.method);

        let state = if request.method == SipMethod::Invite {
            TransactionState::InviteServer(InviteServerState::Proceeding)
        } else {
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        };
        Ok(Self::new(key, state, request, source, sip_timers))
    }

    pub fn is_invite(&self) -> bool {
        self.key.method == SipMethod::Invite
    }

    pub fn method(&self) -> SipMethod {
        self.key.method
    }

    /// Final response already given (server) or received (client)
    pub fn is_finalized(&self) -> bool {
        !matches!(
            self.state,
            TransactionState::InviteClient(InviteClientState::Calling)
                | TransactionState::InviteClient(InviteClientState::Proceeding)
                | TransactionState::InviteServer(InviteServerState::Proceeding)
                | TransactionState::NonInviteClient(NonInviteClientState::Trying)
                | TransactionState::NonInviteClient(NonInviteClientState::Proceeding)
                | TransactionState::NonInviteServer(NonInviteServerState::Trying)
                | TransactionState::NonInviteServer(NonInviteServerState::Proceeding)
        )
    }

    /// Arm `timer` with its default duration, or terminate right away when
    /// that duration is zero (reliable transports).
    fn wait_or_terminate(&mut self, timer: TimerType, terminated: TransactionState, actions: &mut Vec<TransactionAction>) {
        let duration = timer.default_duration(&self.sip_timers, self.is_reliable);
        if duration.is_zero() {
            self.state = terminated;
            actions.push(TransactionAction::Terminate);
        } else {
            actions.push(TransactionAction::StartTimer(timer, duration));
        }
    }

    fn release_deferred_cancel(&mut self, actions: &mut Vec<TransactionAction>) {
        if self.cancel == CancelState::Deferred {
            self.cancel = CancelState::None;
            actions.push(TransactionAction::ReleaseCancel);
        }
    }

    /// Process received response (for client transactions)
    pub fn on_response(&mut self, response: SipResponse) -> Vec<TransactionAction> {
        let status = response.status_code();
        let mut actions = Vec::new();

        match self.state {
            // INVITE Client Transaction
            TransactionState::InviteClient(state) => match state {
                InviteClientState::Calling | InviteClientState::Proceeding => {
                    if (100..200).contains(&status) {
                        self.state = TransactionState::InviteClient(InviteClientState::Proceeding);
                        actions.push(TransactionAction::StopTimer(TimerType::TimerA));
                        actions.push(TransactionAction::PassUp(response));
                        if self.cancel == CancelState::Deferred {
                            self.cancel = CancelState::Sent;
                            actions.push(TransactionAction::SendCancel);
                        }
                    } else if (200..300).contains(&status) {
                        self.state = TransactionState::InviteClient(InviteClientState::Confirmed);
                        actions.push(TransactionAction::StopTimer(TimerType::TimerA));
                        actions.push(TransactionAction::StopTimer(TimerType::TimerB));
                        actions.push(TransactionAction::StartTimer(
                            TimerType::TimerM,
                            TimerType::TimerM.default_duration(&self.sip_timers, self.is_reliable),
                        ));
                        self.release_deferred_cancel(&mut actions);
                        actions.push(TransactionAction::PassUp(response));
                    } else if status >= 300 {
                        self.state = TransactionState::InviteClient(InviteClientState::Completed);
                        actions.push(TransactionAction::StopTimer(TimerType::TimerA));
                        actions.push(TransactionAction::StopTimer(TimerType::TimerB));
                        let ack = build_non2xx_ack(&self.request, &response);
                        actions.push(TransactionAction::Transmit(SipMessage::Request(ack.clone())));
                        self.ack = Some(ack);
                        self.release_deferred_cancel(&mut actions);
                        actions.push(TransactionAction::PassUp(response));
                        self.wait_or_terminate(
                            TimerType::TimerD,
                            TransactionState::InviteClient(InviteClientState::Terminated),
                            &mut actions,
                        );
                    }
                }
                InviteClientState::Completed => {
                    // Retransmitted final response: ACK it again
                    if status >= 300 {
                        if let Some(ack) = &self.ack {
                            actions.push(TransactionAction::Transmit(SipMessage::Request(ack.clone())));
                        }
                    }
                }
                InviteClientState::Confirmed => {
                    // Every 2xx goes up; the dialog layer ACKs each one
                    if (200..300).contains(&status) {
                        actions.push(TransactionAction::PassUp(response));
                    }
                }
                InviteClientState::Terminated => {}
            },

            // Non-INVITE Client Transaction
            TransactionState::NonInviteClient(state) => match state {
                NonInviteClientState::Trying | NonInviteClientState::Proceeding => {
                    if (100..200).contains(&status) {
                        self.state = TransactionState::NonInviteClient(NonInviteClientState::Proceeding);
                        actions.push(TransactionAction::PassUp(response));
                    } else if status >= 200 {
                        self.state = TransactionState::NonInviteClient(NonInviteClientState::Completed);
                        actions.push(TransactionAction::StopTimer(TimerType::TimerE));
                        actions.push(TransactionAction::StopTimer(TimerType::TimerF));
                        actions.push(TransactionAction::PassUp(response));
                        self.wait_or_terminate(
                            TimerType::TimerK,
                            TransactionState::NonInviteClient(NonInviteClientState::Terminated),
                            &mut actions,
                        );
                    }
                }
                // Absorb retransmitted responses
                NonInviteClientState::Completed | NonInviteClientState::Terminated => {}
            },

            _ => warn!("Response {} offered to server transaction {}", status, self.key),
        }

        actions
    }

    /// Process received ACK (for INVITE server transactions)
    pub fn on_ack(&mut self) -> Vec<TransactionAction> {
        let mut actions = Vec::new();
        if let TransactionState::InviteServer(InviteServerState::Completed) = self.state {
            self.state = TransactionState::InviteServer(InviteServerState::Confirmed);
            actions.push(TransactionAction::StopTimer(TimerType::TimerG));
            actions.push(TransactionAction::StopTimer(TimerType::TimerH));
            self.wait_or_terminate(
                TimerType::TimerI,
                TransactionState::InviteServer(InviteServerState::Terminated),
                &mut actions,
            );
        }
        actions
    }

    /// Retransmission of the request that created this server transaction
    pub fn on_retransmitted_request(&mut self) -> Vec<TransactionAction> {
        let replay = match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding)
            | TransactionState::InviteServer(InviteServerState::Completed)
            | TransactionState::NonInviteServer(NonInviteServerState::Proceeding)
            | TransactionState::NonInviteServer(NonInviteServerState::Completed) => {
                self.last_response.clone()
            }
            _ => None,
        };
        match replay {
            Some(response) => {
                debug!("Replaying {} for retransmitted request on {}", response.status, self.key);
                vec![TransactionAction::Transmit(SipMessage::Response(response))]
            }
            None => Vec::new(),
        }
    }

    /// Send response (for server transactions)
    pub fn send_response(&mut self, response: SipResponse) -> Result<Vec<TransactionAction>, SipError> {
        let status = response.status_code();
        let mut actions = Vec::new();

        match self.state {
            // INVITE Server Transaction
            TransactionState::InviteServer(InviteServerState::Proceeding) => {
                actions.push(TransactionAction::Transmit(SipMessage::Response(response.clone())));
                if (200..300).contains(&status) {
                    self.state = TransactionState::InviteServer(InviteServerState::Accepted);
                    actions.push(TransactionAction::StartTimer(
                        TimerType::TimerL,
                        TimerType::TimerL.default_duration(&self.sip_timers, self.is_reliable),
                    ));
                } else if status >= 300 {
                    self.state = TransactionState::InviteServer(InviteServerState::Completed);
                    self.interval = self.sip_timers.t1;
                    if !self.is_reliable {
                        actions.push(TransactionAction::StartTimer(TimerType::TimerG, self.sip_timers.t1));
                    }
                    actions.push(TransactionAction::StartTimer(
                        TimerType::TimerH,
                        TimerType::TimerH.default_duration(&self.sip_timers, self.is_reliable),
                    ));
                }
            }
            // 2xx retransmissions are driven by the dialog layer
            TransactionState::InviteServer(InviteServerState::Accepted) if (200..300).contains(&status) => {
                actions.push(TransactionAction::Transmit(SipMessage::Response(response.clone())));
            }

            // Non-INVITE Server Transaction
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
            | TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                actions.push(TransactionAction::Transmit(SipMessage::Response(response.clone())));
                if (100..200).contains(&status) {
                    self.state = TransactionState::NonInviteServer(NonInviteServerState::Proceeding);
                } else if status >= 200 {
                    self.state = TransactionState::NonInviteServer(NonInviteServerState::Completed);
                    self.wait_or_terminate(
                        TimerType::TimerJ,
                        TransactionState::NonInviteServer(NonInviteServerState::Terminated),
                        &mut actions,
                    );
                }
            }

            state => {
                return Err(SipError::TransactionError(format!(
                    "Invalid state for sending response {}: {}",
                    status,
                    state.name()
                )))
            }
        }

        self.last_response = Some(response);
        Ok(actions)
    }

    /// Ask for the INVITE to be cancelled
    pub fn request_cancel(&mut self) -> Result<Vec<TransactionAction>, SipError> {
        match (self.state, self.cancel) {
            (_, CancelState::Deferred) | (_, CancelState::Sent) => Ok(Vec::new()),
            (TransactionState::InviteClient(InviteClientState::Calling), _) => {
                debug!("Deferring CANCEL for {} until a provisional response", self.key);
                self.cancel = CancelState::Deferred;
                Ok(Vec::new())
            }
            (TransactionState::InviteClient(InviteClientState::Proceeding), _) => {
                self.cancel = CancelState::Sent;
                Ok(vec![TransactionAction::SendCancel])
            }
            (state, _) => Err(SipError::TransactionError(format!(
                "Cannot cancel transaction in state {}",
                state.name()
            ))),
        }
    }

    /// The transport could not deliver a message of this transaction
    pub fn on_transport_error(&mut self) -> Vec<TransactionAction> {
        let client = matches!(
            self.state,
            TransactionState::InviteClient(_) | TransactionState::NonInviteClient(_)
        );
        let pending = !self.is_finalized();
        self.terminate();
        let mut actions = Vec::new();
        if client && pending {
            self.release_deferred_cancel(&mut actions);
            actions.push(TransactionAction::TransportFailure);
        }
        actions.push(TransactionAction::Terminate);
        actions
    }

    fn terminate(&mut self) {
        self.state = match self.state {
            TransactionState::InviteClient(_) => TransactionState::InviteClient(InviteClientState::Terminated),
            TransactionState::InviteServer(_) => TransactionState::InviteServer(InviteServerState::Terminated),
            TransactionState::NonInviteClient(_) => {
                TransactionState::NonInviteClient(NonInviteClientState::Terminated)
            }
            TransactionState::NonInviteServer(_) => {
                TransactionState::NonInviteServer(NonInviteServerState::Terminated)
            }
        };
    }

    fn next_interval(&mut self) -> Duration {
        self.interval = std::cmp::min(self.interval * 2, self.sip_timers.t2);
        self.interval
    }

    /// Handle timer expiration
    pub fn on_timer(&mut self, timer_type: TimerType) -> Vec<TransactionAction> {
        debug!(
            "Timer {:?} fired for transaction {} in state {}",
            timer_type,
            self.key,
            self.state.name()
        );

        let mut actions = Vec::new();
        match (timer_type, self.state) {
            (TimerType::TimerA, TransactionState::InviteClient(InviteClientState::Calling)) => {
                self.retransmissions += 1;
                let interval = self.next_interval();
                actions.push(TransactionAction::Transmit(SipMessage::Request(self.request.clone())));
                actions.push(TransactionAction::StartTimer(TimerType::TimerA, interval));
            }

            (TimerType::TimerB, TransactionState::InviteClient(InviteClientState::Calling))
            | (TimerType::TimerB, TransactionState::InviteClient(InviteClientState::Proceeding)) => {
                self.terminate();
                actions.push(TransactionAction::StopTimer(TimerType::TimerA));
                self.release_deferred_cancel(&mut actions);
                actions.push(TransactionAction::Timeout);
                actions.push(TransactionAction::Terminate);
            }

            (TimerType::TimerD, TransactionState::InviteClient(InviteClientState::Completed))
            | (TimerType::TimerM, TransactionState::InviteClient(InviteClientState::Confirmed)) => {
                self.terminate();
                actions.push(TransactionAction::Terminate);
            }

            (TimerType::TimerE, TransactionState::NonInviteClient(state))
                if state != NonInviteClientState::Completed && state != NonInviteClientState::Terminated =>
            {
                self.retransmissions += 1;
                let interval = if state == NonInviteClientState::Proceeding {
                    self.interval = self.sip_timers.t2;
                    self.interval
                } else {
                    self.next_interval()
                };
                actions.push(TransactionAction::Transmit(SipMessage::Request(self.request.clone())));
                actions.push(TransactionAction::StartTimer(TimerType::TimerE, interval));
            }

            (TimerType::TimerF, TransactionState::NonInviteClient(NonInviteClientState::Trying))
            | (TimerType::TimerF, TransactionState::NonInviteClient(NonInviteClientState::Proceeding)) => {
                self.terminate();
                actions.push(TransactionAction::StopTimer(TimerType::TimerE));
                actions.push(TransactionAction::Timeout);
                actions.push(TransactionAction::Terminate);
            }

            (TimerType::TimerG, TransactionState::InviteServer(InviteServerState::Completed)) => {
                if let Some(response) = self.last_response.clone() {
                    self.retransmissions += 1;
                    let interval = self.next_interval();
                    actions.push(TransactionAction::Transmit(SipMessage::Response(response)));
                    actions.push(TransactionAction::StartTimer(TimerType::TimerG, interval));
                }
            }

            (TimerType::TimerH, TransactionState::InviteServer(InviteServerState::Completed)) => {
                self.terminate();
                actions.push(TransactionAction::StopTimer(TimerType::TimerG));
                actions.push(TransactionAction::Timeout);
                actions.push(TransactionAction::Terminate);
            }

            (TimerType::TimerI, TransactionState::InviteServer(InviteServerState::Confirmed))
            | (TimerType::TimerL, TransactionState::InviteServer(InviteServerState::Accepted))
            | (TimerType::TimerJ, TransactionState::NonInviteServer(NonInviteServerState::Completed))
            | (TimerType::TimerK, TransactionState::NonInviteClient(NonInviteClientState::Completed)) => {
                self.terminate();
                actions.push(TransactionAction::Terminate);
            }

            (timer, state) => {
                debug!("Ignoring stale {:?} in state {}", timer, state.name());
            }
        }
        actions
    }
}

/// Transaction layer manager
///
/// Owns every live transaction and performs RFC 3261 17.1.3 / 17.2.3
/// matching. Timers and transmission are carried out by the caller from the
/// returned actions.
pub struct TransactionLayer {
    /// Active transactions indexed by transaction key
    transactions: HashMap<TransactionKey, Transaction>,
    /// SIP timer configuration
    sip_timers: SipTimers,
}

impl TransactionLayer {
    /// Create a new transaction layer
    pub fn new(sip_timers: SipTimers) -> Self {
        Self {
            transactions: HashMap::new(),
            sip_timers,
        }
    }

    pub fn sip_timers(&self) -> SipTimers {
        self.sip_timers
    }

    /// Create a new client transaction for an outgoing request
    pub fn create_client_transaction(
        &mut self,
        request: SipRequest,
        destination: Destination,
        owner: Option<HandleId>,
    ) -> Result<(TransactionKey, Vec<TransactionAction>), SipError> {
        let method = request.method;
        let (mut txn, actions) = Transaction::client(request, destination, self.sip_timers)?;
        txn.owner = owner;
        let key = txn.key.clone();

        if self.transactions.contains_key(&key) {
            return Err(SipError::TransactionError(format!("Duplicate transaction {}", key)));
        }

        info!(
            "Created client transaction {} for {} request to {}",
            key.id.0, method, txn.destination
        );
        counter!("sip_transactions_created_total", "kind" => "client").increment(1);
        self.transactions.insert(key.clone(), txn);
        Ok((key, actions))
    }

    /// Create a new server transaction for an incoming request
    pub fn create_server_transaction(
        &mut self,
        request: SipRequest,
        source: Destination,
    ) -> Result<TransactionKey, SipError> {
        let method = request.method;
        let txn = Transaction::server(request, source, self.sip_timers)?;
        let key = txn.key.clone();

        info!(
            "Created server transaction {} for {} request from {}",
            key.id.0, method, txn.destination
        );
        counter!("sip_transactions_created_total", "kind" => "server").increment(1);
        self.transactions.insert(key.clone(), txn);
        Ok(key)
    }

    /// Client transaction a response belongs to
    pub fn match_response(&self, response: &SipResponse) -> Option<TransactionKey> {
        let branch = response.branch()?;
        let method = response.cseq()?.method;
        let key = TransactionKey::client(&branch, method);
        self.transactions.contains_key(&key).then_some(key)
    }

    /// Server transaction an incoming request belongs to (retransmission or ACK)
    pub fn match_request(&self, request: &SipRequest) -> Option<TransactionKey> {
        let branch = request.branch()?;
        let key = TransactionKey::server(&branch, request.method);
        self.transactions.contains_key(&key).then_some(key)
    }

    /// INVITE server transaction targeted by a CANCEL
    pub fn match_cancel_target(&self, cancel: &SipRequest) -> Option<TransactionKey> {
        let branch = cancel.branch()?;
        let key = TransactionKey::server(&branch, SipMethod::Invite);
        self.transactions.contains_key(&key).then_some(key)
    }

    pub fn get(&self, key: &TransactionKey) -> Option<&Transaction> {
        self.transactions.get(key)
    }

    pub fn get_mut(&mut self, key: &TransactionKey) -> Option<&mut Transaction> {
        self.transactions.get_mut(key)
    }

    pub fn remove(&mut self, key: &TransactionKey) -> Option<Transaction> {
        let removed = self.transactions.remove(key);
        if removed.is_some() {
            debug!("Removing terminated transaction {}", key);
        }
        removed
    }

    pub fn set_owner(&mut self, key: &TransactionKey, owner: HandleId) {
        if let Some(txn) = self.transactions.get_mut(key) {
            txn.owner = Some(owner);
        }
    }

    /// Check if a transaction exists
    pub fn has_transaction(&self, key: &TransactionKey) -> bool {
        self.transactions.contains_key(key)
    }

    /// Live transactions owned by a handle
    pub fn owned_by(&self, owner: HandleId) -> Vec<TransactionKey> {
        self.transactions
            .values()
            .filter(|t| t.owner == Some(owner))
            .map(|t| t.key.clone())
            .collect()
    }

    /// Live transactions sending to `destination`
    pub fn towards(&self, destination: &Destination) -> Vec<TransactionKey> {
        self.transactions
            .values()
            .filter(|t| &t.destination == destination)
            .map(|t| t.key.clone())
            .collect()
    }

    /// Get count of active transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::{RequestBuilder, ResponseBuilder};
    use crate::infrastructure::protocols::sip::headers::{NameAddr, Via};
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;

    fn dest(protocol: TransportProtocol) -> Destination {
        Destination::new("127.0.0.1", 5060, protocol)
    }

    // Helper function to create a test request
    fn create_test_request(method: SipMethod, branch: &str) -> SipRequest {
        RequestBuilder::new(method, "sip:bob@example.com")
            .via(&Via::new("UDP", "127.0.0.1", 5070, branch))
            .from(&NameAddr::new("sip:alice@example.com").with_tag("a1"))
            .to(&NameAddr::new("sip:bob@example.com"))
            .call_id("test-123")
            .cseq(1)
            .build()
    }

    // Helper function to create a test response
    fn create_test_response(request: &SipRequest, status: u16) -> SipResponse {
        ResponseBuilder::new(status).to_tag("b1").build_for_request(request)
    }

    fn transmitted(actions: &[TransactionAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, TransactionAction::Transmit(_)))
            .count()
    }

    #[test]
    fn test_transaction_id() {
        let id1 = TransactionId::from_branch("z9hG4bK776asdhds");
        let id2 = TransactionId::from_branch("z9hG4bK776asdhds");
        assert_eq!(id1, id2);

        let id3 = TransactionId::generate();
        assert!(id3.0.starts_with("z9hG4bK"));
    }

    #[test]
    fn test_ack_keys_to_invite_server_transaction() {
        assert_eq!(
            TransactionKey::server("z9hG4bK1", SipMethod::Ack),
            TransactionKey::server("z9hG4bK1", SipMethod::Invite)
        );
        assert_ne!(
            TransactionKey::server("z9hG4bK1", SipMethod::Cancel),
            TransactionKey::server("z9hG4bK1", SipMethod::Invite)
        );
    }

    #[test]
    fn test_timer_durations() {
        let timers = SipTimers::default();

        // UDP timers
        assert_eq!(
            TimerType::TimerA.default_duration(&timers, false),
            Duration::from_millis(500)
        );
        assert_eq!(
            TimerType::TimerB.default_duration(&timers, false),
            Duration::from_secs(32)
        );
        assert_eq!(
            TimerType::TimerM.default_duration(&timers, true),
            Duration::from_secs(32)
        );

        // TCP timers (some should be 0)
        assert_eq!(
            TimerType::TimerD.default_duration(&timers, true),
            Duration::from_secs(0)
        );
        assert_eq!(
            TimerType::TimerI.default_duration(&timers, true),
            Duration::from_secs(0)
        );
    }

    #[test]
    fn test_transaction_state_names() {
        let state = TransactionState::InviteClient(InviteClientState::Calling);
        assert_eq!(state.name(), "ICT-Calling");

        let state = TransactionState::NonInviteServer(NonInviteServerState::Completed);
        assert_eq!(state.name(), "NIST-Completed");
    }

    #[test]
    fn test_invite_client_retransmits_until_provisional() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKict1");
        let (mut txn, actions) = Transaction::client(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();
        assert_eq!(transmitted(&actions), 1);
        assert!(actions.contains(&TransactionAction::StartTimer(TimerType::TimerA, Duration::from_millis(500))));
        assert!(actions.contains(&TransactionAction::StartTimer(TimerType::TimerB, Duration::from_secs(32))));

        let actions = txn.on_timer(TimerType::TimerA);
        assert!(actions.contains(&TransactionAction::StartTimer(TimerType::TimerA, Duration::from_secs(1))));
        let actions = txn.on_timer(TimerType::TimerA);
        assert!(actions.contains(&TransactionAction::StartTimer(TimerType::TimerA, Duration::from_secs(2))));
        txn.on_timer(TimerType::TimerA);
        let actions = txn.on_timer(TimerType::TimerA);
        // Capped at T2
        assert!(actions.contains(&TransactionAction::StartTimer(TimerType::TimerA, Duration::from_secs(4))));
        assert_eq!(txn.retransmissions, 4);

        let actions = txn.on_response(create_test_response(&request, 180));
        assert!(actions.contains(&TransactionAction::StopTimer(TimerType::TimerA)));
        assert!(matches!(
            txn.state,
            TransactionState::InviteClient(InviteClientState::Proceeding)
        ));

        // A stale Timer A after the provisional does nothing
        assert!(txn.on_timer(TimerType::TimerA).is_empty());
    }

    #[test]
    fn test_invite_client_reliable_has_no_retransmit_timer() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKict2");
        let (_, actions) = Transaction::client(request, dest(TransportProtocol::Tcp), SipTimers::default()).unwrap();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, TransactionAction::StartTimer(TimerType::TimerA, _))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TransactionAction::StartTimer(TimerType::TimerB, _))));
    }

    #[test]
    fn test_invite_client_timeout() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKict3");
        let (mut txn, _) = Transaction::client(request, dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        let actions = txn.on_timer(TimerType::TimerB);
        assert!(actions.contains(&TransactionAction::Timeout));
        assert!(actions.contains(&TransactionAction::Terminate));
        assert!(txn.state.is_terminated());
    }

    #[test]
    fn test_invite_client_error_response_acked_until_timer_d() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKict4");
        let (mut txn, _) = Transaction::client(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        let response = create_test_response(&request, 486);
        let actions = txn.on_response(response.clone());
        assert_eq!(transmitted(&actions), 1);
        assert!(actions.contains(&TransactionAction::PassUp(response.clone())));
        assert!(matches!(
            txn.state,
            TransactionState::InviteClient(InviteClientState::Completed)
        ));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TransactionAction::StartTimer(TimerType::TimerD, _))));

        // Retransmitted 486 is ACKed again but not passed up
        let actions = txn.on_response(response);
        assert_eq!(transmitted(&actions), 1);
        assert!(!actions.iter().any(|a| matches!(a, TransactionAction::PassUp(_))));

        txn.on_timer(TimerType::TimerD);
        assert!(txn.state.is_terminated());
    }

    #[test]
    fn test_invite_client_2xx_passes_every_copy_up() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKict5");
        let (mut txn, _) = Transaction::client(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        let actions = txn.on_response(create_test_response(&request, 200));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TransactionAction::StartTimer(TimerType::TimerM, _))));
        assert_eq!(transmitted(&actions), 0);

        let forked = ResponseBuilder::new(200).to_tag("b2").build_for_request(&request);
        let actions = txn.on_response(forked.clone());
        assert_eq!(actions, vec![TransactionAction::PassUp(forked)]);

        txn.on_timer(TimerType::TimerM);
        assert!(txn.state.is_terminated());
    }

    #[test]
    fn test_cancel_deferred_until_provisional() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKict6");
        let (mut txn, _) = Transaction::client(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        assert!(txn.request_cancel().unwrap().is_empty());
        assert_eq!(txn.cancel, CancelState::Deferred);

        let actions = txn.on_response(create_test_response(&request, 100));
        assert!(actions.contains(&TransactionAction::SendCancel));
        assert_eq!(txn.cancel, CancelState::Sent);

        // Asking again is a no-op
        assert!(txn.request_cancel().unwrap().is_empty());
    }

    #[test]
    fn test_deferred_cancel_released_by_final_response() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKict7");
        let (mut txn, _) = Transaction::client(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();
        txn.request_cancel().unwrap();

        let actions = txn.on_response(create_test_response(&request, 200));
        assert!(actions.contains(&TransactionAction::ReleaseCancel));
        assert!(!actions.contains(&TransactionAction::SendCancel));
        assert!(txn.request_cancel().is_err());
    }

    #[test]
    fn test_non_invite_client_transaction() {
        let request = create_test_request(SipMethod::Register, "z9hG4bKnict1");
        let (mut txn, _) = Transaction::client(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        // Initially in Trying state
        assert!(matches!(
            txn.state,
            TransactionState::NonInviteClient(NonInviteClientState::Trying)
        ));

        txn.on_timer(TimerType::TimerE);
        txn.on_response(create_test_response(&request, 100));
        // Proceeding retransmits at T2
        let actions = txn.on_timer(TimerType::TimerE);
        assert!(actions.contains(&TransactionAction::StartTimer(TimerType::TimerE, Duration::from_secs(4))));

        let actions = txn.on_response(create_test_response(&request, 200));
        assert!(matches!(
            txn.state,
            TransactionState::NonInviteClient(NonInviteClientState::Completed)
        ));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TransactionAction::StartTimer(TimerType::TimerK, _))));
    }

    #[test]
    fn test_non_invite_client_reliable_terminates_immediately() {
        let request = create_test_request(SipMethod::Options, "z9hG4bKnict2");
        let (mut txn, _) = Transaction::client(request.clone(), dest(TransportProtocol::Tcp), SipTimers::default()).unwrap();
        let actions = txn.on_response(create_test_response(&request, 200));
        assert!(actions.contains(&TransactionAction::Terminate));
        assert!(txn.state.is_terminated());
    }

    #[test]
    fn test_invite_server_transaction_ack() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKist1");
        let mut txn = Transaction::server(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        let actions = txn.send_response(create_test_response(&request, 486)).unwrap();
        assert!(matches!(
            txn.state,
            TransactionState::InviteServer(InviteServerState::Completed)
        ));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TransactionAction::StartTimer(TimerType::TimerG, _))));

        // Timer G retransmits the response
        let actions = txn.on_timer(TimerType::TimerG);
        assert_eq!(transmitted(&actions), 1);

        txn.on_ack();
        assert!(matches!(
            txn.state,
            TransactionState::InviteServer(InviteServerState::Confirmed)
        ));
    }

    #[test]
    fn test_invite_server_absorbs_retransmissions_after_2xx() {
        let request = create_test_request(SipMethod::Invite, "z9hG4bKist2");
        let mut txn = Transaction::server(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        txn.send_response(create_test_response(&request, 180)).unwrap();
        assert_eq!(transmitted(&txn.on_retransmitted_request()), 1);

        txn.send_response(create_test_response(&request, 200)).unwrap();
        assert!(matches!(
            txn.state,
            TransactionState::InviteServer(InviteServerState::Accepted)
        ));
        assert!(txn.on_retransmitted_request().is_empty());
        assert!(txn.send_response(create_test_response(&request, 486)).is_err());

        txn.on_timer(TimerType::TimerL);
        assert!(txn.state.is_terminated());
    }

    #[test]
    fn test_non_invite_server_transaction() {
        let request = create_test_request(SipMethod::Register, "z9hG4bKnist1");
        let mut txn = Transaction::server(request.clone(), dest(TransportProtocol::Udp), SipTimers::default()).unwrap();

        // Initially in Trying state
        assert!(matches!(
            txn.state,
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        ));
        assert!(txn.on_retransmitted_request().is_empty());

        txn.send_response(create_test_response(&request, 200)).unwrap();
        assert!(matches!(
            txn.state,
            TransactionState::NonInviteServer(NonInviteServerState::Completed)
        ));
        assert_eq!(transmitted(&txn.on_retransmitted_request()), 1);
    }

    #[test]
    fn test_transport_error_fails_pending_client() {
        let request = create_test_request(SipMethod::Bye, "z9hG4bKnict3");
        let (mut txn, _) = Transaction::client(request, dest(TransportProtocol::Udp), SipTimers::default()).unwrap();
        let actions = txn.on_transport_error();
        assert!(actions.contains(&TransactionAction::TransportFailure));
        assert!(txn.state.is_terminated());
    }

    #[test]
    fn test_layer_matching() {
        let mut layer = TransactionLayer::new(SipTimers::default());
        let request = create_test_request(SipMethod::Invite, "z9hG4bKlayer1");
        let (key, _) = layer
            .create_client_transaction(request.clone(), dest(TransportProtocol::Udp), Some(HandleId(1)))
            .unwrap();

        let response = create_test_response(&request, 180);
        assert_eq!(layer.match_response(&response), Some(key.clone()));
        assert_eq!(layer.owned_by(HandleId(1)), vec![key.clone()]);
        assert!(layer
            .create_client_transaction(request, dest(TransportProtocol::Udp), None)
            .is_err());

        let incoming = create_test_request(SipMethod::Invite, "z9hG4bKlayer2");
        let server_key = layer
            .create_server_transaction(incoming.clone(), dest(TransportProtocol::Udp))
            .unwrap();
        assert_eq!(layer.match_request(&incoming), Some(server_key.clone()));
        let cancel = crate::infrastructure::protocols::sip::builder::build_cancel(&incoming);
        assert_eq!(layer.match_cancel_target(&cancel), Some(server_key));
        assert_eq!(layer.match_request(&cancel), None);
        assert_eq!(layer.transaction_count(), 2);
    }
}
