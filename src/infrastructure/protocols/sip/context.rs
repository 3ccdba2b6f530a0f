//! Engine context
//!
//! State shared by every handle of one engine: clock, timer wheel,
//! transactions, dialogs, outbox and event queue. Handles get `&mut
//! EngineContext` for the duration of a transition; nothing in here is
//! global.

use super::auth::{AuthManager, AuthOutcome};
use super::builder::{build_cancel, generate_call_id, generate_tag, ResponseBuilder};
use super::dialog::DialogStore;
use super::events::EventDispatcher;
use super::headers::{CSeq, NameAddr, Via};
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::offer_answer::OfferAnswer;
use super::rport::{response_address, stamp_received};
use super::timer::{TimerToken, TimerWheel};
use super::transaction::{
    TimerType, TransactionAction, TransactionId, TransactionKey, TransactionLayer,
};
use super::transport::{Destination, Outgoing, TransportProtocol};
use crate::config::EngineConfig;
use crate::domain::shared::{HandleId, OperationId, Status};
use metrics::counter;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timers owned by handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleTimer {
    /// Resend an INVITE after 5xx + Retry-After or 491
    RetryInvite,
    SessionRefresh,
    SessionExpiry,
    /// UAS retransmission of a reliable 1xx
    ProvisionalRetransmit,
    /// UAS retransmission of a 2xx until ACK
    FinalRetransmit,
    /// No ACK for our 2xx
    AckTimeout,
    /// No PRACK for our reliable 1xx
    PrackTimeout,
    RegistrationRefresh,
    RegistrationRetry,
    KeepAlive,
    SubscriptionRefresh,
    SubscriptionExpiry,
}

/// Payload of the engine's timer wheel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTimer {
    Transaction(TransactionKey, TimerType),
    Handle(HandleId, HandleTimer),
}

/// Running handle timers, so each can be replaced or stopped
#[derive(Debug, Default)]
pub struct HandleTimers {
    tokens: HashMap<HandleTimer, TimerToken>,
}

impl HandleTimers {
    pub fn start(&mut self, ctx: &mut EngineContext, handle: HandleId, timer: HandleTimer, delay: Duration) {
        if let Some(old) = self.tokens.remove(&timer) {
            ctx.timers.cancel(old);
        }
        let token = ctx
            .timers
            .schedule(ctx.now, delay, EngineTimer::Handle(handle, timer));
        self.tokens.insert(timer, token);
    }

    pub fn stop(&mut self, ctx: &mut EngineContext, timer: HandleTimer) {
        if let Some(token) = self.tokens.remove(&timer) {
            ctx.timers.cancel(token);
        }
    }

    pub fn stop_all(&mut self, ctx: &mut EngineContext) {
        for (_, token) in self.tokens.drain() {
            ctx.timers.cancel(token);
        }
    }

    pub fn is_running(&self, timer: HandleTimer) -> bool {
        self.tokens.contains_key(&timer)
    }

    /// Accept a firing only if it is the token we armed last
    pub fn fired(&mut self, timer: HandleTimer, token: TimerToken) -> bool {
        if self.tokens.get(&timer) == Some(&token) {
            self.tokens.remove(&timer);
            true
        } else {
            false
        }
    }
}

/// What a transaction reports to its owner
#[derive(Debug, Clone)]
pub enum TransactionEventKind {
    Response(SipResponse),
    /// Timed out or could not be delivered; carries the synthetic status
    Failed(Status),
    /// A CANCEL deferred while Calling was dropped because the INVITE resolved
    CancelReleased,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub key: TransactionKey,
    pub owner: Option<HandleId>,
    /// Request that created the transaction
    pub request: SipRequest,
    pub kind: TransactionEventKind,
}

/// Cross-handle work queued by one handle for another
#[derive(Debug, Clone)]
pub enum Deferred {
    /// Relay progress of a referred call to the REFER notifier
    ReferProgress {
        subscription: HandleId,
        status: Status,
        terminated: bool,
    },
    /// A handle may have finished its last obligation
    CheckReclaim(HandleId),
}

/// Incoming request after transaction matching
#[derive(Debug)]
pub enum IncomingRequest {
    /// New request with its server transaction
    New { key: TransactionKey, request: SipRequest },
    /// ACK that did not match an INVITE server transaction (ACK for a 2xx)
    Ack(SipRequest),
    /// CANCEL that hit a pending INVITE; the CANCEL has been answered 200
    Cancel { invite: TransactionKey, owner: Option<HandleId> },
    /// Absorbed by the transaction layer
    Absorbed,
}

/// Outcome of answering a 401/407
#[derive(Debug)]
pub enum ChallengeOutcome {
    /// Request re-sent with credentials
    Resent { key: TransactionKey, request: SipRequest },
    /// No credential for this realm; wait for the application
    NeedCredentials { realm: String },
    /// Retries exhausted or the challenge is unusable
    Failed,
}

/// Methods we accept
pub const ALLOWED_METHODS: &str =
    "INVITE, ACK, CANCEL, BYE, OPTIONS, UPDATE, PRACK, SUBSCRIBE, NOTIFY, REFER";

/// Our transport address
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: TransportProtocol,
    pub user: String,
    pub user_agent: String,
}

impl LocalEndpoint {
    pub fn via(&self, branch: &str) -> Via {
        let mut via = Via::new(self.protocol.as_str(), &self.host, self.port, branch);
        via.set_param("rport", None);
        via
    }

    /// Contact for `user`, or for our default user
    pub fn contact(&self, user: Option<&str>) -> NameAddr {
        let user = user.unwrap_or(&self.user);
        let mut uri = format!("sip:{}@{}:{}", user, self.host, self.port);
        if self.protocol != TransportProtocol::Udp {
            uri.push_str(&format!(";transport={}", self.protocol.as_str().to_ascii_lowercase()));
        }
        NameAddr::new(uri)
    }
}

pub struct EngineContext {
    pub config: EngineConfig,
    pub now: Instant,
    pub timers: TimerWheel<EngineTimer>,
    pub transactions: TransactionLayer,
    pub dialogs: DialogStore,
    pub events: EventDispatcher,
    pub local: LocalEndpoint,
    pub offer_answer: Box<dyn OfferAnswer>,
    outbox: VecDeque<Outgoing>,
    transaction_events: VecDeque<TransactionEvent>,
    transaction_timers: HashMap<(TransactionKey, TimerType), TimerToken>,
    deferred: VecDeque<Deferred>,
    next_operation: u64,
}

impl EngineContext {
    pub fn new(config: EngineConfig, offer_answer: Box<dyn OfferAnswer>, now: Instant) -> Self {
        let local = LocalEndpoint {
            host: config.local_host(),
            port: config.local.port,
            protocol: config.local.transport,
            user: config.local.user.clone(),
            user_agent: config.local.user_agent.clone(),
        };
        Self {
            transactions: TransactionLayer::new(config.timers.sip_timers()),
            config,
            now,
            timers: TimerWheel::new(),
            dialogs: DialogStore::new(),
            events: EventDispatcher::new(),
            local,
            offer_answer,
            outbox: VecDeque::new(),
            transaction_events: VecDeque::new(),
            transaction_timers: HashMap::new(),
            deferred: VecDeque::new(),
            next_operation: 1,
        }
    }

    pub fn next_operation(&mut self) -> OperationId {
        let id = OperationId(self.next_operation);
        self.next_operation += 1;
        id
    }

    pub fn new_branch(&self) -> String {
        TransactionId::generate().0
    }

    pub fn new_tag(&self) -> String {
        generate_tag()
    }

    pub fn new_call_id(&self) -> String {
        generate_call_id(&self.local.host)
    }

    pub fn via(&self) -> Via {
        self.local.via(&self.new_branch())
    }

    /// Next hop for an out-of-dialog request to `uri`
    pub fn route_for(&self, uri: &str) -> Option<Destination> {
        let target = self.config.outbound_proxy.as_deref().unwrap_or(uri);
        Destination::from_uri(target, self.local.protocol)
    }

    /// Route header for out-of-dialog requests through the outbound proxy
    pub fn outbound_route(&self) -> Vec<String> {
        self.config
            .outbound_proxy
            .as_ref()
            .map(|proxy| vec![format!("<{}>", proxy)])
            .unwrap_or_default()
    }

    pub fn defer(&mut self, action: Deferred) {
        self.deferred.push_back(action);
    }

    pub fn pop_deferred(&mut self) -> Option<Deferred> {
        self.deferred.pop_front()
    }

    pub fn pop_transaction_event(&mut self) -> Option<TransactionEvent> {
        self.transaction_events.pop_front()
    }

    pub fn pop_outgoing(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Send outside any transaction (ACK for 2xx, 2xx retransmission)
    pub fn send_stateless(&mut self, message: SipMessage, destination: Destination) {
        self.outbox.push_back(Outgoing::Message {
            message,
            destination,
        });
    }

    pub fn reset_connection(&mut self, destination: Destination) {
        info!("Requesting connection reset towards {}", destination);
        self.outbox.push_back(Outgoing::ResetConnection { destination });
    }

    /// Copy of a request we sent, with a fresh branch and the given CSeq
    pub fn reissue(&self, request: &SipRequest, cseq: u32) -> SipRequest {
        let mut request = request.clone();
        request.headers.remove("Via");
        request.headers.push_front("Via", self.via().to_string());
        request
            .headers
            .set("CSeq", CSeq::new(cseq, request.method).to_string());
        request
    }

    /// Re-send `request` with credentials answering `response`
    pub fn answer_challenge(
        &mut self,
        auth: &mut AuthManager,
        request: &SipRequest,
        response: &SipResponse,
        cseq: u32,
        destination: Destination,
        owner: HandleId,
    ) -> ChallengeOutcome {
        let mut retry = self.reissue(request, cseq);
        match auth.authorize(&mut retry, response) {
            AuthOutcome::Retry => {
                info!("Answering {} challenge for {} {}", response.status, owner, request.method);
                match self.send_request(retry.clone(), destination, Some(owner)) {
                    Ok(key) => ChallengeOutcome::Resent { key, request: retry },
                    Err(e) => {
                        warn!("Failed to re-send {} with credentials: {}", request.method, e);
                        ChallengeOutcome::Failed
                    }
                }
            }
            AuthOutcome::NoCredentials { realm } => ChallengeOutcome::NeedCredentials { realm },
            AuthOutcome::Exhausted { .. } | AuthOutcome::Unusable => ChallengeOutcome::Failed,
        }
    }

    /// Start a client transaction for `request`
    pub fn send_request(
        &mut self,
        mut request: SipRequest,
        destination: Destination,
        owner: Option<HandleId>,
    ) -> Result<TransactionKey, SipError> {
        if !request.headers.contains("User-Agent") {
            request
                .headers
                .push("User-Agent", self.local.user_agent.clone());
        }
        let (key, actions) =
            self.transactions
                .create_client_transaction(request, destination, owner)?;
        self.apply(&key, actions);
        Ok(key)
    }

    /// Answer a server transaction
    pub fn respond(&mut self, key: &TransactionKey, mut response: SipResponse) -> Result<(), SipError> {
        if !response.headers.contains("Server") {
            response
                .headers
                .push("Server", self.local.user_agent.clone());
        }
        let txn = self
            .transactions
            .get_mut(key)
            .ok_or_else(|| SipError::TransactionError(format!("No transaction {}", key)))?;
        let actions = txn.send_response(response)?;
        self.apply(key, actions);
        Ok(())
    }

    /// Answer a server transaction with a plain status
    pub fn respond_status(&mut self, key: &TransactionKey, status: u16) -> Result<(), SipError> {
        let request = self
            .transactions
            .get(key)
            .map(|t| t.request.clone())
            .ok_or_else(|| SipError::TransactionError(format!("No transaction {}", key)))?;
        let tag = if status > 100 { Some(self.new_tag()) } else { None };
        let mut builder = ResponseBuilder::new(status);
        if let Some(tag) = &tag {
            builder = builder.to_tag(tag);
        }
        self.respond(key, builder.build_for_request(&request))
    }

    /// Ask an INVITE client transaction to cancel
    pub fn cancel_transaction(&mut self, key: &TransactionKey) -> Result<(), SipError> {
        let txn = self
            .transactions
            .get_mut(key)
            .ok_or_else(|| SipError::TransactionError(format!("No transaction {}", key)))?;
        let actions = txn.request_cancel()?;
        self.apply(key, actions);
        Ok(())
    }

    /// Route a received response to its client transaction
    pub fn receive_response(&mut self, response: SipResponse) {
        let Some(key) = self.transactions.match_response(&response) else {
            debug!(
                "Dropping stray {} response (Call-ID {:?})",
                response.status,
                response.call_id()
            );
            return;
        };
        let actions = match self.transactions.get_mut(&key) {
            Some(txn) => txn.on_response(response),
            None => return,
        };
        self.apply(&key, actions);
    }

    /// Match a received request against the server transactions
    pub fn receive_request(&mut self, mut request: SipRequest, source: SocketAddr, protocol: TransportProtocol) -> IncomingRequest {
        stamp_received(&mut request, source);

        if let Some(key) = self.transactions.match_request(&request) {
            let actions = match self.transactions.get_mut(&key) {
                Some(txn) if request.method == SipMethod::Ack => {
                    if txn.is_finalized() && txn.last_response.as_ref().map(|r| r.is_success()) == Some(true) {
                        // ACK for a 2xx that reused the INVITE branch
                        return IncomingRequest::Ack(request);
                    }
                    txn.on_ack()
                }
                Some(txn) => txn.on_retransmitted_request(),
                None => Vec::new(),
            };
            self.apply(&key, actions);
            return IncomingRequest::Absorbed;
        }

        if request.method == SipMethod::Ack {
            return IncomingRequest::Ack(request);
        }

        let destination = request
            .top_via()
            .map(|via| {
                let (host, port) = response_address(&via);
                let protocol = TransportProtocol::from_str(&via.transport).unwrap_or(protocol);
                Destination::new(host, port, protocol)
            })
            .unwrap_or_else(|| Destination::from_socket_addr(source, protocol));

        let key = match self
            .transactions
            .create_server_transaction(request.clone(), destination)
        {
            Ok(key) => key,
            Err(e) => {
                warn!("Dropping {} without usable Via: {}", request.method, e);
                return IncomingRequest::Absorbed;
            }
        };

        if request.method == SipMethod::Cancel {
            return self.receive_cancel(key, &request);
        }
        IncomingRequest::New { key, request }
    }

    fn receive_cancel(&mut self, key: TransactionKey, cancel: &SipRequest) -> IncomingRequest {
        let target = self
            .transactions
            .match_cancel_target(cancel)
            .and_then(|invite| {
                let txn = self.transactions.get(&invite)?;
                (!txn.is_finalized()).then(|| (invite, txn.owner))
            });

        match target {
            Some((invite, owner)) => {
                if let Err(e) = self.respond_status(&key, 200) {
                    warn!("Failed to answer CANCEL: {}", e);
                }
                IncomingRequest::Cancel { invite, owner }
            }
            None => {
                debug!("CANCEL for unknown or completed INVITE, answering 481");
                if let Err(e) = self.respond_status(&key, 481) {
                    warn!("Failed to answer CANCEL: {}", e);
                }
                IncomingRequest::Absorbed
            }
        }
    }

    /// Fire an expired wheel entry belonging to a transaction
    pub fn fire_transaction_timer(&mut self, token: TimerToken, key: TransactionKey, timer: TimerType) {
        if self.transaction_timers.get(&(key.clone(), timer)) != Some(&token) {
            return;
        }
        self.transaction_timers.remove(&(key.clone(), timer));
        let actions = match self.transactions.get_mut(&key) {
            Some(txn) => {
                if matches!(timer, TimerType::TimerA | TimerType::TimerE | TimerType::TimerG) {
                    counter!("sip_retransmissions_total", "method" => txn.method().as_str()).increment(1);
                }
                txn.on_timer(timer)
            }
            None => return,
        };
        self.apply(&key, actions);
    }

    /// The transport could not deliver to `destination`
    pub fn transport_failed(&mut self, destination: &Destination) {
        let keys = self.transactions.towards(destination);
        for key in keys {
            let actions = match self.transactions.get_mut(&key) {
                Some(txn) => txn.on_transport_error(),
                None => continue,
            };
            self.apply(&key, actions);
        }
    }

    fn push_event(&mut self, key: &TransactionKey, kind: TransactionEventKind) {
        if let Some(txn) = self.transactions.get(key) {
            self.transaction_events.push_back(TransactionEvent {
                key: key.clone(),
                owner: txn.owner,
                request: txn.request.clone(),
                kind,
            });
        }
    }

    /// Carry out what a transaction transition asked for
    fn apply(&mut self, key: &TransactionKey, actions: Vec<TransactionAction>) {
        for action in actions {
            match action {
                TransactionAction::Transmit(message) => {
                    if let Some(txn) = self.transactions.get(key) {
                        let destination = txn.destination.clone();
                        self.send_stateless(message, destination);
                    }
                }
                TransactionAction::StartTimer(timer, duration) => {
                    let slot = (key.clone(), timer);
                    if let Some(old) = self.transaction_timers.remove(&slot) {
                        self.timers.cancel(old);
                    }
                    let token = self.timers.schedule(
                        self.now,
                        duration,
                        EngineTimer::Transaction(key.clone(), timer),
                    );
                    self.transaction_timers.insert(slot, token);
                }
                TransactionAction::StopTimer(timer) => {
                    if let Some(token) = self.transaction_timers.remove(&(key.clone(), timer)) {
                        self.timers.cancel(token);
                    }
                }
                TransactionAction::PassUp(response) => {
                    self.push_event(key, TransactionEventKind::Response(response));
                }
                TransactionAction::Timeout => {
                    counter!("sip_transaction_timeouts_total", "method" => key.method.as_str()).increment(1);
                    warn!("Transaction {} timed out", key);
                    self.push_event(key, TransactionEventKind::Failed(Status::local_timeout()));
                }
                TransactionAction::TransportFailure => {
                    warn!("Transaction {} failed in transport", key);
                    self.push_event(key, TransactionEventKind::Failed(Status::transport_failure()));
                }
                TransactionAction::SendCancel => {
                    let Some((cancel, destination, owner)) = self
                        .transactions
                        .get(key)
                        .map(|t| (build_cancel(&t.request), t.destination.clone(), t.owner))
                    else {
                        continue;
                    };
                    info!("Sending CANCEL for {}", key);
                    if let Err(e) = self.send_request(cancel, destination, owner) {
                        warn!("Failed to send CANCEL for {}: {}", key, e);
                    }
                }
                TransactionAction::ReleaseCancel => {
                    debug!("Deferred CANCEL for {} released", key);
                    self.push_event(key, TransactionEventKind::CancelReleased);
                }
                TransactionAction::Terminate => {
                    self.push_event(key, TransactionEventKind::Terminated);
                    for timer in ALL_TIMERS {
                        if let Some(token) = self.transaction_timers.remove(&(key.clone(), timer)) {
                            self.timers.cancel(token);
                        }
                    }
                    self.transactions.remove(key);
                }
            }
        }
    }
}

const ALL_TIMERS: [TimerType; 12] = [
    TimerType::TimerA,
    TimerType::TimerB,
    TimerType::TimerD,
    TimerType::TimerE,
    TimerType::TimerF,
    TimerType::TimerG,
    TimerType::TimerH,
    TimerType::TimerI,
    TimerType::TimerJ,
    TimerType::TimerK,
    TimerType::TimerL,
    TimerType::TimerM,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::RequestBuilder;
    use crate::infrastructure::protocols::sip::offer_answer::StaticOfferAnswer;
    use crate::infrastructure::protocols::sip::transaction::TransactionRole;

    fn context() -> EngineContext {
        let mut config = EngineConfig::default();
        config.local.host = Some("10.0.0.1".to_string());
        EngineContext::new(config, Box::new(StaticOfferAnswer::default()), Instant::now())
    }

    fn options(ctx: &EngineContext) -> SipRequest {
        RequestBuilder::new(SipMethod::Options, "sip:bob@192.0.2.5")
            .via(&ctx.via())
            .from(&NameAddr::new("sip:alice@10.0.0.1").with_tag("t1"))
            .to(&NameAddr::new("sip:bob@192.0.2.5"))
            .call_id("ctx-1")
            .cseq(1)
            .build()
    }

    fn drain(ctx: &mut EngineContext) -> Vec<Outgoing> {
        std::iter::from_fn(|| ctx.pop_outgoing()).collect()
    }

    #[test]
    fn test_request_goes_out_and_times_out() {
        let mut ctx = context();
        let request = options(&ctx);
        let destination = Destination::new("192.0.2.5", 5060, TransportProtocol::Udp);
        let key = ctx.send_request(request, destination, Some(HandleId(1))).unwrap();
        assert_eq!(key.role, TransactionRole::Client);
        assert_eq!(drain(&mut ctx).len(), 1);

        // Walk the clock through Timer E retransmissions up to Timer F
        while let Some(next) = ctx.timers.next_deadline() {
            ctx.now = next;
            while let Some((token, payload)) = ctx.timers.pop_due(next) {
                if let EngineTimer::Transaction(key, timer) = payload {
                    ctx.fire_transaction_timer(token, key, timer);
                }
            }
        }
        assert!(drain(&mut ctx).len() > 5);

        let events: Vec<TransactionEvent> = std::iter::from_fn(|| ctx.pop_transaction_event()).collect();
        assert!(matches!(
            &events[0].kind,
            TransactionEventKind::Failed(status) if status.code == 408 && status.is_local()
        ));
        assert_eq!(events[0].owner, Some(HandleId(1)));
        assert_eq!(ctx.transactions.transaction_count(), 0);
        assert!(ctx.timers.is_empty());
    }

    #[test]
    fn test_response_passes_up_to_owner() {
        let mut ctx = context();
        let request = options(&ctx);
        let destination = Destination::new("192.0.2.5", 5060, TransportProtocol::Udp);
        ctx.send_request(request.clone(), destination, Some(HandleId(4))).unwrap();

        ctx.receive_response(ResponseBuilder::ok().to_tag("x").build_for_request(&request));
        let event = ctx.pop_transaction_event().unwrap();
        assert_eq!(event.owner, Some(HandleId(4)));
        assert!(matches!(event.kind, TransactionEventKind::Response(ref r) if r.status == 200));
    }

    #[test]
    fn test_cancel_for_unknown_invite_gets_481() {
        let mut ctx = context();
        let mut invite = RequestBuilder::new(SipMethod::Invite, "sip:alice@10.0.0.1")
            .via(&Via::new("UDP", "192.0.2.5", 5060, "z9hG4bKpeer"))
            .from(&NameAddr::new("sip:bob@192.0.2.5").with_tag("p1"))
            .to(&NameAddr::new("sip:alice@10.0.0.1"))
            .call_id("ctx-2")
            .cseq(1)
            .build();
        let cancel = build_cancel(&invite);
        let source: SocketAddr = "192.0.2.5:5060".parse().unwrap();

        assert!(matches!(
            ctx.receive_request(cancel.clone(), source, TransportProtocol::Udp),
            IncomingRequest::Absorbed
        ));
        let sent = drain(&mut ctx);
        assert!(matches!(
            &sent[0],
            Outgoing::Message { message: SipMessage::Response(r), .. } if r.status == 481
        ));

        invite.headers.set("Via", "SIP/2.0/UDP 192.0.2.5:5060;branch=z9hG4bKpeer2");
        invite.headers.push("Contact", "<sip:bob@192.0.2.5>");
        let IncomingRequest::New { key, .. } = ctx.receive_request(invite.clone(), source, TransportProtocol::Udp) else {
            panic!("expected new INVITE");
        };
        ctx.transactions.set_owner(&key, HandleId(9));
        assert!(matches!(
            ctx.receive_request(build_cancel(&invite), source, TransportProtocol::Udp),
            IncomingRequest::Cancel { owner: Some(HandleId(9)), .. }
        ));
    }

    #[test]
    fn test_handle_timers_ignore_stale_tokens() {
        let mut ctx = context();
        let mut timers = HandleTimers::default();
        timers.start(&mut ctx, HandleId(1), HandleTimer::KeepAlive, Duration::from_secs(1));
        timers.start(&mut ctx, HandleId(1), HandleTimer::KeepAlive, Duration::from_secs(5));
        assert_eq!(ctx.timers.len(), 1);

        let (token, payload) = ctx.timers.pop_due(ctx.now + Duration::from_secs(5)).unwrap();
        assert_eq!(payload, EngineTimer::Handle(HandleId(1), HandleTimer::KeepAlive));
        assert!(timers.fired(HandleTimer::KeepAlive, token));
        assert!(!timers.fired(HandleTimer::KeepAlive, token));
    }
}
