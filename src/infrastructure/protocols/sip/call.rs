//! Call control
//!
//! A [`Call`] drives one INVITE dialog usage from either side: the initial
//! INVITE with forking, CANCEL and retries, re-INVITE and UPDATE with glare
//! handling, reliable provisional responses, session timers and teardown.
//! Every method takes the shared [`EngineContext`]; nothing here blocks.

use super::auth::{AuthManager, Credential};
use super::builder::{RequestBuilder, ResponseBuilder};
use super::call_state::{CallDirection, CallEvent, CallState, CallStateMachine, CallTimes};
use super::context::{
    ChallengeOutcome, Deferred, EngineContext, HandleTimer, HandleTimers, TransactionEvent,
    TransactionEventKind, ALLOWED_METHODS,
};
use super::dialog::{DialogId, RemoteCSeq};
use super::events::{Indication, OperationKind, PendingResponse};
use super::headers::{parse_delta_seconds, parse_token_list, NameAddr, RAck, Refresher, SessionExpires};
use super::message::{Body, Headers, SipMethod, SipRequest, SipResponse};
use super::offer_answer::{Carrier, Negotiation};
use super::timer::TimerToken;
use super::transaction::TransactionKey;
use super::transport::Destination;
use crate::config::{CallConfig, RefresherPreference, ReliableProvisional};
use crate::domain::shared::{EngineError, HandleId, OperationId, Result, Status};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extensions we understand in Require
const KNOWN_EXTENSIONS: [&str; 3] = ["100rel", "timer", "precondition"];

/// Options of an outgoing call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Request-URI and default To
    pub target: String,
    /// Our address of record; defaults to the local user at the local host
    pub from: Option<String>,
    pub to: Option<String>,
    /// Offer to send instead of asking the negotiator
    pub body: Option<Body>,
    /// Send the INVITE without an offer
    pub late_offer: bool,
    pub headers: Vec<(String, String)>,
    /// REFER notifier that relays the progress of this call
    pub refer_subscription: Option<HandleId>,
    pub referred_by: Option<String>,
}

impl CallOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_late_offer(mut self) -> Self {
        self.late_offer = true;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Relay this call's progress as NOTIFYs on a REFER subscription
    pub fn with_refer_subscription(mut self, subscription: HandleId, referred_by: Option<String>) -> Self {
        self.refer_subscription = Some(subscription);
        self.referred_by = referred_by;
        self
    }
}

/// Per-call tunables, seeded from [`CallConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParameters {
    pub session_expires: u32,
    pub min_se: u32,
    pub refresher: RefresherPreference,
    pub reliable_provisional: ReliableProvisional,
    pub preconditions: bool,
    pub max_invite_retries: u32,
    pub max_glare_retries: u32,
}

impl From<&CallConfig> for CallParameters {
    fn from(config: &CallConfig) -> Self {
        Self {
            session_expires: config.session_expires,
            min_se: config.min_se,
            refresher: config.refresher,
            reliable_provisional: config.reliable_provisional,
            preconditions: config.preconditions,
            max_invite_retries: config.max_invite_retries,
            max_glare_retries: config.max_glare_retries,
        }
    }
}

impl CallParameters {
    pub fn with_session_expires(mut self, seconds: u32) -> Self {
        self.session_expires = seconds;
        self
    }

    pub fn with_min_se(mut self, seconds: u32) -> Self {
        self.min_se = seconds;
        self
    }

    pub fn with_refresher(mut self, refresher: RefresherPreference) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn with_reliable_provisional(mut self, mode: ReliableProvisional) -> Self {
        self.reliable_provisional = mode;
        self
    }

    pub fn with_preconditions(mut self, enabled: bool) -> Self {
        self.preconditions = enabled;
        self
    }

    pub fn with_max_invite_retries(mut self, retries: u32) -> Self {
        self.max_invite_retries = retries;
        self
    }

    pub fn with_max_glare_retries(mut self, retries: u32) -> Self {
        self.max_glare_retries = retries;
        self
    }
}

/// Answer to an incoming request
#[derive(Debug, Clone)]
pub struct ResponseOptions {
    pub status: u16,
    pub reason: Option<String>,
    pub body: Option<Body>,
    /// Force (or suppress) reliable delivery of a provisional response
    pub reliable: Option<bool>,
    pub headers: Vec<(String, String)>,
}

impl ResponseOptions {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            body: None,
            reliable: None,
            headers: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = Some(reliable);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn builder(&self, local_tag: &str) -> ResponseBuilder {
        let mut builder = ResponseBuilder::new(self.status).to_tag(local_tag);
        if let Some(reason) = &self.reason {
            builder = builder.reason(reason.clone());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value.clone());
        }
        builder
    }
}

/// Which dialog a BYE goes to
#[derive(Debug, Clone, Default)]
pub struct ByeOptions {
    /// To-tag of a forked branch; the answered branch when unset
    pub remote_tag: Option<String>,
}

impl ByeOptions {
    pub fn with_remote_tag(mut self, tag: impl Into<String>) -> Self {
        self.remote_tag = Some(tag.into());
        self
    }
}

/// Options of a re-INVITE or UPDATE
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub body: Option<Body>,
    /// Carry an offer (from `body` or the negotiator)
    pub offer: bool,
    pub headers: Vec<(String, String)>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            body: None,
            offer: true,
            headers: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Session refresh without a new offer
    pub fn without_offer(mut self) -> Self {
        self.offer = false;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// What the peer told us it supports
#[derive(Debug, Clone, Default)]
struct PeerCapabilities {
    allows_update: bool,
    supports_timer: bool,
    supports_100rel: bool,
    requires_100rel: bool,
    requires_precondition: bool,
}

impl PeerCapabilities {
    fn learn(&mut self, headers: &Headers) {
        let supported = parse_token_list(&headers.values("Supported"));
        let required = parse_token_list(&headers.values("Require"));
        let allow = parse_token_list(&headers.values("Allow"));
        if !allow.is_empty() {
            self.allows_update = allow.iter().any(|m| m == "update");
        }
        let has = |tag: &str| supported.iter().chain(required.iter()).any(|t| t == tag);
        self.supports_timer |= has("timer");
        self.supports_100rel |= has("100rel");
        self.requires_100rel = required.iter().any(|t| t == "100rel");
        self.requires_precondition = required.iter().any(|t| t == "precondition");
    }
}

/// Negotiated session timer
#[derive(Debug, Clone, Copy, Default)]
struct Session {
    interval: Option<u32>,
    local_refresher: bool,
}

/// One remote branch of the call
#[derive(Debug, Clone)]
struct Branch {
    dialog: DialogId,
    /// Last RSeq accepted on this branch
    rseq: Option<u32>,
    /// ACK sent for this branch's 2xx, replayed on retransmissions
    ack: Option<(SipRequest, Destination)>,
}

/// Our outstanding INVITE or re-INVITE
#[derive(Debug, Clone)]
struct ClientInvite {
    /// None while waiting for a retry timer or for credentials
    key: Option<TransactionKey>,
    request: Option<SipRequest>,
    operation: Option<OperationId>,
    initial: bool,
    body: Option<Body>,
    offer: bool,
    headers: Vec<(String, String)>,
    retries: u32,
    glare_retries: u32,
    session_retried: bool,
    /// Challenge waiting for `authenticate`
    challenge: Option<SipResponse>,
}

/// INVITE or re-INVITE received from the peer
#[derive(Debug, Clone)]
struct ServerInvite {
    key: TransactionKey,
    request: SipRequest,
    initial: bool,
    reliable: Option<PendingReliable>,
    next_rseq: u32,
    final_response: Option<SipResponse>,
    interval: Duration,
}

/// Reliable provisional response waiting for PRACK
#[derive(Debug, Clone)]
struct PendingReliable {
    response: SipResponse,
    rseq: u32,
    interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Bye,
    Prack,
    Update,
}

/// Non-INVITE request of ours still waiting for its final response
#[derive(Debug, Clone)]
struct Outstanding {
    kind: RequestKind,
    operation: Option<OperationId>,
    request: SipRequest,
    dialog: DialogId,
}

/// Call handle
pub struct Call {
    id: HandleId,
    machine: CallStateMachine,
    direction: CallDirection,
    options: CallOptions,
    params: CallParameters,
    call_id: String,
    local_tag: String,
    local_uri: NameAddr,
    cseq: u32,
    dialog: Option<DialogId>,
    branches: Vec<Branch>,
    invite: Option<ClientInvite>,
    server: Option<ServerInvite>,
    requests: HashMap<TransactionKey, Outstanding>,
    queued: VecDeque<(OperationId, SessionOptions)>,
    negotiation: Negotiation,
    session: Session,
    peer: PeerCapabilities,
    timers: HandleTimers,
    auth: AuthManager,
    cancel_op: Option<OperationId>,
    /// 2xx that arrived while a PRACK was outstanding
    held: Option<(SipRequest, SipResponse)>,
    /// BYE requested while Completing
    bye_after_ack: Option<Option<OperationId>>,
    precondition_update: bool,
    answered: Option<Status>,
    zombie: bool,
}

impl Call {
    /// New outgoing call, not started yet
    pub fn outgoing(ctx: &mut EngineContext, id: HandleId, options: CallOptions) -> Self {
        let local_uri = NameAddr::new(
            options
                .from
                .clone()
                .unwrap_or_else(|| format!("sip:{}@{}", ctx.local.user, ctx.local.host)),
        );
        let mut call = Self::new(ctx, id, CallDirection::Outbound, local_uri);
        call.call_id = ctx.new_call_id();
        call.options = options;
        call
    }

    /// New incoming call for an INVITE that created a server transaction
    pub fn incoming(ctx: &mut EngineContext, id: HandleId, key: TransactionKey, request: SipRequest) -> Self {
        let local_uri = request.to().unwrap_or_else(|| NameAddr::new(request.uri.clone()));
        let mut call = Self::new(ctx, id, CallDirection::Inbound, local_uri);
        call.call_id = request.call_id().unwrap_or_default().to_string();
        call.receive_invite(ctx, key, request);
        call
    }

    fn new(ctx: &mut EngineContext, id: HandleId, direction: CallDirection, local_uri: NameAddr) -> Self {
        Self {
            id,
            machine: CallStateMachine::new(),
            direction,
            options: CallOptions::default(),
            params: CallParameters::from(&ctx.config.call),
            call_id: String::new(),
            local_tag: ctx.new_tag(),
            local_uri,
            cseq: 0,
            dialog: None,
            branches: Vec::new(),
            invite: None,
            server: None,
            requests: HashMap::new(),
            queued: VecDeque::new(),
            negotiation: Negotiation::default(),
            session: Session::default(),
            peer: PeerCapabilities::default(),
            timers: HandleTimers::default(),
            auth: AuthManager::new(ctx.config.auth.max_retries),
            cancel_op: None,
            held: None,
            bye_after_ack: None,
            precondition_update: false,
            answered: None,
            zombie: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// When the call was answered and ended
    pub fn times(&self) -> &CallTimes {
        self.machine.times()
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn parameters(&self) -> &CallParameters {
        &self.params
    }

    /// Dialog of the answered (or first early) branch
    pub fn dialog(&self) -> Option<&DialogId> {
        self.dialog.as_ref()
    }

    /// Remote tags of every branch we know
    pub fn branch_tags(&self) -> Vec<String> {
        self.branches
            .iter()
            .map(|b| b.dialog.remote_tag.clone())
            .collect()
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie
    }

    /// Destroyed, done, and no client transaction of ours is left
    pub fn is_reclaimable(&self, ctx: &EngineContext) -> bool {
        self.zombie
            && matches!(self.state(), CallState::Idle | CallState::Terminated)
            && ctx.transactions.owned_by(self.id).is_empty()
    }

    // ----- application operations -----

    pub fn start(&mut self, ctx: &mut EngineContext, operation: OperationId) -> Result<()> {
        if self.direction != CallDirection::Outbound || self.state() != CallState::Idle {
            return Err(EngineError::InvalidState(format!(
                "Cannot start call {} in state {}",
                self.id,
                self.state().name()
            )));
        }
        if ctx.route_for(&self.options.target).is_none() {
            return Err(EngineError::InvalidOperation(format!(
                "Unroutable target {}",
                self.options.target
            )));
        }
        self.invite = Some(ClientInvite {
            key: None,
            request: None,
            operation: Some(operation),
            initial: true,
            body: self.options.body.clone(),
            offer: !self.options.late_offer,
            headers: self.options.headers.clone(),
            retries: 0,
            glare_retries: 0,
            session_retried: false,
            challenge: None,
        });
        if let Err(e) = self.send_invite(ctx) {
            self.invite = None;
            return Err(e);
        }
        self.transition(ctx, CallEvent::Invite, None);
        Ok(())
    }

    pub fn cancel(&mut self, ctx: &mut EngineContext, operation: OperationId) -> Result<()> {
        if self.direction != CallDirection::Outbound || !self.machine.can_cancel() {
            return Err(EngineError::InvalidState(format!(
                "Nothing to cancel on {} in state {}",
                self.id,
                self.state().name()
            )));
        }
        if self.cancel_op.is_some() {
            return Err(EngineError::InvalidState("CANCEL already requested".to_string()));
        }
        let key = self.invite.as_ref().and_then(|i| i.key.clone());
        match key {
            Some(key) => {
                ctx.cancel_transaction(&key)
                    .map_err(|e| EngineError::InvalidState(e.to_string()))?;
                self.cancel_op = Some(operation);
            }
            None => {
                // Waiting for a retry timer or credentials: nothing on the wire
                self.timers.stop(ctx, HandleTimer::RetryInvite);
                let invite = self.invite.take();
                ctx.events
                    .result(self.id, operation, OperationKind::Cancel, Status::ok(), true);
                if let Some(op) = invite.and_then(|i| i.operation) {
                    ctx.events.result(
                        self.id,
                        op,
                        OperationKind::StartCall,
                        Status::local_cancelled(),
                        true,
                    );
                }
                self.reject_local_offer(ctx);
                self.transition(ctx, CallEvent::Ended, Some(Status::local_cancelled()));
            }
        }
        Ok(())
    }

    pub fn bye(&mut self, ctx: &mut EngineContext, operation: OperationId, options: ByeOptions) -> Result<()> {
        if !self.machine.can_terminate() {
            return Err(EngineError::InvalidState(format!(
                "Cannot send BYE on {} in state {}",
                self.id,
                self.state().name()
            )));
        }
        let dialog = match &options.remote_tag {
            Some(tag) => self
                .branches
                .iter()
                .find(|b| &b.dialog.remote_tag == tag && b.ack.is_some())
                .map(|b| b.dialog.clone())
                .ok_or_else(|| EngineError::InvalidOperation(format!("No answered branch with tag {}", tag)))?,
            None => self
                .dialog
                .clone()
                .ok_or_else(|| EngineError::InvalidState("Call has no dialog".to_string()))?,
        };
        if self.held.is_some() && Some(&dialog) == self.dialog.as_ref() {
            // ACK first, BYE once the held 2xx is processed
            self.bye_after_ack = Some(Some(operation));
            return Ok(());
        }
        self.send_bye(ctx, Some(operation), dialog)
    }

    pub fn reinvite(&mut self, ctx: &mut EngineContext, operation: OperationId, options: SessionOptions) -> Result<()> {
        if self.state() != CallState::Ready {
            return Err(EngineError::InvalidState(format!(
                "Cannot re-INVITE {} in state {}",
                self.id,
                self.state().name()
            )));
        }
        if self.invite.is_some() || self.server.is_some() || !self.negotiation.is_idle() {
            debug!("Queueing re-INVITE on {} behind the pending exchange", self.id);
            self.queued.push_back((operation, options));
            return Ok(());
        }
        self.start_reinvite(ctx, Some(operation), options)
    }

    pub fn update(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, options: SessionOptions) -> Result<()> {
        let dialog = match self.state() {
            CallState::Ready | CallState::Early | CallState::Proceeding | CallState::Completed => {
                self.dialog.clone()
            }
            _ => None,
        }
        .ok_or_else(|| EngineError::InvalidState(format!("Cannot UPDATE {} in state {}", self.id, self.state().name())))?;

        let offer = options.offer || options.body.is_some();
        if offer && !self.negotiation.can_offer() {
            return Err(EngineError::InvalidState(
                "Offer/answer exchange in progress".to_string(),
            ));
        }

        let (mut request, destination) = self.dialog_request(ctx, &dialog, SipMethod::Update)?;
        let body = if offer {
            options.body.clone().or_else(|| ctx.offer_answer.generate_offer(self.id))
        } else {
            None
        };
        self.add_session_headers(&mut request.headers);
        request.headers.push("Supported", self.supported());
        for (name, value) in &options.headers {
            request.headers.push(name.clone(), value.clone());
        }
        request.set_body(body.clone());

        let key = ctx.send_request(request.clone(), destination, Some(self.id))?;
        if body.is_some() {
            self.negotiation.local_offer(Carrier::Update);
        }
        self.requests.insert(
            key,
            Outstanding {
                kind: RequestKind::Update,
                operation,
                request,
                dialog,
            },
        );
        Ok(())
    }

    /// Store new parameters; unchanged values are a no-op
    pub fn set_parameters(&mut self, ctx: &mut EngineContext, operation: OperationId, params: CallParameters) {
        if params != self.params {
            info!("Call {} parameters updated", self.id);
            self.params = params;
        }
        ctx.events
            .result(self.id, operation, OperationKind::SetParameters, Status::ok(), true);
    }

    /// Add a credential and answer a challenge that is waiting for it
    pub fn authenticate(&mut self, ctx: &mut EngineContext, operation: OperationId, credential: Credential) {
        self.auth.add_credential(credential);
        ctx.events
            .result(self.id, operation, OperationKind::Authenticate, Status::ok(), true);

        let waiting = self.invite.as_mut().and_then(|invite| {
            let response = invite.challenge.take()?;
            Some((invite.request.clone()?, response))
        });
        if let Some((request, response)) = waiting {
            let status = Status::remote(response.status, response.reason.clone());
            self.answer_invite_challenge(ctx, &request, &response, status);
        }
    }

    /// Answer our pending INVITE (or re-INVITE) server transaction
    pub fn respond(
        &mut self,
        ctx: &mut EngineContext,
        operation: OperationId,
        key: &TransactionKey,
        options: ResponseOptions,
    ) -> Result<()> {
        let server = self
            .server
            .as_ref()
            .filter(|s| &s.key == key && s.final_response.is_none())
            .ok_or_else(|| EngineError::TokenConsumed(format!("INVITE on {} already answered", self.id)))?;
        if !(101..700).contains(&options.status) {
            return Err(EngineError::InvalidOperation(format!(
                "Cannot answer INVITE with {}",
                options.status
            )));
        }
        if !server.initial && options.status < 200 {
            return Err(EngineError::InvalidOperation(
                "Provisional answers to re-INVITE are sent automatically".to_string(),
            ));
        }
        let result = match options.status {
            101..=199 => self.send_provisional(ctx, &options),
            200..=299 => self.send_success(ctx, &options),
            _ => self.send_failure(ctx, &options),
        };
        result?;
        ctx.events.result(
            self.id,
            operation,
            OperationKind::Respond,
            Status::local(options.status, options.reason.clone().unwrap_or_default()),
            true,
        );
        Ok(())
    }

    /// Handle is being destroyed; finish what the protocol still requires
    pub fn destroy(&mut self, ctx: &mut EngineContext) {
        self.zombie = true;
        info!("Destroying call {} in state {}", self.id, self.state().name());
        match self.state() {
            CallState::Idle | CallState::Terminated | CallState::Terminating => {}
            CallState::Calling | CallState::Proceeding => {
                let key = self.invite.as_ref().and_then(|i| i.key.clone());
                match key {
                    Some(key) => {
                        if let Err(e) = ctx.cancel_transaction(&key) {
                            debug!("CANCEL on destroy not possible: {}", e);
                        }
                    }
                    None => {
                        self.invite = None;
                        self.transition(ctx, CallEvent::Ended, Some(Status::local_cancelled()));
                    }
                }
            }
            // ACK and BYE follow once the held 2xx is released
            CallState::Completing => {}
            CallState::Received | CallState::Early => {
                if let Err(e) = self.send_failure(ctx, &ResponseOptions::new(480)) {
                    debug!("Rejecting INVITE on destroy failed: {}", e);
                }
            }
            CallState::Completed | CallState::Ready => self.hangup(ctx),
        }
        self.timers.stop_all(ctx);
    }

    /// Called when the handle leaves the arena
    pub fn reclaim(&mut self, ctx: &mut EngineContext) {
        self.timers.stop_all(ctx);
        ctx.dialogs.remove_owned_by(self.id);
    }

    // ----- incoming requests -----

    fn receive_invite(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: SipRequest) {
        self.peer.learn(&request.headers);

        let unsupported: Vec<String> = parse_token_list(&request.headers.values("Require"))
            .into_iter()
            .filter(|tag| !KNOWN_EXTENSIONS.contains(&tag.as_str()))
            .chain(
                (self.peer.requires_100rel
                    && self.params.reliable_provisional == ReliableProvisional::Disabled)
                    .then(|| "100rel".to_string()),
            )
            .collect();
        if !unsupported.is_empty() {
            info!("Rejecting INVITE requiring {:?}", unsupported);
            let response = ResponseBuilder::new(420)
                .to_tag(&self.local_tag)
                .header("Unsupported", unsupported.join(", "))
                .build_for_request(&request);
            self.reject_initial(ctx, &key, response);
            return;
        }
        if let Some(response) = self.session_too_small(&request) {
            self.reject_initial(ctx, &key, response);
            return;
        }

        if let Err(e) = ctx.respond(&key, ResponseBuilder::new(100).build_for_request(&request)) {
            warn!("Failed to send 100 Trying: {}", e);
        }

        let offer = request.body();
        if let Some(body) = &offer {
            self.negotiation.remote_offer(Carrier::Invite);
            if !ctx.offer_answer.set_remote_offer(self.id, body) {
                self.negotiation.abandon();
                let response = ResponseBuilder::new(488).to_tag(&self.local_tag).build_for_request(&request);
                self.reject_initial(ctx, &key, response);
                return;
            }
        }

        self.server = Some(ServerInvite {
            key: key.clone(),
            request: request.clone(),
            initial: true,
            reliable: None,
            next_rseq: rand::thread_rng().gen_range(1..=0x7fff),
            final_response: None,
            interval: ctx.transactions.sip_timers().t1,
        });

        let from = request.headers.get("From").unwrap_or_default().to_string();
        let to = request.headers.get("To").unwrap_or_default().to_string();
        info!("Incoming call {} from {}", self.id, from);
        ctx.events.indicate(
            self.id,
            Indication::IncomingCall {
                token: PendingResponse::new(self.id, key, request),
                from,
                to,
                offer,
            },
        );
        self.transition(ctx, CallEvent::Incoming, None);
    }

    /// Reject the INVITE that created this handle before the application saw it
    fn reject_initial(&mut self, ctx: &mut EngineContext, key: &TransactionKey, response: SipResponse) {
        if let Err(e) = ctx.respond(key, response) {
            warn!("Failed to reject INVITE: {}", e);
        }
        self.zombie = true;
        if let Err(e) = self.machine.process_event(CallEvent::Ended, ctx.now) {
            debug!("{}", e);
        }
        ctx.defer(Deferred::CheckReclaim(self.id));
    }

    /// 422 for a Session-Expires below our Min-SE
    fn session_too_small(&self, request: &SipRequest) -> Option<SipResponse> {
        if self.params.session_expires == 0 {
            return None;
        }
        let se = request
            .headers
            .get("Session-Expires")
            .and_then(SessionExpires::parse)?;
        (se.interval < self.params.min_se).then(|| {
            ResponseBuilder::new(422)
                .to_tag(&self.local_tag)
                .header("Min-SE", self.params.min_se.to_string())
                .build_for_request(request)
        })
    }

    /// In-dialog request routed to this call
    pub fn on_request(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: SipRequest) {
        let Some(dialog) = DialogId::for_incoming_request(&request) else {
            self.reply(ctx, &key, 481);
            return;
        };
        if ctx.dialogs.check_remote_cseq(&dialog, &request) == RemoteCSeq::OutOfOrder {
            self.reply(ctx, &key, 500);
            return;
        }
        if self.state() == CallState::Terminated {
            self.reply(ctx, &key, 481);
            return;
        }
        match request.method {
            SipMethod::Bye => self.on_bye(ctx, key, &request, dialog),
            SipMethod::Invite => self.on_reinvite(ctx, key, request, dialog),
            SipMethod::Update => self.on_update(ctx, key, &request, dialog),
            SipMethod::Prack => self.on_prack(ctx, key, &request),
            SipMethod::Options => {
                let response = ResponseBuilder::ok()
                    .header("Allow", ALLOWED_METHODS)
                    .header("Supported", self.supported())
                    .build_for_request(&request);
                if let Err(e) = ctx.respond(&key, response) {
                    warn!("Failed to answer OPTIONS: {}", e);
                }
            }
            method => {
                debug!("{} not handled inside a call", method);
                self.reply(ctx, &key, 501);
            }
        }
    }

    fn reply(&self, ctx: &mut EngineContext, key: &TransactionKey, status: u16) {
        if let Err(e) = ctx.respond_status(key, status) {
            warn!("Failed to answer {}: {}", status, e);
        }
    }

    fn on_bye(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: &SipRequest, dialog: DialogId) {
        if let Err(e) = ctx.respond(&key, ResponseBuilder::ok().build_for_request(request)) {
            warn!("Failed to answer BYE: {}", e);
        }

        if self.dialog.as_ref() != Some(&dialog) {
            info!("BYE on forked branch {} of {}", dialog.remote_tag, self.id);
            self.branches.retain(|b| b.dialog != dialog);
            ctx.dialogs.remove(&dialog);
            return;
        }

        // BYE in an early dialog ends the pending INVITE too
        if let Some(server) = self.server.take() {
            if server.final_response.is_none() {
                let response = ResponseBuilder::new(487)
                    .to_tag(&self.local_tag)
                    .build_for_request(&server.request);
                if let Err(e) = ctx.respond(&server.key, response) {
                    debug!("Could not answer INVITE after BYE: {}", e);
                }
            }
        }
        info!("Call {} hung up by peer", self.id);
        ctx.events.indicate(self.id, Indication::IncomingBye);
        self.transition(ctx, CallEvent::Ended, Some(Status::remote(200, "OK")));
    }

    fn on_reinvite(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: SipRequest, dialog: DialogId) {
        if self.invite.as_ref().map(|i| i.key.is_some()).unwrap_or(false) || self.negotiation.awaiting_answer() {
            info!("re-INVITE glare on {}, answering 491", self.id);
            self.reply(ctx, &key, 491);
            return;
        }
        if self.server.is_some() || self.negotiation.owes_answer() {
            let retry_after = rand::thread_rng().gen_range(0..=10);
            let response = ResponseBuilder::new(500)
                .header("Retry-After", retry_after.to_string())
                .build_for_request(&request);
            if let Err(e) = ctx.respond(&key, response) {
                warn!("Failed to answer overlapping re-INVITE: {}", e);
            }
            return;
        }
        if let Some(response) = self.session_too_small(&request) {
            if let Err(e) = ctx.respond(&key, response) {
                warn!("Failed to send 422: {}", e);
            }
            return;
        }

        self.peer.learn(&request.headers);
        ctx.dialogs
            .refresh_target(&dialog, request.headers.get("Contact"));

        let body = request.body();
        if let Some(offer) = &body {
            self.negotiation.remote_offer(Carrier::Invite);
            if !ctx.offer_answer.set_remote_offer(self.id, offer) {
                self.negotiation.abandon();
                self.reply(ctx, &key, 488);
                return;
            }
        }

        self.server = Some(ServerInvite {
            key,
            request,
            initial: false,
            reliable: None,
            next_rseq: 1,
            final_response: None,
            interval: ctx.transactions.sip_timers().t1,
        });
        ctx.events.indicate(
            self.id,
            Indication::SessionUpdated {
                method: SipMethod::Invite,
                body,
            },
        );
        if let Err(e) = self.send_success(ctx, &ResponseOptions::new(200)) {
            warn!("Failed to answer re-INVITE on {}: {}", self.id, e);
        }
    }

    fn on_update(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: &SipRequest, dialog: DialogId) {
        if self.negotiation.awaiting_answer() {
            info!("UPDATE glare on {}, answering 491", self.id);
            self.reply(ctx, &key, 491);
            return;
        }
        if self.negotiation.owes_answer() {
            let response = ResponseBuilder::new(500)
                .header("Retry-After", rand::thread_rng().gen_range(0..=10).to_string())
                .build_for_request(request);
            if let Err(e) = ctx.respond(&key, response) {
                warn!("Failed to answer overlapping UPDATE: {}", e);
            }
            return;
        }
        if let Some(response) = self.session_too_small(request) {
            if let Err(e) = ctx.respond(&key, response) {
                warn!("Failed to send 422: {}", e);
            }
            return;
        }

        self.peer.learn(&request.headers);
        ctx.dialogs
            .refresh_target(&dialog, request.headers.get("Contact"));

        let body = request.body();
        let mut answer = None;
        if let Some(offer) = &body {
            self.negotiation.remote_offer(Carrier::Update);
            if !ctx.offer_answer.set_remote_offer(self.id, offer) {
                self.negotiation.abandon();
                self.reply(ctx, &key, 488);
                return;
            }
            answer = ctx.offer_answer.generate_answer(self.id);
            self.negotiation.complete();
        }

        let mut builder = ResponseBuilder::ok()
            .header("Contact", ctx.local.contact(None).to_string())
            .body(answer);
        if self.dialog_confirmed(ctx) {
            if let Some(se) = self.session_for_request(request) {
                builder = builder.header("Session-Expires", se.to_string());
                if self.peer.supports_timer {
                    builder = builder.header("Require", "timer");
                }
            }
        }
        if let Err(e) = ctx.respond(&key, builder.build_for_request(request)) {
            warn!("Failed to answer UPDATE: {}", e);
            return;
        }
        if self.state() == CallState::Ready {
            self.arm_session(ctx);
        }
        ctx.events.indicate(
            self.id,
            Indication::SessionUpdated {
                method: SipMethod::Update,
                body,
            },
        );
    }

    fn on_prack(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: &SipRequest) {
        let rack = request.headers.get("RAck").and_then(RAck::parse);
        let matched = match (&self.server, &rack) {
            (Some(server), Some(rack)) => server
                .reliable
                .as_ref()
                .map(|pending| {
                    pending.rseq == rack.rseq
                        && Some(rack.cseq) == server.request.cseq().map(|c| c.seq)
                })
                .unwrap_or(false),
            _ => false,
        };
        if !matched {
            debug!("PRACK {:?} matches nothing on {}", rack, self.id);
            self.reply(ctx, &key, 481);
            return;
        }

        if let Some(server) = self.server.as_mut() {
            server.reliable = None;
        }
        self.timers.stop(ctx, HandleTimer::ProvisionalRetransmit);
        self.timers.stop(ctx, HandleTimer::PrackTimeout);

        let mut answer = None;
        if let Some(body) = request.body() {
            if self.negotiation.awaiting_answer_to(Carrier::ReliableProvisional) {
                if ctx.offer_answer.process_answer(self.id, &body) {
                    self.negotiation.complete();
                } else {
                    self.negotiation.abandon();
                }
            } else if self.negotiation.can_offer() {
                self.negotiation.remote_offer(Carrier::Prack);
                if ctx.offer_answer.set_remote_offer(self.id, &body) {
                    answer = ctx.offer_answer.generate_answer(self.id);
                    self.negotiation.complete();
                } else {
                    self.negotiation.abandon();
                    self.reply(ctx, &key, 488);
                    return;
                }
            }
        }
        let response = ResponseBuilder::ok().body(answer).build_for_request(request);
        if let Err(e) = ctx.respond(&key, response) {
            warn!("Failed to answer PRACK: {}", e);
        }
    }

    /// ACK for a 2xx we sent
    pub fn on_ack(&mut self, ctx: &mut EngineContext, request: &SipRequest) {
        let matches = self
            .server
            .as_ref()
            .map(|s| {
                s.final_response.as_ref().map(|r| r.is_success()).unwrap_or(false)
                    && request.cseq().map(|c| c.seq) == s.request.cseq().map(|c| c.seq)
            })
            .unwrap_or(false);
        if !matches {
            debug!("Stray ACK on {}", self.id);
            return;
        }
        let Some(server) = self.server.take() else {
            return;
        };
        self.timers.stop(ctx, HandleTimer::FinalRetransmit);
        self.timers.stop(ctx, HandleTimer::AckTimeout);

        if self.negotiation.awaiting_answer_to(Carrier::Final) {
            match request.body() {
                Some(body) if ctx.offer_answer.process_answer(self.id, &body) => self.negotiation.complete(),
                _ => {
                    ctx.offer_answer.process_reject(self.id);
                    self.negotiation.abandon();
                }
            }
        }

        if server.initial {
            self.transition(ctx, CallEvent::Acknowledged, None);
            if self.zombie {
                self.hangup(ctx);
                return;
            }
        }
        self.arm_session(ctx);
        self.dequeue(ctx);
    }

    /// CANCEL matched our pending INVITE server transaction
    pub fn on_cancel(&mut self, ctx: &mut EngineContext, invite: &TransactionKey) {
        let Some(server) = self.server.as_ref().filter(|s| &s.key == invite && s.final_response.is_none()) else {
            return;
        };
        let response = ResponseBuilder::new(487)
            .to_tag(&self.local_tag)
            .build_for_request(&server.request);
        let initial = server.initial;
        if let Err(e) = ctx.respond(invite, response) {
            warn!("Failed to send 487: {}", e);
        }
        self.server = None;
        self.timers.stop(ctx, HandleTimer::ProvisionalRetransmit);
        self.timers.stop(ctx, HandleTimer::PrackTimeout);
        self.negotiation.abandon();
        if initial {
            info!("Call {} cancelled by peer", self.id);
            self.transition(ctx, CallEvent::Ended, Some(Status::remote(487, "Request Terminated")));
        }
    }

    // ----- answering our INVITE server transaction -----

    fn ensure_uas_dialog(&mut self, ctx: &mut EngineContext) -> Result<DialogId> {
        if let Some(dialog) = &self.dialog {
            return Ok(dialog.clone());
        }
        let request = self
            .server
            .as_ref()
            .map(|s| s.request.clone())
            .ok_or_else(|| EngineError::InvalidState("No INVITE to answer".to_string()))?;
        let dialog = ctx
            .dialogs
            .create_uas(&request, &self.local_tag, ctx.local.contact(None), self.id)
            .ok_or_else(|| EngineError::InvalidOperation("INVITE cannot create a dialog".to_string()))?;
        self.branches.push(Branch {
            dialog: dialog.clone(),
            rseq: None,
            ack: None,
        });
        self.dialog = Some(dialog.clone());
        Ok(dialog)
    }

    fn use_reliable(&self, options: &ResponseOptions) -> bool {
        if options.status == 100 || self.params.reliable_provisional == ReliableProvisional::Disabled {
            return false;
        }
        let default = self.peer.requires_100rel
            || (self.peer.supports_100rel && self.params.reliable_provisional == ReliableProvisional::Required);
        options.reliable.unwrap_or(default) && self.peer.supports_100rel
    }

    fn send_provisional(&mut self, ctx: &mut EngineContext, options: &ResponseOptions) -> Result<()> {
        let reliable = self.use_reliable(options);
        if reliable && self.server.as_ref().map(|s| s.reliable.is_some()).unwrap_or(false) {
            return Err(EngineError::InvalidState(
                "Previous reliable provisional response not acknowledged".to_string(),
            ));
        }
        self.ensure_uas_dialog(ctx)?;
        let Some(server) = self.server.as_ref() else {
            return Err(EngineError::InvalidState("No INVITE to answer".to_string()));
        };
        let key = server.key.clone();
        let rseq = server.next_rseq;

        let mut body = options.body.clone();
        let mut carrier = None;
        if reliable && body.is_none() {
            if self.negotiation.owes_answer() {
                body = ctx.offer_answer.generate_answer(self.id);
                carrier = Some(None);
            } else if !self.negotiation.established && self.negotiation.can_offer() {
                body = ctx.offer_answer.generate_offer(self.id);
                carrier = Some(Some(Carrier::ReliableProvisional));
            }
        } else if reliable && self.negotiation.owes_answer() {
            carrier = Some(None);
        }

        let mut builder = options
            .builder(&self.local_tag)
            .header("Contact", ctx.local.contact(None).to_string())
            .body(body.clone());
        if reliable {
            builder = builder.header("Require", "100rel").header("RSeq", rseq.to_string());
        }
        let response = builder.build_for_request(&server.request);
        ctx.respond(&key, response.clone())?;

        match carrier {
            Some(None) if body.is_some() => self.negotiation.complete(),
            Some(Some(carrier)) if body.is_some() => self.negotiation.local_offer(carrier),
            _ => {}
        }
        if reliable {
            let t1 = ctx.transactions.sip_timers().t1;
            if let Some(server) = self.server.as_mut() {
                server.next_rseq += 1;
                server.reliable = Some(PendingReliable {
                    response,
                    rseq,
                    interval: t1,
                });
            }
            self.timers
                .start(ctx, self.id, HandleTimer::ProvisionalRetransmit, t1);
            self.timers
                .start(ctx, self.id, HandleTimer::PrackTimeout, t1 * 64);
        }
        self.transition(ctx, CallEvent::EarlyResponse, None);
        Ok(())
    }

    fn send_success(&mut self, ctx: &mut EngineContext, options: &ResponseOptions) -> Result<()> {
        let dialog = self.ensure_uas_dialog(ctx)?;
        let Some(server) = self.server.as_ref() else {
            return Err(EngineError::InvalidState("No INVITE to answer".to_string()));
        };
        let key = server.key.clone();
        let request = server.request.clone();
        let initial = server.initial;

        let mut body = options.body.clone();
        let mut local_offer = false;
        if body.is_none() {
            if self.negotiation.owes_answer() {
                body = ctx.offer_answer.generate_answer(self.id);
            } else if request.body().is_none() && self.negotiation.can_offer() {
                // Late offer: ours goes in the 2xx, the answer in the ACK
                body = ctx.offer_answer.generate_offer(self.id);
                local_offer = body.is_some();
            }
        }

        let mut builder = options
            .builder(&self.local_tag)
            .header("Contact", ctx.local.contact(None).to_string())
            .header("Allow", ALLOWED_METHODS)
            .header("Supported", self.supported())
            .body(body);
        if let Some(se) = self.session_for_request(&request) {
            builder = builder.header("Session-Expires", se.to_string());
            if self.peer.supports_timer {
                builder = builder.header("Require", "timer");
            }
        }
        let response = builder.build_for_request(&request);
        ctx.respond(&key, response.clone())?;

        ctx.dialogs.confirm(&dialog);
        if local_offer {
            self.negotiation.local_offer(Carrier::Final);
        } else if self.negotiation.owes_answer() {
            self.negotiation.complete();
        }
        self.timers.stop(ctx, HandleTimer::ProvisionalRetransmit);
        self.timers.stop(ctx, HandleTimer::PrackTimeout);

        let t1 = ctx.transactions.sip_timers().t1;
        if let Some(server) = self.server.as_mut() {
            server.reliable = None;
            server.final_response = Some(response);
            server.interval = t1;
        }
        self.timers
            .start(ctx, self.id, HandleTimer::FinalRetransmit, t1);
        self.timers.start(ctx, self.id, HandleTimer::AckTimeout, t1 * 64);
        if initial {
            self.transition(ctx, CallEvent::Accepted, None);
        }
        Ok(())
    }

    fn send_failure(&mut self, ctx: &mut EngineContext, options: &ResponseOptions) -> Result<()> {
        let Some(server) = self.server.as_ref() else {
            return Err(EngineError::InvalidState("No INVITE to answer".to_string()));
        };
        let key = server.key.clone();
        let initial = server.initial;
        let response = options.builder(&self.local_tag).build_for_request(&server.request);
        ctx.respond(&key, response)?;

        self.server = None;
        self.timers.stop(ctx, HandleTimer::ProvisionalRetransmit);
        self.timers.stop(ctx, HandleTimer::PrackTimeout);
        if !self.negotiation.is_idle() {
            self.negotiation.abandon();
        }
        if initial {
            let status = Status::local(options.status, options.reason.clone().unwrap_or_default());
            self.transition(ctx, CallEvent::Ended, Some(status));
        }
        Ok(())
    }

    // ----- sending INVITE -----

    fn send_invite(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let Some(invite) = self.invite.clone() else {
            return Err(EngineError::Internal("No INVITE to send".to_string()));
        };
        let (mut request, destination) = if invite.initial {
            self.initial_invite(ctx)?
        } else {
            let dialog = self
                .dialog
                .clone()
                .ok_or_else(|| EngineError::InvalidState("Call has no dialog".to_string()))?;
            self.dialog_request(ctx, &dialog, SipMethod::Invite)?
        };

        let body = if invite.offer {
            invite.body.clone().or_else(|| ctx.offer_answer.generate_offer(self.id))
        } else {
            None
        };
        request.headers.push("Allow", ALLOWED_METHODS);
        request.headers.push("Supported", self.supported());
        let mut required = Vec::new();
        if self.params.reliable_provisional == ReliableProvisional::Required && invite.initial {
            required.push("100rel");
        }
        if self.params.preconditions && invite.initial {
            required.push("precondition");
        }
        if !required.is_empty() {
            request.headers.push("Require", required.join(", "));
        }
        self.add_session_headers(&mut request.headers);
        for (name, value) in &invite.headers {
            request.headers.push(name.clone(), value.clone());
        }
        request.set_body(body.clone());

        let key = ctx.send_request(request.clone(), destination, Some(self.id))?;
        if body.is_some() {
            self.negotiation.local_offer(Carrier::Invite);
        }
        if let Some(invite) = self.invite.as_mut() {
            invite.key = Some(key);
            invite.request = Some(request);
        }
        Ok(())
    }

    fn initial_invite(&mut self, ctx: &mut EngineContext) -> Result<(SipRequest, Destination)> {
        let destination = ctx.route_for(&self.options.target).ok_or_else(|| {
            EngineError::InvalidOperation(format!("Unroutable target {}", self.options.target))
        })?;
        self.cseq += 1;
        let from = self.local_uri.clone().with_tag(&self.local_tag);
        let to = NameAddr::new(self.options.to.clone().unwrap_or_else(|| self.options.target.clone()));
        let mut builder = RequestBuilder::new(SipMethod::Invite, self.options.target.clone())
            .via(&ctx.via())
            .max_forwards(70)
            .route_set(&ctx.outbound_route())
            .from(&from)
            .to(&to)
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .contact(&ctx.local.contact(None));
        if let Some(referred_by) = &self.options.referred_by {
            builder = builder.header("Referred-By", referred_by.clone());
        }
        Ok((builder.build(), destination))
    }

    fn start_reinvite(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, options: SessionOptions) -> Result<()> {
        self.invite = Some(ClientInvite {
            key: None,
            request: None,
            operation,
            initial: false,
            body: options.body,
            offer: options.offer,
            headers: options.headers,
            retries: 0,
            glare_retries: 0,
            session_retried: false,
            challenge: None,
        });
        if let Err(e) = self.send_invite(ctx) {
            self.invite = None;
            return Err(e);
        }
        Ok(())
    }

    /// Next queued re-INVITE, once nothing else is in flight
    fn dequeue(&mut self, ctx: &mut EngineContext) {
        if self.state() != CallState::Ready
            || self.invite.is_some()
            || self.server.is_some()
            || !self.negotiation.is_idle()
        {
            return;
        }
        if let Some((operation, options)) = self.queued.pop_front() {
            if let Err(e) = self.start_reinvite(ctx, Some(operation), options) {
                warn!("Queued re-INVITE on {} failed: {}", self.id, e);
                ctx.events.result(
                    self.id,
                    operation,
                    OperationKind::Reinvite,
                    Status::local(500, e.to_string()),
                    true,
                );
            }
        }
    }

    // ----- transaction results -----

    pub fn on_transaction_event(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        if event.request.method == SipMethod::Cancel || matches!(event.kind, TransactionEventKind::CancelReleased) {
            self.on_cancel_result(ctx, event);
            return;
        }
        let current = self
            .invite
            .as_ref()
            .and_then(|i| i.key.as_ref())
            .map(|k| k == &event.key)
            .unwrap_or(false);
        if current {
            self.on_invite_event(ctx, event);
            return;
        }
        if event.request.method == SipMethod::Invite {
            if let TransactionEventKind::Response(response) = event.kind {
                if response.is_success() {
                    self.on_late_success(ctx, &event.request, response);
                }
            }
            return;
        }
        if let Some(outstanding) = self.requests.get(&event.key).cloned() {
            let (status, response) = match event.kind {
                TransactionEventKind::Response(r) if r.is_provisional() => return,
                TransactionEventKind::Response(r) => (Status::remote(r.status, r.reason.clone()), Some(r)),
                TransactionEventKind::Failed(status) => (status, None),
                TransactionEventKind::CancelReleased | TransactionEventKind::Terminated => return,
            };
            self.requests.remove(&event.key);
            self.on_request_result(ctx, outstanding, status, response);
        }
    }

    fn on_cancel_result(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        let status = match event.kind {
            TransactionEventKind::Response(r) if !r.is_provisional() => Status::remote(r.status, r.reason.clone()),
            TransactionEventKind::Failed(status) => status,
            TransactionEventKind::CancelReleased => Status::local(481, "Call/Transaction Does Not Exist"),
            _ => return,
        };
        if let Some(operation) = self.cancel_op.take() {
            ctx.events
                .result(self.id, operation, OperationKind::Cancel, status, true);
        }
    }

    fn on_invite_event(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        match event.kind {
            TransactionEventKind::Response(response) if response.is_provisional() => {
                self.on_provisional(ctx, &event.request, response)
            }
            TransactionEventKind::Response(response) if response.is_success() => {
                self.on_success(ctx, &event.request, response)
            }
            TransactionEventKind::Response(response) => {
                let status = Status::remote(response.status, response.reason.clone());
                self.on_invite_failure(ctx, &event.request, status, Some(response))
            }
            TransactionEventKind::Failed(status) => self.on_invite_failure(ctx, &event.request, status, None),
            TransactionEventKind::CancelReleased | TransactionEventKind::Terminated => {}
        }
    }

    fn invite_kind(&self) -> OperationKind {
        match self.invite.as_ref().map(|i| i.initial) {
            Some(false) => OperationKind::Reinvite,
            _ => OperationKind::StartCall,
        }
    }

    fn on_provisional(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: SipResponse) {
        let status = Status::remote(response.status, response.reason.clone());
        let initial = self.invite.as_ref().map(|i| i.initial).unwrap_or(false);
        let remote_tag = response.to_tag();

        if initial && remote_tag.is_some() && response.status > 100 {
            if let Some(dialog) = self.establish_uac_dialog(ctx, request, &response) {
                if self.dialog.is_none() {
                    self.dialog = Some(dialog.clone());
                }
                if is_reliable(&response) && !self.on_reliable_provisional(ctx, request, &response, &dialog) {
                    return;
                }
            }
        }

        if initial && response.status > 100 && self.state() == CallState::Calling {
            self.transition(ctx, CallEvent::Progress, Some(status.clone()));
        }
        let kind = self.invite_kind();
        if let Some(operation) = self.invite.as_ref().and_then(|i| i.operation) {
            ctx.events.result(self.id, operation, kind, status.clone(), false);
        }
        if initial {
            ctx.events.indicate(
                self.id,
                Indication::CallProgress {
                    status,
                    remote_tag,
                    body: response.body(),
                },
            );
        }
    }

    /// Returns false for a duplicate or out-of-order reliable provisional
    fn on_reliable_provisional(
        &mut self,
        ctx: &mut EngineContext,
        request: &SipRequest,
        response: &SipResponse,
        dialog: &DialogId,
    ) -> bool {
        let Some(rseq) = response.headers.get("RSeq").and_then(|v| v.trim().parse::<u32>().ok()) else {
            return true;
        };
        let Some(branch) = self.branches.iter_mut().find(|b| &b.dialog == dialog) else {
            return true;
        };
        match branch.rseq {
            Some(last) if rseq <= last => {
                debug!("Duplicate reliable provisional RSeq {} on {}", rseq, self.id);
                return false;
            }
            Some(last) if rseq != last + 1 => {
                warn!("Out of order RSeq {} (last {}) on {}", rseq, last, self.id);
                return false;
            }
            _ => branch.rseq = Some(rseq),
        }

        let mut answer = None;
        if let Some(body) = response.body() {
            if self.negotiation.awaiting_answer_to(Carrier::Invite) {
                if ctx.offer_answer.process_answer(self.id, &body) {
                    self.negotiation.complete();
                    self.precondition_update = self.params.preconditions && self.peer_requires_precondition(response);
                } else {
                    warn!("Answer in reliable provisional rejected on {}", self.id);
                    self.negotiation.abandon();
                }
            } else if self.negotiation.can_offer() && !self.negotiation.established {
                self.negotiation.remote_offer(Carrier::ReliableProvisional);
                if ctx.offer_answer.set_remote_offer(self.id, &body) {
                    answer = ctx.offer_answer.generate_answer(self.id);
                    self.negotiation.complete();
                } else {
                    self.negotiation.abandon();
                }
            }
        }

        let invite_cseq = request.cseq().map(|c| c.seq).unwrap_or(self.cseq);
        match self.dialog_request(ctx, dialog, SipMethod::Prack) {
            Ok((mut prack, destination)) => {
                prack
                    .headers
                    .push("RAck", format!("{} {} INVITE", rseq, invite_cseq));
                prack.set_body(answer);
                match ctx.send_request(prack.clone(), destination, Some(self.id)) {
                    Ok(key) => {
                        self.requests.insert(
                            key,
                            Outstanding {
                                kind: RequestKind::Prack,
                                operation: None,
                                request: prack,
                                dialog: dialog.clone(),
                            },
                        );
                    }
                    Err(e) => warn!("Failed to send PRACK: {}", e),
                }
            }
            Err(e) => warn!("Cannot build PRACK: {}", e),
        }
        true
    }

    fn peer_requires_precondition(&mut self, response: &SipResponse) -> bool {
        self.peer.learn(&response.headers);
        self.peer.requires_precondition
    }

    fn establish_uac_dialog(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: &SipResponse) -> Option<DialogId> {
        let dialog = ctx.dialogs.create_uac(request, response, self.id)?;
        ctx.dialogs.apply_route_set(&dialog, response);
        ctx.dialogs
            .refresh_target(&dialog, response.headers.get("Contact"));
        if response.is_success() {
            ctx.dialogs.confirm(&dialog);
        }
        if !self.branches.iter().any(|b| b.dialog == dialog) {
            self.branches.push(Branch {
                dialog: dialog.clone(),
                rseq: None,
                ack: None,
            });
        }
        Some(dialog)
    }

    fn on_success(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: SipResponse) {
        let prack_pending = self.requests.values().any(|o| o.kind == RequestKind::Prack);
        if prack_pending && self.held.is_none() {
            debug!("Holding 2xx on {} until PRACK completes", self.id);
            if self.state() == CallState::Calling || self.state() == CallState::Proceeding {
                self.transition(ctx, CallEvent::Answered, None);
            }
            self.held = Some((request.clone(), response));
            return;
        }
        self.accept_success(ctx, request, response);
    }

    fn accept_success(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: SipResponse) {
        let status = Status::remote(response.status, response.reason.clone());
        self.peer.learn(&response.headers);
        let Some(dialog) = self.establish_uac_dialog(ctx, request, &response) else {
            warn!("2xx without To tag on {}", self.id);
            return;
        };
        let Some(invite) = self.invite.take() else {
            return;
        };
        let kind = if invite.initial {
            OperationKind::StartCall
        } else {
            OperationKind::Reinvite
        };
        if invite.initial {
            self.dialog = Some(dialog.clone());
            // Early branches that never answered are gone
            let stale: Vec<DialogId> = self
                .branches
                .iter()
                .filter(|b| b.dialog != dialog && !ctx.dialogs.get(&b.dialog).map(|d| d.is_confirmed()).unwrap_or(false))
                .map(|b| b.dialog.clone())
                .collect();
            for id in stale {
                ctx.dialogs.remove(&id);
                self.branches.retain(|b| b.dialog != id);
            }
        }

        let mut ack_body = None;
        match response.body() {
            Some(body) if self.negotiation.awaiting_answer_to(Carrier::Invite) => {
                if ctx.offer_answer.process_answer(self.id, &body) {
                    self.negotiation.complete();
                } else {
                    warn!("Answer in 2xx rejected on {}", self.id);
                    self.negotiation.abandon();
                }
            }
            Some(body) if self.negotiation.can_offer() && !invite.offer => {
                self.negotiation.remote_offer(Carrier::Final);
                if ctx.offer_answer.set_remote_offer(self.id, &body) {
                    ack_body = ctx.offer_answer.generate_answer(self.id);
                    self.negotiation.complete();
                } else {
                    self.negotiation.abandon();
                }
            }
            _ => {
                if self.negotiation.awaiting_answer_to(Carrier::Invite) {
                    // Answered earlier in a reliable provisional, or not at all
                    self.negotiation.abandon();
                }
            }
        }

        let cseq = request.cseq().map(|c| c.seq).unwrap_or(self.cseq);
        self.send_ack(ctx, &dialog, cseq, ack_body);
        self.session_from_response(&response);

        if let Some(operation) = invite.operation {
            ctx.events.result(self.id, operation, kind, status.clone(), true);
        }
        if invite.initial {
            self.answered = Some(status.clone());
            if self.state() != CallState::Completing {
                self.transition(ctx, CallEvent::Answered, None);
            }
            self.transition(ctx, CallEvent::Acknowledged, Some(status.clone()));
            self.relay_refer(ctx, status, false);
        }

        if self.zombie {
            self.hangup(ctx);
            return;
        }
        if let Some(operation) = self.bye_after_ack.take() {
            if let Err(e) = self.send_bye(ctx, operation, dialog) {
                warn!("Deferred BYE on {} failed: {}", self.id, e);
            }
            return;
        }
        self.arm_session(ctx);
        if self.precondition_update && self.negotiation.can_offer() {
            self.precondition_update = false;
            if let Err(e) = self.update(ctx, None, SessionOptions::default()) {
                debug!("Precondition UPDATE skipped: {}", e);
            }
        }
        self.dequeue(ctx);
    }

    /// 2xx for an INVITE we already resolved: retransmission or another fork
    fn on_late_success(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: SipResponse) {
        let Some(tag) = response.to_tag() else {
            return;
        };
        if let Some(branch) = self.branches.iter().find(|b| b.dialog.remote_tag == tag) {
            if let Some((ack, destination)) = branch.ack.clone() {
                debug!("Re-sending ACK for retransmitted 2xx on {}", self.id);
                ctx.send_stateless(ack.into(), destination);
                return;
            }
        }
        if self.held.as_ref().map(|(_, r)| r.to_tag() == Some(tag.clone())).unwrap_or(false) {
            return;
        }

        let Some(dialog) = self.establish_uac_dialog(ctx, request, &response) else {
            return;
        };
        let cseq = request.cseq().map(|c| c.seq).unwrap_or(self.cseq);
        self.send_ack(ctx, &dialog, cseq, None);
        info!("Forked 2xx from {} on {}", tag, self.id);
        if self.zombie || !matches!(self.state(), CallState::Ready | CallState::Completing) {
            if let Err(e) = self.send_bye(ctx, None, dialog) {
                warn!("Failed to release fork {}: {}", tag, e);
            }
            return;
        }
        ctx.events
            .indicate(self.id, Indication::ForkedDialog { remote_tag: tag });
    }

    fn send_ack(&mut self, ctx: &mut EngineContext, dialog: &DialogId, cseq: u32, body: Option<Body>) {
        let via = ctx.via();
        let Some(record) = ctx.dialogs.get(dialog) else {
            return;
        };
        let mut ack = record.request(SipMethod::Ack, &via, cseq);
        ack.set_body(body);
        let Some(destination) = record.next_hop(ctx.local.protocol) else {
            warn!("No route for ACK on {}", dialog);
            return;
        };
        ctx.send_stateless(ack.clone().into(), destination.clone());
        if let Some(branch) = self.branches.iter_mut().find(|b| &b.dialog == dialog) {
            branch.ack = Some((ack, destination));
        }
    }

    fn on_invite_failure(&mut self, ctx: &mut EngineContext, request: &SipRequest, status: Status, response: Option<SipResponse>) {
        let code = status.code;
        let Some(invite) = self.invite.clone() else {
            return;
        };
        let kind = self.invite_kind();

        if let Some(response) = &response {
            if code == 401 || code == 407 {
                self.answer_invite_challenge(ctx, request, response, status);
                return;
            }
            if code == 422 && !invite.session_retried {
                if let Some(min_se) = response.headers.get("Min-SE").and_then(parse_delta_seconds) {
                    info!("Session interval too small on {}, retrying with {}", self.id, min_se);
                    self.params.min_se = self.params.min_se.max(min_se);
                    self.params.session_expires = self.params.session_expires.max(min_se);
                    self.reject_local_offer(ctx);
                    if let Some(invite) = self.invite.as_mut() {
                        invite.session_retried = true;
                    }
                    if self.send_invite(ctx).is_ok() {
                        return;
                    }
                }
            }
        }

        let retry_after = response
            .as_ref()
            .and_then(|r| r.headers.get("Retry-After"))
            .and_then(parse_delta_seconds);
        let retryable = (500..600).contains(&code) && retry_after.is_some();
        if let Some(delay) = retry_after.filter(|_| retryable) {
            if invite.retries < self.params.max_invite_retries {
                info!(
                    "{} with Retry-After {} on {}, retry {}/{}",
                    code,
                    delay,
                    self.id,
                    invite.retries + 1,
                    self.params.max_invite_retries
                );
                self.schedule_invite_retry(ctx, status, Duration::from_secs(delay as u64), kind, |i| i.retries += 1);
                return;
            }
        }
        if code == 491 && !invite.initial && invite.glare_retries < self.params.max_glare_retries {
            let delay = self.glare_backoff();
            info!("re-INVITE glare on {}, retrying in {:?}", self.id, delay);
            self.schedule_invite_retry(ctx, status, delay, kind, |i| i.glare_retries += 1);
            return;
        }

        // Final failure
        self.reject_local_offer(ctx);
        self.invite = None;
        if let Some(operation) = invite.operation {
            ctx.events.result(self.id, operation, kind, status.clone(), true);
        }
        if invite.initial {
            info!("Call {} failed: {}", self.id, status);
            self.relay_refer(ctx, status.clone(), true);
            self.transition(ctx, CallEvent::Ended, Some(status));
        } else if retryable || code == 408 || code == 481 || status.is_local() {
            info!("re-INVITE on {} failed with {}, ending call", self.id, status);
            self.hangup(ctx);
        } else {
            self.dequeue(ctx);
        }
    }

    fn schedule_invite_retry(
        &mut self,
        ctx: &mut EngineContext,
        status: Status,
        delay: Duration,
        kind: OperationKind,
        bump: impl FnOnce(&mut ClientInvite),
    ) {
        self.reject_local_offer(ctx);
        if let Some(invite) = self.invite.as_mut() {
            bump(invite);
            invite.key = None;
            if let Some(operation) = invite.operation {
                ctx.events.result(self.id, operation, kind, status, false);
            }
        }
        self.timers.start(ctx, self.id, HandleTimer::RetryInvite, delay);
    }

    /// RFC 3261 14.1: 2.1-4s when we own the Call-ID, 0-2s otherwise
    fn glare_backoff(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let millis = match self.direction {
            CallDirection::Outbound => rng.gen_range(2100..=4000),
            CallDirection::Inbound => rng.gen_range(0..=2000),
        };
        Duration::from_millis(millis)
    }

    fn answer_invite_challenge(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: &SipResponse, status: Status) {
        let Some(invite) = self.invite.clone() else {
            return;
        };
        let kind = self.invite_kind();
        let target = if invite.initial {
            self.cseq += 1;
            ctx.route_for(&self.options.target).map(|d| (self.cseq, d))
        } else {
            self.dialog.clone().and_then(|dialog| {
                let cseq = ctx.dialogs.next_cseq(&dialog)?;
                let destination = ctx.dialogs.get(&dialog)?.next_hop(ctx.local.protocol)?;
                Some((cseq, destination))
            })
        };
        let outcome = match target {
            Some((cseq, destination)) => {
                ctx.answer_challenge(&mut self.auth, request, response, cseq, destination, self.id)
            }
            None => ChallengeOutcome::Failed,
        };
        match outcome {
            ChallengeOutcome::Resent { key, request } => {
                if let Some(invite) = self.invite.as_mut() {
                    invite.key = Some(key);
                    invite.request = Some(request);
                    if let Some(operation) = invite.operation {
                        ctx.events.result(self.id, operation, kind, status, false);
                    }
                }
            }
            ChallengeOutcome::NeedCredentials { realm } => {
                if let Some(invite) = self.invite.as_mut() {
                    invite.key = None;
                    invite.request = Some(request.clone());
                    invite.challenge = Some(response.clone());
                    if let Some(operation) = invite.operation {
                        ctx.events.result(self.id, operation, kind, status, false);
                    }
                }
                ctx.events
                    .indicate(self.id, Indication::AuthenticationRequired { realm });
            }
            ChallengeOutcome::Failed => {
                self.reject_local_offer(ctx);
                self.invite = None;
                if let Some(operation) = invite.operation {
                    ctx.events.result(self.id, operation, kind, status.clone(), true);
                }
                if invite.initial {
                    self.relay_refer(ctx, status.clone(), true);
                    self.transition(ctx, CallEvent::Ended, Some(status));
                } else {
                    self.dequeue(ctx);
                }
            }
        }
    }

    fn on_request_result(&mut self, ctx: &mut EngineContext, outstanding: Outstanding, status: Status, response: Option<SipResponse>) {
        if let Some(response) = &response {
            if (response.status == 401 || response.status == 407) && self.retry_with_credentials(ctx, &outstanding, response) {
                return;
            }
        }
        match outstanding.kind {
            RequestKind::Prack => {
                if !status.is_success() {
                    warn!("PRACK on {} failed: {}", self.id, status);
                }
                let still_pending = self.requests.values().any(|o| o.kind == RequestKind::Prack);
                if !still_pending {
                    if let Some((request, response)) = self.held.take() {
                        self.accept_success(ctx, &request, response);
                    } else if self.precondition_update && self.negotiation.can_offer() && self.dialog.is_some() {
                        self.precondition_update = false;
                        if let Err(e) = self.update(ctx, None, SessionOptions::default()) {
                            debug!("Precondition UPDATE skipped: {}", e);
                        }
                    }
                }
            }
            RequestKind::Update => {
                if status.is_success() {
                    if self.negotiation.awaiting_answer_to(Carrier::Update) {
                        match response.as_ref().and_then(|r| r.body()) {
                            Some(body) if ctx.offer_answer.process_answer(self.id, &body) => self.negotiation.complete(),
                            _ => {
                                ctx.offer_answer.process_reject(self.id);
                                self.negotiation.abandon();
                            }
                        }
                    }
                    if let Some(response) = &response {
                        self.session_from_response(response);
                    }
                    if self.state() == CallState::Ready {
                        self.arm_session(ctx);
                    }
                } else {
                    self.reject_local_offer(ctx);
                }
                if let Some(operation) = outstanding.operation {
                    ctx.events
                        .result(self.id, operation, OperationKind::Update, status.clone(), true);
                }
                if status.code == 408 || status.code == 481 {
                    self.hangup(ctx);
                } else {
                    self.dequeue(ctx);
                }
            }
            RequestKind::Bye => {
                if let Some(operation) = outstanding.operation {
                    ctx.events
                        .result(self.id, operation, OperationKind::Bye, status.clone(), true);
                }
                if self.dialog.as_ref() == Some(&outstanding.dialog) {
                    info!("Call {} terminated: BYE answered {}", self.id, status);
                    self.transition(ctx, CallEvent::Ended, Some(status));
                } else {
                    self.branches.retain(|b| b.dialog != outstanding.dialog);
                    ctx.dialogs.remove(&outstanding.dialog);
                }
            }
        }
    }

    fn retry_with_credentials(&mut self, ctx: &mut EngineContext, outstanding: &Outstanding, response: &SipResponse) -> bool {
        let Some(cseq) = ctx.dialogs.next_cseq(&outstanding.dialog) else {
            return false;
        };
        let Some(destination) = ctx
            .dialogs
            .get(&outstanding.dialog)
            .and_then(|d| d.next_hop(ctx.local.protocol))
        else {
            return false;
        };
        match ctx.answer_challenge(&mut self.auth, &outstanding.request, response, cseq, destination, self.id) {
            ChallengeOutcome::Resent { key, request } => {
                let mut retried = outstanding.clone();
                retried.request = request;
                self.requests.insert(key, retried);
                true
            }
            ChallengeOutcome::NeedCredentials { realm } => {
                ctx.events
                    .indicate(self.id, Indication::AuthenticationRequired { realm });
                false
            }
            ChallengeOutcome::Failed => false,
        }
    }

    // ----- teardown -----

    fn send_bye(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, dialog: DialogId) -> Result<()> {
        let (request, destination) = self.dialog_request(ctx, &dialog, SipMethod::Bye)?;
        let key = ctx.send_request(request.clone(), destination, Some(self.id))?;
        let active = self.dialog.as_ref() == Some(&dialog);
        self.requests.insert(
            key,
            Outstanding {
                kind: RequestKind::Bye,
                operation,
                request,
                dialog,
            },
        );
        if active {
            self.timers.stop(ctx, HandleTimer::SessionRefresh);
            self.timers.stop(ctx, HandleTimer::SessionExpiry);
            self.timers.stop(ctx, HandleTimer::FinalRetransmit);
            self.timers.stop(ctx, HandleTimer::AckTimeout);
            self.server = None;
            self.transition(ctx, CallEvent::Bye, None);
        }
        Ok(())
    }

    /// BYE on the active dialog without an application operation
    fn hangup(&mut self, ctx: &mut EngineContext) {
        let Some(dialog) = self.dialog.clone() else {
            self.transition(ctx, CallEvent::Ended, None);
            return;
        };
        if self.state() == CallState::Terminating {
            return;
        }
        if let Err(e) = self.send_bye(ctx, None, dialog) {
            warn!("Failed to send BYE on {}: {}", self.id, e);
            self.transition(ctx, CallEvent::Ended, Some(Status::transport_failure()));
        }
    }

    fn transition(&mut self, ctx: &mut EngineContext, event: CallEvent, status: Option<Status>) {
        let before = self.machine.state();
        match self.machine.process_event(event, ctx.now) {
            Ok(state) if state != before => {
                info!("Call {} {} -> {}", self.id, before.name(), state.name());
                ctx.events
                    .indicate(self.id, Indication::CallStateChanged { state, status });
                if state == CallState::Terminated {
                    self.on_terminated(ctx, before);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Call {}: {}", self.id, e),
        }
    }

    fn on_terminated(&mut self, ctx: &mut EngineContext, before: CallState) {
        self.timers.stop_all(ctx);
        self.server = None;
        self.held = None;
        if !self.negotiation.is_idle() {
            self.negotiation.abandon();
        }
        for (operation, _) in self.queued.drain(..) {
            ctx.events.result(
                self.id,
                operation,
                OperationKind::Reinvite,
                Status::local_cancelled(),
                true,
            );
        }
        if matches!(before, CallState::Ready | CallState::Terminating | CallState::Completing) {
            let status = self.answered.clone().unwrap_or_else(|| Status::remote(200, "OK"));
            self.relay_refer(ctx, status, true);
        }
        ctx.defer(Deferred::CheckReclaim(self.id));
    }

    fn relay_refer(&mut self, ctx: &mut EngineContext, status: Status, terminated: bool) {
        let Some(subscription) = self.options.refer_subscription else {
            return;
        };
        if terminated {
            self.options.refer_subscription = None;
        }
        ctx.defer(Deferred::ReferProgress {
            subscription,
            status,
            terminated,
        });
    }

    fn reject_local_offer(&mut self, ctx: &mut EngineContext) {
        if self.negotiation.awaiting_answer() {
            ctx.offer_answer.process_reject(self.id);
            self.negotiation.abandon();
        }
    }

    // ----- session timers (RFC 4028) -----

    fn add_session_headers(&self, headers: &mut Headers) {
        if self.params.session_expires == 0 {
            return;
        }
        let interval = self.session.interval.unwrap_or(self.params.session_expires);
        let refresher = match self.session.interval {
            Some(_) if self.session.local_refresher => Some(Refresher::Uac),
            Some(_) => Some(Refresher::Uas),
            None => match self.params.refresher {
                RefresherPreference::Local => Some(Refresher::Uac),
                RefresherPreference::Remote => Some(Refresher::Uas),
                RefresherPreference::Any => None,
            },
        };
        headers.push("Session-Expires", SessionExpires { interval, refresher }.to_string());
        headers.push("Min-SE", self.params.min_se.to_string());
    }

    /// Session timer from the 2xx to our INVITE or UPDATE
    fn session_from_response(&mut self, response: &SipResponse) {
        if self.params.session_expires == 0 {
            return;
        }
        self.session = match response.headers.get("Session-Expires").and_then(SessionExpires::parse) {
            Some(se) if se.interval > 0 => Session {
                // Never run the timer faster than our own Min-SE
                interval: Some(se.interval.max(self.params.min_se)),
                local_refresher: se.refresher != Some(Refresher::Uas),
            },
            _ => Session::default(),
        };
    }

    /// Session timer for the 2xx we send; returns the header to include
    fn session_for_request(&mut self, request: &SipRequest) -> Option<SessionExpires> {
        if self.params.session_expires == 0 {
            return None;
        }
        let requested = request
            .headers
            .get("Session-Expires")
            .and_then(SessionExpires::parse)?;
        let local_refresher = match requested.refresher {
            Some(Refresher::Uac) => false,
            Some(Refresher::Uas) => true,
            None => match self.params.refresher {
                RefresherPreference::Local => true,
                RefresherPreference::Remote => !self.peer.supports_timer,
                RefresherPreference::Any => !self.peer.supports_timer,
            },
        };
        self.session = Session {
            interval: Some(requested.interval),
            local_refresher,
        };
        Some(SessionExpires {
            interval: requested.interval,
            refresher: Some(if local_refresher { Refresher::Uas } else { Refresher::Uac }),
        })
    }

    fn arm_session(&mut self, ctx: &mut EngineContext) {
        self.timers.stop(ctx, HandleTimer::SessionRefresh);
        self.timers.stop(ctx, HandleTimer::SessionExpiry);
        let Some(interval) = self.session.interval.filter(|i| *i > 0) else {
            return;
        };
        if self.session.local_refresher {
            let delay = Duration::from_secs(u64::from(interval / 2));
            debug!("Call {} refreshes session in {:?}", self.id, delay);
            self.timers
                .start(ctx, self.id, HandleTimer::SessionRefresh, delay);
        }
        // Both sides: a session nobody refreshed ends the call
        let expiry = Duration::from_secs(u64::from(interval - (interval / 3).min(32)));
        debug!("Call {} expects a session refresh within {:?}", self.id, expiry);
        self.timers
            .start(ctx, self.id, HandleTimer::SessionExpiry, expiry);
    }

    fn dialog_confirmed(&self, ctx: &EngineContext) -> bool {
        self.dialog
            .as_ref()
            .and_then(|d| ctx.dialogs.get(d))
            .map(|d| d.is_confirmed())
            .unwrap_or(false)
    }

    // ----- timers -----

    pub fn on_timer(&mut self, ctx: &mut EngineContext, timer: HandleTimer, token: TimerToken) {
        if !self.timers.fired(timer, token) {
            return;
        }
        match timer {
            HandleTimer::RetryInvite => {
                if self.server.is_some() || !self.negotiation.is_idle() {
                    // The peer's INVITE exchange goes first
                    let retry = ctx.transactions.sip_timers().t2;
                    debug!("INVITE retry on {} waits for the pending exchange", self.id);
                    self.timers
                        .start(ctx, self.id, HandleTimer::RetryInvite, retry);
                    return;
                }
                if let Err(e) = self.send_invite(ctx) {
                    warn!("INVITE retry on {} failed: {}", self.id, e);
                    let status = Status::local(500, e.to_string());
                    self.on_invite_failure_local(ctx, status);
                }
            }
            HandleTimer::SessionRefresh => self.refresh_session(ctx),
            HandleTimer::SessionExpiry => {
                warn!("Session on {} expired without refresh", self.id);
                ctx.events.indicate(self.id, Indication::SessionExpired);
                self.hangup(ctx);
            }
            HandleTimer::ProvisionalRetransmit => {
                let Some((key, pending)) = self
                    .server
                    .as_ref()
                    .and_then(|s| Some((s.key.clone(), s.reliable.clone()?)))
                else {
                    return;
                };
                if let Err(e) = ctx.respond(&key, pending.response.clone()) {
                    debug!("Reliable provisional retransmission failed: {}", e);
                    return;
                }
                let interval = pending.interval * 2;
                if let Some(reliable) = self.server.as_mut().and_then(|s| s.reliable.as_mut()) {
                    reliable.interval = interval;
                }
                self.timers
                    .start(ctx, self.id, HandleTimer::ProvisionalRetransmit, interval);
            }
            HandleTimer::PrackTimeout => {
                warn!("No PRACK on {}, rejecting INVITE", self.id);
                let options = ResponseOptions::new(500).with_reason("Reliable Provisional Response Not Acknowledged");
                if let Err(e) = self.send_failure(ctx, &options) {
                    debug!("{}", e);
                }
            }
            HandleTimer::FinalRetransmit => {
                let Some((key, response, interval)) = self
                    .server
                    .as_ref()
                    .and_then(|s| Some((s.key.clone(), s.final_response.clone()?, s.interval)))
                else {
                    return;
                };
                if let Err(e) = ctx.respond(&key, response) {
                    debug!("2xx retransmission failed: {}", e);
                    return;
                }
                let next = (interval * 2).min(ctx.transactions.sip_timers().t2);
                if let Some(server) = self.server.as_mut() {
                    server.interval = next;
                }
                self.timers
                    .start(ctx, self.id, HandleTimer::FinalRetransmit, next);
            }
            HandleTimer::AckTimeout => {
                warn!("No ACK for 2xx on {}, ending call", self.id);
                self.timers.stop(ctx, HandleTimer::FinalRetransmit);
                let initial = self.server.take().map(|s| s.initial).unwrap_or(false);
                if initial {
                    self.transition(ctx, CallEvent::Acknowledged, None);
                }
                self.hangup(ctx);
            }
            _ => debug!("Call {} ignores {:?}", self.id, timer),
        }
    }

    fn on_invite_failure_local(&mut self, ctx: &mut EngineContext, status: Status) {
        let kind = self.invite_kind();
        let Some(invite) = self.invite.take() else {
            return;
        };
        if let Some(operation) = invite.operation {
            ctx.events.result(self.id, operation, kind, status.clone(), true);
        }
        if invite.initial {
            self.relay_refer(ctx, status.clone(), true);
            self.transition(ctx, CallEvent::Ended, Some(status));
        } else {
            self.hangup(ctx);
        }
    }

    fn refresh_session(&mut self, ctx: &mut EngineContext) {
        if self.state() != CallState::Ready {
            return;
        }
        if self.invite.is_some() || self.server.is_some() || !self.negotiation.is_idle() {
            // Another exchange is running; try again shortly
            let retry = ctx.transactions.sip_timers().t2;
            self.timers
                .start(ctx, self.id, HandleTimer::SessionRefresh, retry);
            return;
        }
        info!("Refreshing session on {}", self.id);
        let result = if self.peer.allows_update {
            self.update(ctx, None, SessionOptions::default().without_offer())
        } else {
            self.start_reinvite(ctx, None, SessionOptions::default())
        };
        if let Err(e) = result {
            warn!("Session refresh on {} failed: {}", self.id, e);
        }
    }

    // ----- helpers -----

    fn supported(&self) -> String {
        let mut tags = vec!["timer"];
        if self.params.reliable_provisional != ReliableProvisional::Disabled {
            tags.push("100rel");
        }
        if self.params.preconditions {
            tags.push("precondition");
        }
        tags.join(", ")
    }

    fn dialog_request(&self, ctx: &mut EngineContext, dialog: &DialogId, method: SipMethod) -> Result<(SipRequest, Destination)> {
        let via = ctx.via();
        let destination = ctx
            .dialogs
            .get(dialog)
            .and_then(|d| d.next_hop(ctx.local.protocol))
            .ok_or_else(|| EngineError::InvalidState(format!("No route for dialog {}", dialog)))?;
        let request = ctx
            .dialogs
            .build_request(dialog, method, &via)
            .ok_or_else(|| EngineError::InvalidState(format!("Dialog {} is gone", dialog)))?;
        Ok((request, destination))
    }
}

fn is_reliable(response: &SipResponse) -> bool {
    response.headers.contains("RSeq")
        && parse_token_list(&response.headers.values("Require"))
            .iter()
            .any(|t| t == "100rel")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_follow_config() {
        let config = CallConfig::default();
        let params = CallParameters::from(&config);
        assert_eq!(params.max_invite_retries, 2);
        assert_eq!(params.clone().with_max_invite_retries(3).max_invite_retries, 3);
        assert_eq!(params, CallParameters::from(&config));
    }

    #[test]
    fn test_peer_capabilities() {
        let mut headers = Headers::new();
        headers.push("Supported", "timer, 100rel");
        headers.push("Require", "precondition");
        headers.push("Allow", "INVITE, ACK, BYE, UPDATE");
        let mut peer = PeerCapabilities::default();
        peer.learn(&headers);
        assert!(peer.allows_update);
        assert!(peer.supports_timer);
        assert!(peer.supports_100rel);
        assert!(!peer.requires_100rel);
        assert!(peer.requires_precondition);
    }

    #[test]
    fn test_reliable_detection() {
        let mut response = SipResponse::new(183);
        response.headers.push("Require", "100rel");
        assert!(!is_reliable(&response));
        response.headers.push("RSeq", "7");
        assert!(is_reliable(&response));
    }

    #[test]
    fn test_response_options_builder() {
        let options = ResponseOptions::new(180)
            .with_reliable(true)
            .with_header("X-Test", "1");
        assert_eq!(options.reliable, Some(true));
        assert_eq!(options.headers.len(), 1);
        assert!(ByeOptions::default().with_remote_tag("b2").remote_tag.is_some());
        assert!(!SessionOptions::default().without_offer().offer);
    }
}
