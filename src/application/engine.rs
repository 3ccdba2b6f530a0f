//! Sans-IO user agent engine
//!
//! The [`Engine`] owns every call, registration and subscription handle
//! together with the shared transaction layer and dialog store. It never
//! performs I/O: the caller feeds it received messages, the current time
//! and transport failures, and drains outgoing messages and application
//! events after each step.

use crate::config::EngineConfig;
use crate::domain::shared::{EngineError, HandleId, HandleKind, OperationId, Result};
use crate::infrastructure::protocols::sip::auth::Credential;
use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
use crate::infrastructure::protocols::sip::call::{
    ByeOptions, Call, CallOptions, CallParameters, ResponseOptions, SessionOptions,
};
use crate::infrastructure::protocols::sip::context::{
    Deferred, EngineContext, EngineTimer, IncomingRequest, TransactionEvent, ALLOWED_METHODS,
};
use crate::infrastructure::protocols::sip::dialog::DialogId;
use crate::infrastructure::protocols::sip::events::{EngineEvent, Indication, PendingResponse};
use crate::infrastructure::protocols::sip::headers::{parse_event, NameAddr};
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod, SipRequest};
use crate::infrastructure::protocols::sip::offer_answer::OfferAnswer;
use crate::infrastructure::protocols::sip::registration::{
    Registration, RegistrationOptions, RegistrationParameters,
};
use crate::infrastructure::protocols::sip::subscription::{
    NotifyOptions, ReferOptions, Subscription, SubscriptionOptions,
};
use crate::infrastructure::protocols::sip::timer::TimerToken;
use crate::infrastructure::protocols::sip::transaction::TransactionKey;
use crate::infrastructure::protocols::sip::transport::{
    Destination, Outgoing, TransportEvent, TransportProtocol,
};
use crate::infrastructure::protocols::sip::context::HandleTimer;
use metrics::gauge;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One entry of the handle arena
enum Handle {
    Call(Call),
    Registration(Registration),
    Subscription(Subscription),
}

impl Handle {
    fn kind(&self) -> HandleKind {
        match self {
            Handle::Call(_) => HandleKind::Call,
            Handle::Registration(_) => HandleKind::Registration,
            Handle::Subscription(_) => HandleKind::Subscription,
        }
    }

    fn on_transaction_event(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        match self {
            Handle::Call(call) => call.on_transaction_event(ctx, event),
            Handle::Registration(reg) => reg.on_transaction_event(ctx, event),
            Handle::Subscription(sub) => sub.on_transaction_event(ctx, event),
        }
    }

    fn on_timer(&mut self, ctx: &mut EngineContext, timer: HandleTimer, token: TimerToken) {
        match self {
            Handle::Call(call) => call.on_timer(ctx, timer, token),
            Handle::Registration(reg) => reg.on_timer(ctx, timer, token),
            Handle::Subscription(sub) => sub.on_timer(ctx, timer, token),
        }
    }

    fn authenticate(&mut self, ctx: &mut EngineContext, operation: OperationId, credential: Credential) {
        match self {
            Handle::Call(call) => call.authenticate(ctx, operation, credential),
            Handle::Registration(reg) => reg.authenticate(ctx, operation, credential),
            Handle::Subscription(sub) => sub.authenticate(ctx, operation, credential),
        }
    }

    fn destroy(&mut self, ctx: &mut EngineContext) {
        match self {
            Handle::Call(call) => call.destroy(ctx),
            Handle::Registration(reg) => reg.destroy(ctx),
            Handle::Subscription(sub) => sub.destroy(ctx),
        }
    }

    fn is_reclaimable(&self, ctx: &EngineContext) -> bool {
        match self {
            Handle::Call(call) => call.is_reclaimable(ctx),
            Handle::Registration(reg) => reg.is_reclaimable(ctx),
            Handle::Subscription(sub) => sub.is_reclaimable(ctx),
        }
    }

    fn reclaim(&mut self, ctx: &mut EngineContext) {
        match self {
            Handle::Call(call) => call.reclaim(ctx),
            Handle::Registration(reg) => reg.reclaim(ctx),
            Handle::Subscription(sub) => sub.reclaim(ctx),
        }
    }
}

/// New values for a handle's tunables
#[derive(Debug, Clone, PartialEq)]
pub enum HandleParameters {
    Call(CallParameters),
    Registration(RegistrationParameters),
}

impl From<CallParameters> for HandleParameters {
    fn from(params: CallParameters) -> Self {
        HandleParameters::Call(params)
    }
}

impl From<RegistrationParameters> for HandleParameters {
    fn from(params: RegistrationParameters) -> Self {
        HandleParameters::Registration(params)
    }
}

/// SIP user agent engine
pub struct Engine {
    ctx: EngineContext,
    handles: HashMap<HandleId, Handle>,
    /// Destroyed by the application, waiting to be reclaimed
    destroyed: HashSet<HandleId>,
    /// Handles that may have finished their last obligation
    candidates: BTreeSet<HandleId>,
    next_handle: u64,
}

impl Engine {
    pub fn new(config: EngineConfig, offer_answer: Box<dyn OfferAnswer>, now: Instant) -> Result<Self> {
        config.validate()?;
        info!(
            "SIP engine on {}:{} ({})",
            config.local_host(),
            config.local.port,
            config.local.transport.as_str()
        );
        Ok(Self {
            ctx: EngineContext::new(config, offer_answer, now),
            handles: HashMap::new(),
            destroyed: HashSet::new(),
            candidates: BTreeSet::new(),
            next_handle: 1,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn now(&self) -> Instant {
        self.ctx.now
    }

    /// Number of handles in the arena, destroyed ones included until reclaimed
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn handle_kind(&self, id: HandleId) -> Option<HandleKind> {
        self.handles.get(&id).map(Handle::kind)
    }

    pub fn call(&self, id: HandleId) -> Option<&Call> {
        match self.handles.get(&id) {
            Some(Handle::Call(call)) => Some(call),
            _ => None,
        }
    }

    pub fn registration(&self, id: HandleId) -> Option<&Registration> {
        match self.handles.get(&id) {
            Some(Handle::Registration(reg)) => Some(reg),
            _ => None,
        }
    }

    pub fn subscription(&self, id: HandleId) -> Option<&Subscription> {
        match self.handles.get(&id) {
            Some(Handle::Subscription(sub)) => Some(sub),
            _ => None,
        }
    }

    fn allocate(&mut self) -> HandleId {
        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        id
    }

    fn insert(&mut self, id: HandleId, handle: Handle) {
        debug!("Handle {} created ({:?})", id, handle.kind());
        self.handles.insert(id, handle);
        self.candidates.insert(id);
        gauge!("sip_active_handles").set(self.handles.len() as f64);
    }

    // ----- calls -----

    /// New outgoing call; nothing is sent until [`Engine::start_call`]
    pub fn create_call(&mut self, options: CallOptions) -> HandleId {
        let id = self.allocate();
        let call = Call::outgoing(&mut self.ctx, id, options);
        self.insert(id, Handle::Call(call));
        id
    }

    pub fn start_call(&mut self, id: HandleId) -> Result<OperationId> {
        let call = call_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        call.start(&mut self.ctx, operation)?;
        self.pump();
        Ok(operation)
    }

    /// Answer an incoming INVITE, SUBSCRIBE or REFER
    pub fn respond(&mut self, token: PendingResponse, options: ResponseOptions) -> Result<OperationId> {
        let (id, key, _) = token.into_parts();
        let operation = self.ctx.next_operation();
        match live_mut(&mut self.handles, &self.destroyed, id)? {
            Handle::Call(call) => call.respond(&mut self.ctx, operation, &key, options)?,
            Handle::Subscription(sub) => sub.respond(&mut self.ctx, operation, &key, options)?,
            Handle::Registration(_) => {
                return Err(EngineError::InvalidOperation(format!(
                    "{} has nothing to answer",
                    id
                )))
            }
        }
        self.pump();
        Ok(operation)
    }

    pub fn cancel(&mut self, id: HandleId) -> Result<OperationId> {
        let call = call_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        call.cancel(&mut self.ctx, operation)?;
        self.pump();
        Ok(operation)
    }

    pub fn bye(&mut self, id: HandleId, options: ByeOptions) -> Result<OperationId> {
        let call = call_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        call.bye(&mut self.ctx, operation, options)?;
        self.pump();
        Ok(operation)
    }

    pub fn reinvite(&mut self, id: HandleId, options: SessionOptions) -> Result<OperationId> {
        let call = call_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        call.reinvite(&mut self.ctx, operation, options)?;
        self.pump();
        Ok(operation)
    }

    pub fn update(&mut self, id: HandleId, options: SessionOptions) -> Result<OperationId> {
        let call = call_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        call.update(&mut self.ctx, Some(operation), options)?;
        self.pump();
        Ok(operation)
    }

    /// Send REFER on an established call; returns the subscription that
    /// reports the transfer progress
    pub fn refer(&mut self, id: HandleId, options: ReferOptions) -> Result<(HandleId, OperationId)> {
        let call = call_mut(&mut self.handles, &self.destroyed, id)?;
        let dialog = call
            .dialog()
            .filter(|d| self.ctx.dialogs.get(d).map(|d| d.is_confirmed()).unwrap_or(false))
            .cloned()
            .ok_or_else(|| {
                EngineError::InvalidState(format!("Call {} has no confirmed dialog", id))
            })?;

        let sub_id = self.allocate();
        let operation = self.ctx.next_operation();
        let mut sub = Subscription::refer_subscriber(&mut self.ctx, sub_id, dialog);
        sub.refer(&mut self.ctx, operation, &options)?;
        self.insert(sub_id, Handle::Subscription(sub));
        self.pump();
        Ok((sub_id, operation))
    }

    // ----- registrations -----

    pub fn create_registration(&mut self, options: RegistrationOptions) -> HandleId {
        let id = self.allocate();
        let reg = Registration::new(&mut self.ctx, id, options);
        self.insert(id, Handle::Registration(reg));
        id
    }

    pub fn register(&mut self, id: HandleId) -> Result<OperationId> {
        let reg = registration_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        reg.register(&mut self.ctx, operation)?;
        self.pump();
        Ok(operation)
    }

    pub fn unregister(&mut self, id: HandleId) -> Result<OperationId> {
        let reg = registration_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        reg.unregister(&mut self.ctx, operation)?;
        self.pump();
        Ok(operation)
    }

    // ----- subscriptions -----

    pub fn create_subscription(&mut self, options: SubscriptionOptions) -> HandleId {
        let id = self.allocate();
        let sub = Subscription::outgoing(&mut self.ctx, id, options);
        self.insert(id, Handle::Subscription(sub));
        id
    }

    pub fn subscribe(&mut self, id: HandleId) -> Result<OperationId> {
        let sub = subscription_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        sub.subscribe(&mut self.ctx, operation)?;
        self.pump();
        Ok(operation)
    }

    pub fn unsubscribe(&mut self, id: HandleId) -> Result<OperationId> {
        let sub = subscription_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        sub.unsubscribe(&mut self.ctx, operation)?;
        self.pump();
        Ok(operation)
    }

    pub fn notify(&mut self, id: HandleId, options: NotifyOptions) -> Result<OperationId> {
        let sub = subscription_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        sub.notify(&mut self.ctx, Some(operation), options)?;
        self.pump();
        Ok(operation)
    }

    // ----- any handle -----

    /// Change a handle's tunables. Unchanged values produce no traffic.
    pub fn set_parameters(&mut self, id: HandleId, params: impl Into<HandleParameters>) -> Result<OperationId> {
        let params = params.into();
        let handle = live_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        match (handle, params) {
            (Handle::Call(call), HandleParameters::Call(params)) => {
                call.set_parameters(&mut self.ctx, operation, params)
            }
            (Handle::Registration(reg), HandleParameters::Registration(params)) => {
                reg.set_parameters(&mut self.ctx, operation, params)
            }
            (handle, _) => {
                return Err(EngineError::InvalidOperation(format!(
                    "Parameters do not apply to {:?} {}",
                    handle.kind(),
                    id
                )))
            }
        }
        self.pump();
        Ok(operation)
    }

    /// Supply a credential after `AuthenticationRequired`, or ahead of time
    pub fn authenticate(&mut self, id: HandleId, credential: Credential) -> Result<OperationId> {
        let handle = live_mut(&mut self.handles, &self.destroyed, id)?;
        let operation = self.ctx.next_operation();
        handle.authenticate(&mut self.ctx, operation, credential);
        self.pump();
        Ok(operation)
    }

    /// Release a handle. Its events stop immediately; protocol obligations
    /// (ACK, BYE, CANCEL, un-REGISTER, final NOTIFY) still run to completion
    /// before the handle leaves the arena.
    pub fn destroy(&mut self, id: HandleId) -> Result<()> {
        let handle = live_mut(&mut self.handles, &self.destroyed, id)?;
        self.ctx.events.suppress(id);
        handle.destroy(&mut self.ctx);
        self.destroyed.insert(id);
        self.candidates.insert(id);
        self.pump();
        Ok(())
    }

    // ----- inputs -----

    /// A message arrived from the network
    pub fn on_receive(&mut self, message: SipMessage, source: SocketAddr, protocol: TransportProtocol) {
        match message {
            SipMessage::Response(response) => self.ctx.receive_response(response),
            SipMessage::Request(request) => match self.ctx.receive_request(request, source, protocol) {
                IncomingRequest::New { key, request } => self.route_request(key, request),
                IncomingRequest::Ack(request) => self.route_ack(request),
                IncomingRequest::Cancel { invite, owner } => {
                    match owner.and_then(|o| self.handles.get_mut(&o)) {
                        Some(Handle::Call(call)) => call.on_cancel(&mut self.ctx, &invite),
                        _ => debug!("CANCEL for INVITE without a call"),
                    }
                }
                IncomingRequest::Absorbed => {}
            },
        }
        self.pump();
    }

    /// Feed a transport notification
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(incoming) => {
                self.on_receive(incoming.message, incoming.source, incoming.protocol)
            }
            TransportEvent::ConnectionClosed(destination) => self.connection_closed(&destination),
        }
    }

    /// Time moved forward; fire everything due
    pub fn advance(&mut self, now: Instant) {
        if now > self.ctx.now {
            self.ctx.now = now;
        }
        while let Some((token, timer)) = self.ctx.timers.pop_due(self.ctx.now) {
            match timer {
                EngineTimer::Transaction(key, timer) => {
                    self.ctx.fire_transaction_timer(token, key, timer)
                }
                EngineTimer::Handle(id, timer) => {
                    if let Some(handle) = self.handles.get_mut(&id) {
                        handle.on_timer(&mut self.ctx, timer, token);
                    }
                }
            }
            self.pump();
        }
    }

    /// The transport lost its connection or binding towards `destination`
    pub fn connection_closed(&mut self, destination: &Destination) {
        info!("Connection to {} closed", destination);
        for handle in self.handles.values_mut() {
            if let Handle::Registration(reg) = handle {
                reg.connection_closed(&mut self.ctx, destination);
            }
        }
        self.pump();
    }

    /// The transport could not deliver to `destination`
    pub fn on_send_failure(&mut self, destination: &Destination) {
        warn!("Send to {} failed", destination);
        self.ctx.transport_failed(destination);
        self.pump();
    }

    // ----- outputs -----

    pub fn poll_outgoing(&mut self) -> Option<Outgoing> {
        self.ctx.pop_outgoing()
    }

    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.ctx.events.pop()
    }

    /// When [`Engine::advance`] should be called next
    pub fn next_timeout(&self) -> Option<Instant> {
        self.ctx.timers.next_deadline()
    }

    // ----- request routing -----

    fn route_request(&mut self, key: TransactionKey, request: SipRequest) {
        if request.to_tag().is_some() {
            self.route_in_dialog(key, request);
        } else {
            self.route_out_of_dialog(key, request);
        }
    }

    fn route_out_of_dialog(&mut self, key: TransactionKey, request: SipRequest) {
        match request.method {
            SipMethod::Invite => {
                let id = self.allocate();
                // CANCEL finds the call through the INVITE transaction
                self.ctx.transactions.set_owner(&key, id);
                let call = Call::incoming(&mut self.ctx, id, key, request);
                self.insert(id, Handle::Call(call));
            }
            SipMethod::Subscribe => {
                let id = self.allocate();
                let sub = Subscription::incoming(&mut self.ctx, id, key, request);
                self.insert(id, Handle::Subscription(sub));
            }
            SipMethod::Options => {
                let response = ResponseBuilder::ok()
                    .to_tag(&self.ctx.new_tag())
                    .header("Allow", ALLOWED_METHODS)
                    .header("Accept", "application/sdp")
                    .header("Supported", "100rel, timer")
                    .build_for_request(&request);
                self.answer(&key, response);
            }
            SipMethod::Notify | SipMethod::Bye | SipMethod::Update | SipMethod::Prack => {
                self.reject(&key, 481);
            }
            _ => {
                debug!("Rejecting out-of-dialog {} with 405", request.method);
                let response = ResponseBuilder::new(405)
                    .to_tag(&self.ctx.new_tag())
                    .header("Allow", ALLOWED_METHODS)
                    .build_for_request(&request);
                self.answer(&key, response);
            }
        }
    }

    fn route_in_dialog(&mut self, key: TransactionKey, request: SipRequest) {
        if request.method == SipMethod::Notify {
            self.route_notify(key, request);
            return;
        }
        let Some(dialog) = DialogId::for_incoming_request(&request) else {
            self.reject(&key, 481);
            return;
        };

        if request.method == SipMethod::Subscribe {
            let notifier = self.handles.values_mut().find_map(|h| match h {
                Handle::Subscription(sub) if sub.dialog() == Some(&dialog) => Some(sub),
                _ => None,
            });
            match notifier {
                Some(sub) => sub.on_request(&mut self.ctx, key, request),
                None => self.reject(&key, 481),
            }
            return;
        }

        let owner = self.ctx.dialogs.get(&dialog).map(|d| d.owner);
        if request.method == SipMethod::Refer {
            let call = owner.filter(|o| matches!(self.handles.get(o), Some(Handle::Call(_))));
            if let Some(call) = call {
                self.receive_refer(call, dialog, key, request);
                return;
            }
        }
        if let (Some(owner), SipMethod::Invite) = (owner, request.method) {
            self.ctx.transactions.set_owner(&key, owner);
        }
        match owner.and_then(|o| self.handles.get_mut(&o)) {
            Some(Handle::Call(call)) => call.on_request(&mut self.ctx, key, request),
            Some(Handle::Subscription(sub)) => sub.on_request(&mut self.ctx, key, request),
            Some(Handle::Registration(_)) | None => {
                debug!("{} for unknown dialog {}", request.method, dialog);
                self.reject(&key, 481);
            }
        }
    }

    fn route_notify(&mut self, key: TransactionKey, request: SipRequest) {
        let call_id = request.call_id().unwrap_or_default().to_string();
        let to_tag = request.to_tag().unwrap_or_default();
        let (event, event_id) = parse_event(request.headers.get("Event").unwrap_or_default());
        if event.is_empty() {
            self.reject(&key, 489);
            return;
        }
        let subscriber = self.handles.values_mut().find_map(|h| match h {
            Handle::Subscription(sub)
                if sub.matches_notify(&call_id, &to_tag, &event, event_id.as_deref()) =>
            {
                Some(sub)
            }
            _ => None,
        });
        match subscriber {
            Some(sub) => sub.on_notify(&mut self.ctx, key, request),
            None => {
                debug!("NOTIFY for {} matches no subscription", event);
                self.reject(&key, 481);
            }
        }
    }

    /// REFER on a call: implicit subscription plus indication
    fn receive_refer(&mut self, call: HandleId, dialog: DialogId, key: TransactionKey, request: SipRequest) {
        let refer_to = request.headers.get_all("Refer-To");
        let target = match refer_to.as_slice() {
            [single] => NameAddr::parse(single).map(|n| n.uri),
            _ => None,
        };
        let Some(refer_to) = target else {
            info!("REFER without a single usable Refer-To, answering 400");
            self.reject(&key, 400);
            return;
        };
        if self.ctx.dialogs.check_remote_cseq(&dialog, &request)
            == crate::infrastructure::protocols::sip::dialog::RemoteCSeq::OutOfOrder
        {
            self.reject(&key, 500);
            return;
        }
        let referred_by = request.headers.get("Referred-By").map(str::to_string);

        let id = self.allocate();
        let auto_accept = self.ctx.config.call.auto_accept_refer;
        let (sub, token) = Subscription::refer_notifier(&mut self.ctx, id, dialog, key, request, auto_accept);
        self.insert(id, Handle::Subscription(sub));
        info!("REFER on {} to {} (subscription {})", call, refer_to, id);
        self.ctx.events.indicate(
            call,
            Indication::IncomingRefer {
                refer_to,
                referred_by,
                subscription: id,
                token,
            },
        );
    }

    fn route_ack(&mut self, request: SipRequest) {
        let owner = DialogId::for_incoming_request(&request)
            .and_then(|d| self.ctx.dialogs.get(&d).map(|d| d.owner));
        match owner.and_then(|o| self.handles.get_mut(&o)) {
            Some(Handle::Call(call)) => call.on_ack(&mut self.ctx, &request),
            _ => debug!("Dropping ACK outside any call"),
        }
    }

    fn answer(&mut self, key: &TransactionKey, response: crate::infrastructure::protocols::sip::message::SipResponse) {
        if let Err(e) = self.ctx.respond(key, response) {
            warn!("Failed to answer request: {}", e);
        }
    }

    fn reject(&mut self, key: &TransactionKey, status: u16) {
        if let Err(e) = self.ctx.respond_status(key, status) {
            warn!("Failed to answer request with {}: {}", status, e);
        }
    }

    // ----- internal work -----

    /// Deliver queued transaction results and cross-handle work, then
    /// reclaim handles that are done
    fn pump(&mut self) {
        loop {
            if let Some(event) = self.ctx.pop_transaction_event() {
                let Some(owner) = event.owner else {
                    continue;
                };
                self.candidates.insert(owner);
                if let Some(handle) = self.handles.get_mut(&owner) {
                    handle.on_transaction_event(&mut self.ctx, event);
                }
                continue;
            }
            if let Some(deferred) = self.ctx.pop_deferred() {
                match deferred {
                    Deferred::ReferProgress {
                        subscription,
                        status,
                        terminated,
                    } => match self.handles.get_mut(&subscription) {
                        Some(Handle::Subscription(sub)) => {
                            sub.notify_progress(&mut self.ctx, &status, terminated)
                        }
                        _ => debug!("REFER subscription {} is gone", subscription),
                    },
                    Deferred::CheckReclaim(id) => {
                        self.candidates.insert(id);
                    }
                }
                continue;
            }
            if !self.reclaim() {
                break;
            }
        }
    }

    /// Remove finished handles; true when anything was removed
    fn reclaim(&mut self) -> bool {
        let candidates = std::mem::take(&mut self.candidates);
        let mut removed = false;
        for id in candidates {
            let done = self
                .handles
                .get(&id)
                .map(|h| h.is_reclaimable(&self.ctx))
                .unwrap_or(false);
            if !done {
                continue;
            }
            self.hand_over_dialog(id);
            if let Some(mut handle) = self.handles.remove(&id) {
                handle.reclaim(&mut self.ctx);
                self.ctx.dialogs.remove_owned_by(id);
                self.ctx.events.release(id);
                self.destroyed.remove(&id);
                removed = true;
                info!("Handle {} reclaimed", id);
            }
        }
        if removed {
            gauge!("sip_active_handles").set(self.handles.len() as f64);
        }
        removed
    }

    /// A call leaving the arena passes its dialog to a REFER subscription
    /// still using it
    fn hand_over_dialog(&mut self, id: HandleId) {
        let Some(Handle::Call(call)) = self.handles.get(&id) else {
            return;
        };
        let Some(dialog) = call.dialog().cloned() else {
            return;
        };
        let heir = self.handles.values_mut().find_map(|h| match h {
            Handle::Subscription(sub) if sub.needs_dialog(&dialog) => Some(sub),
            _ => None,
        });
        if let Some(sub) = heir {
            sub.adopt_dialog(&mut self.ctx);
        }
    }
}

fn live_mut<'a>(
    handles: &'a mut HashMap<HandleId, Handle>,
    destroyed: &HashSet<HandleId>,
    id: HandleId,
) -> Result<&'a mut Handle> {
    if destroyed.contains(&id) {
        return Err(EngineError::UnknownHandle(format!("{} was destroyed", id)));
    }
    handles
        .get_mut(&id)
        .ok_or_else(|| EngineError::UnknownHandle(id.to_string()))
}

fn call_mut<'a>(
    handles: &'a mut HashMap<HandleId, Handle>,
    destroyed: &HashSet<HandleId>,
    id: HandleId,
) -> Result<&'a mut Call> {
    match live_mut(handles, destroyed, id)? {
        Handle::Call(call) => Ok(call),
        other => Err(EngineError::InvalidOperation(format!(
            "{} is a {:?}, not a call",
            id,
            other.kind()
        ))),
    }
}

fn registration_mut<'a>(
    handles: &'a mut HashMap<HandleId, Handle>,
    destroyed: &HashSet<HandleId>,
    id: HandleId,
) -> Result<&'a mut Registration> {
    match live_mut(handles, destroyed, id)? {
        Handle::Registration(reg) => Ok(reg),
        other => Err(EngineError::InvalidOperation(format!(
            "{} is a {:?}, not a registration",
            id,
            other.kind()
        ))),
    }
}

fn subscription_mut<'a>(
    handles: &'a mut HashMap<HandleId, Handle>,
    destroyed: &HashSet<HandleId>,
    id: HandleId,
) -> Result<&'a mut Subscription> {
    match live_mut(handles, destroyed, id)? {
        Handle::Subscription(sub) => Ok(sub),
        other => Err(EngineError::InvalidOperation(format!(
            "{} is a {:?}, not a subscription",
            id,
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::offer_answer::StaticOfferAnswer;

    fn engine() -> Engine {
        Engine::new(
            EngineConfig::default(),
            Box::new(StaticOfferAnswer::default()),
            Instant::now(),
        )
        .unwrap()
    }

    fn request(text: &str) -> SipMessage {
        SipMessage::parse(text.as_bytes()).unwrap()
    }

    fn source() -> SocketAddr {
        "192.0.2.10:5060".parse().unwrap()
    }

    fn sent_responses(engine: &mut Engine) -> Vec<u16> {
        let mut codes = Vec::new();
        while let Some(out) = engine.poll_outgoing() {
            if let Outgoing::Message {
                message: SipMessage::Response(r),
                ..
            } = out
            {
                codes.push(r.status);
            }
        }
        codes
    }

    #[test]
    fn test_unknown_handle_is_rejected() {
        let mut engine = engine();
        assert!(matches!(
            engine.start_call(HandleId(42)),
            Err(EngineError::UnknownHandle(_))
        ));
        assert!(engine.poll_outgoing().is_none());
    }

    #[test]
    fn test_wrong_handle_kind() {
        let mut engine = engine();
        let reg = engine.create_registration(RegistrationOptions::new(
            "sip:registrar.example.com",
            "sip:alice@example.com",
        ));
        assert!(matches!(
            engine.start_call(reg),
            Err(EngineError::InvalidOperation(_))
        ));
        assert_eq!(engine.handle_kind(reg), Some(HandleKind::Registration));
    }

    #[test]
    fn test_options_answered_with_allow() {
        let mut engine = engine();
        engine.on_receive(
            request(
                "OPTIONS sip:ua@192.0.2.1 SIP/2.0\r\n\
                 Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKopt1\r\n\
                 From: <sip:peer@192.0.2.10>;tag=p1\r\n\
                 To: <sip:ua@192.0.2.1>\r\n\
                 Call-ID: opt-1\r\n\
                 CSeq: 1 OPTIONS\r\n\
                 Content-Length: 0\r\n\r\n",
            ),
            source(),
            TransportProtocol::Udp,
        );
        let out = engine.poll_outgoing();
        match out {
            Some(Outgoing::Message {
                message: SipMessage::Response(r),
                ..
            }) => {
                assert_eq!(r.status, 200);
                assert!(r.headers.get("Allow").unwrap().contains("REFER"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.handle_count(), 0);
    }

    #[test]
    fn test_unknown_dialog_gets_481() {
        let mut engine = engine();
        engine.on_receive(
            request(
                "BYE sip:ua@192.0.2.1 SIP/2.0\r\n\
                 Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKbye1\r\n\
                 From: <sip:peer@192.0.2.10>;tag=p1\r\n\
                 To: <sip:ua@192.0.2.1>;tag=nosuch\r\n\
                 Call-ID: gone-1\r\n\
                 CSeq: 2 BYE\r\n\
                 Content-Length: 0\r\n\r\n",
            ),
            source(),
            TransportProtocol::Udp,
        );
        assert_eq!(sent_responses(&mut engine), vec![481]);
    }

    #[test]
    fn test_out_of_dialog_message_gets_405() {
        let mut engine = engine();
        engine.on_receive(
            request(
                "MESSAGE sip:ua@192.0.2.1 SIP/2.0\r\n\
                 Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKmsg1\r\n\
                 From: <sip:peer@192.0.2.10>;tag=p1\r\n\
                 To: <sip:ua@192.0.2.1>\r\n\
                 Call-ID: msg-1\r\n\
                 CSeq: 1 MESSAGE\r\n\
                 Content-Length: 0\r\n\r\n",
            ),
            source(),
            TransportProtocol::Udp,
        );
        assert_eq!(sent_responses(&mut engine), vec![405]);
    }

    #[test]
    fn test_destroy_idle_call_reclaims() {
        let mut engine = engine();
        let call = engine.create_call(CallOptions::new("sip:bob@192.0.2.20"));
        assert_eq!(engine.handle_count(), 1);
        engine.destroy(call).unwrap();
        assert_eq!(engine.handle_count(), 0);
        assert!(engine.poll_event().is_none());
        assert!(matches!(engine.destroy(call), Err(EngineError::UnknownHandle(_))));
    }
}
