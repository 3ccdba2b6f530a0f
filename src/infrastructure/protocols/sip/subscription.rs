//! Event subscriptions (RFC 6665) and REFER (RFC 3515)
//!
//! One [`Subscription`] handle covers both ends: a subscriber sends
//! SUBSCRIBE (or REFER) and consumes NOTIFYs; a notifier answers an
//! incoming SUBSCRIBE (or REFER) and sends NOTIFYs one at a time.

use super::auth::{AuthManager, Credential};
use super::builder::{RequestBuilder, ResponseBuilder};
use super::context::{
    ChallengeOutcome, Deferred, EngineContext, HandleTimer, HandleTimers, TransactionEvent,
    TransactionEventKind,
};
use super::dialog::{DialogId, RemoteCSeq};
use super::events::{Indication, OperationKind, PendingResponse};
use super::headers::{parse_delta_seconds, parse_event, NameAddr, SubState, SubscriptionStateHeader};
use super::message::{Body, SipMethod, SipRequest, SipResponse};
use super::timer::TimerToken;
use super::transaction::TransactionKey;
use super::transport::Destination;
use super::call::ResponseOptions;
use crate::domain::shared::{EngineError, HandleId, OperationId, Result, Status};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Event package of the implicit REFER subscription
pub const REFER_EVENT: &str = "refer";

/// Subscription State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// SUBSCRIBE sent or received, no NOTIFY yet
    Embryonic,
    Pending,
    Active,
    Terminated,
}

impl SubscriptionState {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionState::Embryonic => "Embryonic",
            SubscriptionState::Pending => "Pending",
            SubscriptionState::Active => "Active",
            SubscriptionState::Terminated => "Terminated",
        }
    }
}

impl From<SubState> for SubscriptionState {
    fn from(state: SubState) -> Self {
        match state {
            SubState::Active => SubscriptionState::Active,
            SubState::Pending => SubscriptionState::Pending,
            SubState::Terminated => SubscriptionState::Terminated,
        }
    }
}

/// Which end of the subscription this handle is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRole {
    Subscriber,
    Notifier,
}

/// Options of an outgoing SUBSCRIBE
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub target: String,
    pub event: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Requested duration; the configured default when unset
    pub expires: Option<u32>,
    pub accept: Option<String>,
    pub body: Option<Body>,
    pub headers: Vec<(String, String)>,
}

impl SubscriptionOptions {
    pub fn new(target: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Content of one NOTIFY
#[derive(Debug, Clone)]
pub struct NotifyOptions {
    pub state: SubState,
    pub body: Option<Body>,
    /// Remaining duration; derived from the subscription when unset
    pub expires: Option<u32>,
    /// Reason of a terminating NOTIFY
    pub reason: Option<String>,
    pub retry_after: Option<u32>,
    pub headers: Vec<(String, String)>,
}

impl NotifyOptions {
    pub fn new(state: SubState) -> Self {
        Self {
            state,
            body: None,
            expires: None,
            reason: None,
            retry_after: None,
            headers: Vec::new(),
        }
    }

    pub fn active() -> Self {
        Self::new(SubState::Active)
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::new(SubState::Terminated).with_reason(reason)
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u32) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Options of an outgoing REFER
#[derive(Debug, Clone, Default)]
pub struct ReferOptions {
    pub refer_to: String,
    pub referred_by: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl ReferOptions {
    pub fn new(refer_to: impl Into<String>) -> Self {
        Self {
            refer_to: refer_to.into(),
            ..Default::default()
        }
    }

    pub fn with_referred_by(mut self, referred_by: impl Into<String>) -> Self {
        self.referred_by = Some(referred_by.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Subscribe,
    Refresh,
    Unsubscribe,
    Refer,
}

/// SUBSCRIBE or REFER of ours waiting for its final response
#[derive(Debug, Clone)]
struct PendingRequest {
    key: Option<TransactionKey>,
    request: SipRequest,
    operation: Option<OperationId>,
    purpose: Purpose,
    interval_retried: bool,
    challenge: Option<SipResponse>,
}

/// NOTIFY on the wire
#[derive(Debug, Clone)]
struct InFlightNotify {
    key: TransactionKey,
    request: SipRequest,
    operation: Option<OperationId>,
    terminal: bool,
}

/// Subscription handle
pub struct Subscription {
    id: HandleId,
    role: SubscriptionRole,
    state: SubscriptionState,
    event: String,
    event_id: Option<String>,
    options: SubscriptionOptions,
    expires: u32,
    refresh_ratio: f64,
    call_id: String,
    local_tag: String,
    cseq: u32,
    dialog: Option<DialogId>,
    /// Dialog belongs to a call (REFER usage); never removed from here
    shared_dialog: bool,
    pending: Option<PendingRequest>,
    /// Incoming SUBSCRIBE/REFER waiting for our answer
    server: Option<(TransactionKey, SipRequest)>,
    notify_queue: VecDeque<(Option<OperationId>, NotifyOptions)>,
    in_flight: Option<InFlightNotify>,
    /// When our notifier-side subscription lapses
    expires_at: Option<std::time::Instant>,
    timers: HandleTimers,
    auth: AuthManager,
    zombie: bool,
}

impl Subscription {
    fn new(ctx: &mut EngineContext, id: HandleId, role: SubscriptionRole, event: String) -> Self {
        Self {
            id,
            role,
            state: SubscriptionState::Embryonic,
            event,
            event_id: None,
            options: SubscriptionOptions::default(),
            expires: ctx.config.subscription.expires,
            refresh_ratio: ctx.config.subscription.refresh_ratio,
            call_id: String::new(),
            local_tag: ctx.new_tag(),
            cseq: 0,
            dialog: None,
            shared_dialog: false,
            pending: None,
            server: None,
            notify_queue: VecDeque::new(),
            in_flight: None,
            expires_at: None,
            timers: HandleTimers::default(),
            auth: AuthManager::new(ctx.config.auth.max_retries),
            zombie: false,
        }
    }

    /// Subscriber created by the application
    pub fn outgoing(ctx: &mut EngineContext, id: HandleId, options: SubscriptionOptions) -> Self {
        let (event, event_id) = parse_event(&options.event);
        let mut sub = Self::new(ctx, id, SubscriptionRole::Subscriber, event);
        sub.event_id = event_id;
        sub.call_id = ctx.new_call_id();
        if let Some(expires) = options.expires {
            sub.expires = expires;
        }
        sub.options = options;
        sub
    }

    /// Subscriber for the implicit subscription of a REFER we send on `dialog`
    pub fn refer_subscriber(ctx: &mut EngineContext, id: HandleId, dialog: DialogId) -> Self {
        let mut sub = Self::new(ctx, id, SubscriptionRole::Subscriber, REFER_EVENT.to_string());
        sub.call_id = dialog.call_id.clone();
        sub.local_tag = dialog.local_tag.clone();
        sub.dialog = Some(dialog);
        sub.shared_dialog = true;
        // Implicit subscriptions go away by themselves once terminated
        sub.zombie = true;
        sub
    }

    /// Notifier for an incoming out-of-dialog SUBSCRIBE
    pub fn incoming(ctx: &mut EngineContext, id: HandleId, key: TransactionKey, request: SipRequest) -> Self {
        let (event, event_id) = request
            .headers
            .get("Event")
            .map(parse_event)
            .unwrap_or_default();
        let mut sub = Self::new(ctx, id, SubscriptionRole::Notifier, event.clone());
        sub.event_id = event_id;
        sub.call_id = request.call_id().unwrap_or_default().to_string();

        if event.is_empty() {
            info!("SUBSCRIBE without Event, answering 489");
            let response = ResponseBuilder::new(489).to_tag(&sub.local_tag).build_for_request(&request);
            if let Err(e) = ctx.respond(&key, response) {
                warn!("Failed to answer SUBSCRIBE: {}", e);
            }
            sub.state = SubscriptionState::Terminated;
            sub.zombie = true;
            ctx.defer(Deferred::CheckReclaim(id));
            return sub;
        }

        let expires = request
            .headers
            .get("Expires")
            .and_then(parse_delta_seconds)
            .unwrap_or(sub.expires);
        sub.expires = expires;
        sub.server = Some((key.clone(), request.clone()));
        info!("Incoming SUBSCRIBE {} for {}", id, event);
        ctx.events.indicate(
            id,
            Indication::IncomingSubscribe {
                token: PendingResponse::new(id, key, request),
                event,
                expires,
            },
        );
        sub
    }

    /// Implicit notifier of an incoming REFER on a call's `dialog`.
    ///
    /// Answers 202 right away when `auto_accept` is set; otherwise returns
    /// the token the application must answer.
    pub fn refer_notifier(
        ctx: &mut EngineContext,
        id: HandleId,
        dialog: DialogId,
        key: TransactionKey,
        request: SipRequest,
        auto_accept: bool,
    ) -> (Self, Option<PendingResponse>) {
        let mut sub = Self::new(ctx, id, SubscriptionRole::Notifier, REFER_EVENT.to_string());
        sub.event_id = request.cseq().map(|c| c.seq.to_string());
        sub.call_id = dialog.call_id.clone();
        sub.local_tag = dialog.local_tag.clone();
        sub.dialog = Some(dialog);
        sub.shared_dialog = true;
        sub.zombie = true;
        sub.server = Some((key.clone(), request.clone()));

        if auto_accept {
            if let Err(e) = sub.accept(ctx, &key, &ResponseOptions::new(202)) {
                warn!("Failed to accept REFER: {}", e);
            }
            (sub, None)
        } else {
            (sub, Some(PendingResponse::new(id, key, request)))
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn role(&self) -> SubscriptionRole {
        self.role
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn dialog(&self) -> Option<&DialogId> {
        self.dialog.as_ref()
    }

    /// Local tag NOTIFYs to this subscriber carry in To
    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn is_refer(&self) -> bool {
        self.event == REFER_EVENT
    }

    /// NOTIFY with this Call-ID, To tag and Event belongs to us
    pub fn matches_notify(&self, call_id: &str, to_tag: &str, event: &str, event_id: Option<&str>) -> bool {
        let id_matches = match (self.event_id.as_deref(), event_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        };
        self.role == SubscriptionRole::Subscriber
            && self.call_id == call_id
            && self.local_tag == to_tag
            && self.event == event
            && id_matches
    }

    pub fn is_reclaimable(&self, ctx: &EngineContext) -> bool {
        self.zombie
            && self.state == SubscriptionState::Terminated
            && self.in_flight.is_none()
            && ctx.transactions.owned_by(self.id).is_empty()
    }

    // ----- subscriber operations -----

    pub fn subscribe(&mut self, ctx: &mut EngineContext, operation: OperationId) -> Result<()> {
        self.require_role(SubscriptionRole::Subscriber)?;
        if self.is_refer() {
            return Err(EngineError::InvalidOperation(
                "REFER subscriptions cannot be refreshed".to_string(),
            ));
        }
        if self.pending.is_some() {
            return Err(EngineError::InvalidState("SUBSCRIBE already in progress".to_string()));
        }
        let purpose = match (self.state, &self.dialog) {
            (SubscriptionState::Pending | SubscriptionState::Active, Some(_)) => Purpose::Refresh,
            _ => Purpose::Subscribe,
        };
        self.send_subscribe(ctx, Some(operation), purpose)
    }

    pub fn unsubscribe(&mut self, ctx: &mut EngineContext, operation: OperationId) -> Result<()> {
        self.require_role(SubscriptionRole::Subscriber)?;
        if self.dialog.is_none() || self.state == SubscriptionState::Terminated {
            return Err(EngineError::InvalidState(format!(
                "Subscription {} is not established ({})",
                self.id,
                self.state.name()
            )));
        }
        if self.is_refer() {
            return Err(EngineError::InvalidOperation(
                "REFER subscriptions end with the referred call".to_string(),
            ));
        }
        if let Some(pending) = self.pending.take() {
            if let Some(op) = pending.operation {
                ctx.events.result(
                    self.id,
                    op,
                    result_kind(pending.purpose),
                    Status::local_cancelled(),
                    true,
                );
            }
        }
        self.timers.stop(ctx, HandleTimer::SubscriptionRefresh);
        self.send_subscribe(ctx, Some(operation), Purpose::Unsubscribe)
    }

    /// Send REFER on the shared call dialog
    pub fn refer(&mut self, ctx: &mut EngineContext, operation: OperationId, options: &ReferOptions) -> Result<()> {
        let dialog = self
            .dialog
            .clone()
            .ok_or_else(|| EngineError::InvalidState("REFER needs a dialog".to_string()))?;
        let (mut request, destination) = dialog_request(ctx, &dialog, SipMethod::Refer)?;
        request.headers.push("Refer-To", NameAddr::new(options.refer_to.clone()).to_string());
        if let Some(referred_by) = &options.referred_by {
            request.headers.push("Referred-By", referred_by.clone());
        }
        for (name, value) in &options.headers {
            request.headers.push(name.clone(), value.clone());
        }
        let key = ctx.send_request(request.clone(), destination, Some(self.id))?;
        self.event_id = request.cseq().map(|c| c.seq.to_string());
        info!("REFER to {} sent on {}", options.refer_to, self.id);
        self.pending = Some(PendingRequest {
            key: Some(key),
            request,
            operation: Some(operation),
            purpose: Purpose::Refer,
            interval_retried: false,
            challenge: None,
        });
        Ok(())
    }

    fn send_subscribe(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, purpose: Purpose) -> Result<()> {
        let expires = if purpose == Purpose::Unsubscribe { 0 } else { self.expires };
        let (mut request, destination) = match &self.dialog {
            Some(dialog) if purpose != Purpose::Subscribe => dialog_request(ctx, dialog, SipMethod::Subscribe)?,
            _ => self.initial_subscribe(ctx)?,
        };
        let mut event = self.event.clone();
        if let Some(id) = &self.event_id {
            event.push_str(&format!(";id={}", id));
        }
        request.headers.push("Event", event);
        request.headers.push("Expires", expires.to_string());
        if let Some(accept) = &self.options.accept {
            request.headers.push("Accept", accept.clone());
        }
        for (name, value) in &self.options.headers {
            request.headers.push(name.clone(), value.clone());
        }
        if purpose == Purpose::Subscribe {
            request.set_body(self.options.body.clone());
        }

        let key = ctx.send_request(request.clone(), destination, Some(self.id))?;
        debug!("SUBSCRIBE {:?} for {} (expires {})", purpose, self.id, expires);
        self.pending = Some(PendingRequest {
            key: Some(key),
            request,
            operation,
            purpose,
            interval_retried: false,
            challenge: None,
        });
        Ok(())
    }

    fn initial_subscribe(&mut self, ctx: &mut EngineContext) -> Result<(SipRequest, Destination)> {
        let destination = ctx.route_for(&self.options.target).ok_or_else(|| {
            EngineError::InvalidOperation(format!("Unroutable target {}", self.options.target))
        })?;
        self.cseq += 1;
        let from = NameAddr::new(
            self.options
                .from
                .clone()
                .unwrap_or_else(|| format!("sip:{}@{}", ctx.local.user, ctx.local.host)),
        )
        .with_tag(&self.local_tag);
        let to = NameAddr::new(self.options.to.clone().unwrap_or_else(|| self.options.target.clone()));
        let request = RequestBuilder::new(SipMethod::Subscribe, self.options.target.clone())
            .via(&ctx.via())
            .max_forwards(70)
            .route_set(&ctx.outbound_route())
            .from(&from)
            .to(&to)
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .contact(&ctx.local.contact(None))
            .build();
        Ok((request, destination))
    }

    // ----- notifier operations -----

    /// Answer the pending SUBSCRIBE or REFER
    pub fn respond(
        &mut self,
        ctx: &mut EngineContext,
        operation: OperationId,
        key: &TransactionKey,
        options: ResponseOptions,
    ) -> Result<()> {
        if !(200..700).contains(&options.status) {
            return Err(EngineError::InvalidOperation(format!(
                "Cannot answer {} with {}",
                self.event, options.status
            )));
        }
        self.accept(ctx, key, &options)?;
        ctx.events.result(
            self.id,
            operation,
            OperationKind::Respond,
            Status::local(options.status, options.reason.clone().unwrap_or_default()),
            true,
        );
        Ok(())
    }

    fn accept(&mut self, ctx: &mut EngineContext, key: &TransactionKey, options: &ResponseOptions) -> Result<()> {
        let request = match &self.server {
            Some((pending, request)) if pending == key => request.clone(),
            _ => {
                return Err(EngineError::TokenConsumed(format!(
                    "{} request on {} already answered",
                    self.event, self.id
                )))
            }
        };

        let mut builder = ResponseBuilder::new(options.status).to_tag(&self.local_tag);
        if let Some(reason) = &options.reason {
            builder = builder.reason(reason.clone());
        }
        for (name, value) in &options.headers {
            builder = builder.header(name, value.clone());
        }
        let success = (200..300).contains(&options.status);
        if success {
            builder = builder.header("Contact", ctx.local.contact(None).to_string());
            if request.method == SipMethod::Subscribe {
                builder = builder.header("Expires", self.expires.to_string());
            }
        }
        ctx.respond(key, builder.build_for_request(&request))?;
        self.server = None;

        if !success {
            self.set_state(ctx, SubscriptionState::Terminated, Some("rejected".to_string()));
            return Ok(());
        }
        if self.dialog.is_none() {
            self.dialog = ctx
                .dialogs
                .create_uas(&request, &self.local_tag, ctx.local.contact(None), self.id);
            if let Some(dialog) = &self.dialog {
                ctx.dialogs.confirm(dialog);
            }
        }
        let state = if options.status == 202 && request.method == SipMethod::Subscribe {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Active
        };
        self.set_state(ctx, state, None);
        self.arm_expiry(ctx);
        Ok(())
    }

    /// Queue a NOTIFY; only one is on the wire at a time
    pub fn notify(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, options: NotifyOptions) -> Result<()> {
        self.require_role(SubscriptionRole::Notifier)?;
        if self.dialog.is_none() || self.state == SubscriptionState::Terminated {
            return Err(EngineError::InvalidState(format!(
                "Cannot NOTIFY on {} in state {}",
                self.id,
                self.state.name()
            )));
        }
        if self.server.is_some() {
            return Err(EngineError::InvalidState("Subscription not answered yet".to_string()));
        }
        if let Some(last) = self.notify_queue.back() {
            if last.1.state == SubState::Terminated {
                return Err(EngineError::InvalidState("Subscription is being terminated".to_string()));
            }
        }
        self.notify_queue.push_back((operation, options));
        self.send_next_notify(ctx);
        Ok(())
    }

    /// Progress of the call this REFER started, as a sipfrag NOTIFY
    pub fn notify_progress(&mut self, ctx: &mut EngineContext, status: &Status, terminated: bool) {
        if !self.is_refer() || self.role != SubscriptionRole::Notifier {
            return;
        }
        if self.state == SubscriptionState::Terminated || self.dialog.is_none() {
            debug!("Dropping REFER progress {} for {}", status, self.id);
            return;
        }
        let body = Body::sipfrag(status.code, &status.reason);
        let options = if terminated {
            NotifyOptions::terminated("noresource").with_body(body)
        } else {
            NotifyOptions::active().with_body(body)
        };
        if let Err(e) = self.notify(ctx, None, options) {
            debug!("REFER progress on {} not sent: {}", self.id, e);
        }
    }

    fn send_next_notify(&mut self, ctx: &mut EngineContext) {
        if self.in_flight.is_some() {
            return;
        }
        let Some((operation, options)) = self.notify_queue.pop_front() else {
            return;
        };
        let Some(dialog) = self.dialog.clone() else {
            return;
        };
        let terminal = options.state == SubState::Terminated;
        let header = SubscriptionStateHeader {
            state: options.state,
            expires: if terminal {
                None
            } else {
                Some(options.expires.unwrap_or_else(|| self.remaining(ctx)))
            },
            reason: options.reason.clone(),
            retry_after: options.retry_after,
        };

        let sent = dialog_request(ctx, &dialog, SipMethod::Notify).and_then(|(mut request, destination)| {
            let mut event = self.event.clone();
            if let Some(id) = &self.event_id {
                event.push_str(&format!(";id={}", id));
            }
            request.headers.push("Event", event);
            request.headers.push("Subscription-State", header.to_string());
            for (name, value) in &options.headers {
                request.headers.push(name.clone(), value.clone());
            }
            request.set_body(options.body.clone());
            let key = ctx.send_request(request.clone(), destination, Some(self.id))?;
            Ok((key, request))
        });

        match sent {
            Ok((key, request)) => {
                debug!("NOTIFY {} sent on {}", header, self.id);
                if !terminal {
                    self.set_state(ctx, options.state.into(), None);
                }
                self.in_flight = Some(InFlightNotify {
                    key,
                    request,
                    operation,
                    terminal,
                });
            }
            Err(e) => {
                warn!("NOTIFY on {} not sent: {}", self.id, e);
                self.fail_notifies(ctx, operation, Status::local(500, e.to_string()));
            }
        }
    }

    /// Seconds left of the subscription we granted
    fn remaining(&self, ctx: &EngineContext) -> u32 {
        self.expires_at
            .map(|at| at.saturating_duration_since(ctx.now).as_secs() as u32)
            .unwrap_or(self.expires)
    }

    /// A NOTIFY failed: the subscription is over and nothing queued goes out
    fn fail_notifies(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, status: Status) {
        if let Some(operation) = operation {
            ctx.events
                .result(self.id, operation, OperationKind::Notify, status, true);
        }
        for (queued, _) in self.notify_queue.drain(..) {
            if let Some(queued) = queued {
                ctx.events.result(
                    self.id,
                    queued,
                    OperationKind::Notify,
                    Status::local_cancelled(),
                    true,
                );
            }
        }
        self.terminate(ctx, Some("rejected".to_string()));
    }

    // ----- incoming requests -----

    /// NOTIFY routed to this subscriber
    pub fn on_notify(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: SipRequest) {
        let header = request
            .headers
            .get("Subscription-State")
            .and_then(SubscriptionStateHeader::parse);
        let Some(header) = header else {
            self.reply(ctx, &key, &request, 400);
            return;
        };

        match &self.dialog {
            Some(dialog) => {
                if ctx.dialogs.check_remote_cseq(dialog, &request) == RemoteCSeq::OutOfOrder {
                    self.reply(ctx, &key, &request, 500);
                    return;
                }
                ctx.dialogs
                    .refresh_target(dialog, request.headers.get("Contact"));
            }
            None => {
                let subscribe = self.pending.as_ref().map(|p| p.request.clone());
                let created = subscribe.and_then(|s| ctx.dialogs.create_uac_from_request(&s, &request, self.id));
                match created {
                    Some(dialog) => {
                        debug!("NOTIFY created dialog {} before SUBSCRIBE response", dialog);
                        self.dialog = Some(dialog);
                    }
                    None => {
                        self.reply(ctx, &key, &request, 481);
                        return;
                    }
                }
            }
        }
        self.reply(ctx, &key, &request, 200);

        let body = request.body();
        ctx.events.indicate(
            self.id,
            Indication::IncomingNotify {
                event: self.event.clone(),
                state: header.state,
                body: body.clone(),
            },
        );
        if self.is_refer() {
            if let Some(code) = body.as_ref().and_then(|b| b.sipfrag_status()) {
                let terminated = header.state == SubState::Terminated;
                ctx.events.indicate(
                    self.id,
                    Indication::TransferProgress {
                        status: Status::remote(code, super::message::reason_phrase(code)),
                        terminated,
                    },
                );
            }
        }

        match header.state {
            SubState::Active | SubState::Pending => {
                self.set_state(ctx, header.state.into(), None);
                if let Some(expires) = header.expires {
                    self.arm_refresh(ctx, expires);
                }
            }
            SubState::Terminated => self.on_terminated_notify(ctx, &header),
        }
    }

    fn on_terminated_notify(&mut self, ctx: &mut EngineContext, header: &SubscriptionStateHeader) {
        let reason = header.reason.clone();
        let resubscribe = match reason.as_deref() {
            Some("deactivated") | Some("timeout") if !self.is_refer() && !self.zombie => Some(Duration::ZERO),
            Some("probation") | Some("giveup") if !self.is_refer() && !self.zombie => {
                Some(Duration::from_secs(u64::from(header.retry_after.unwrap_or(0))))
            }
            _ => None,
        };
        let Some(delay) = resubscribe else {
            info!("Subscription {} terminated by notifier ({:?})", self.id, reason);
            self.terminate(ctx, reason);
            return;
        };

        info!("Subscription {} {:?}, subscribing again in {:?}", self.id, reason, delay);
        self.timers.stop_all(ctx);
        self.pending = None;
        self.forget_dialog(ctx);
        self.local_tag = ctx.new_tag();
        self.set_state(ctx, SubscriptionState::Embryonic, reason);
        if delay.is_zero() {
            if let Err(e) = self.send_subscribe(ctx, None, Purpose::Subscribe) {
                warn!("Re-subscribe of {} failed: {}", self.id, e);
                self.terminate(ctx, Some("giveup".to_string()));
            }
        } else {
            self.timers
                .start(ctx, self.id, HandleTimer::SubscriptionRefresh, delay);
        }
    }

    /// In-dialog SUBSCRIBE: refresh or un-subscribe, answered automatically
    pub fn on_request(&mut self, ctx: &mut EngineContext, key: TransactionKey, request: SipRequest) {
        if request.method != SipMethod::Subscribe || self.role != SubscriptionRole::Notifier {
            self.reply(ctx, &key, &request, 501);
            return;
        }
        if let Some(dialog) = &self.dialog {
            if ctx.dialogs.check_remote_cseq(dialog, &request) == RemoteCSeq::OutOfOrder {
                self.reply(ctx, &key, &request, 500);
                return;
            }
        }
        if self.state == SubscriptionState::Terminated {
            self.reply(ctx, &key, &request, 481);
            return;
        }
        let expires = request
            .headers
            .get("Expires")
            .and_then(parse_delta_seconds)
            .unwrap_or(self.expires);
        let response = ResponseBuilder::ok()
            .header("Expires", expires.to_string())
            .header("Contact", ctx.local.contact(None).to_string())
            .build_for_request(&request);
        if let Err(e) = ctx.respond(&key, response) {
            warn!("Failed to answer SUBSCRIBE refresh: {}", e);
            return;
        }
        if expires == 0 {
            info!("Subscriber ended {}", self.id);
            self.timers.stop(ctx, HandleTimer::SubscriptionExpiry);
            self.final_notify(ctx, "timeout");
        } else {
            debug!("Subscription {} refreshed for {}s", self.id, expires);
            self.expires = expires;
            self.arm_expiry(ctx);
        }
    }

    fn reply(&self, ctx: &mut EngineContext, key: &TransactionKey, request: &SipRequest, status: u16) {
        let response = ResponseBuilder::new(status).build_for_request(request);
        if let Err(e) = ctx.respond(key, response) {
            warn!("Failed to answer {} with {}: {}", request.method, status, e);
        }
    }

    /// Terminating NOTIFY generated by us
    fn final_notify(&mut self, ctx: &mut EngineContext, reason: &str) {
        let pending_terminal = self
            .notify_queue
            .iter()
            .any(|(_, n)| n.state == SubState::Terminated)
            || self.in_flight.as_ref().map(|n| n.terminal).unwrap_or(false);
        if pending_terminal {
            return;
        }
        self.notify_queue.push_back((None, NotifyOptions::terminated(reason)));
        self.send_next_notify(ctx);
    }

    // ----- transaction results -----

    pub fn on_transaction_event(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        if self.in_flight.as_ref().map(|n| n.key == event.key).unwrap_or(false) {
            self.on_notify_event(ctx, event);
            return;
        }
        let current = self
            .pending
            .as_ref()
            .and_then(|p| p.key.as_ref())
            .map(|k| k == &event.key)
            .unwrap_or(false);
        if !current {
            return;
        }
        match event.kind {
            TransactionEventKind::Response(response) if response.is_provisional() => {}
            TransactionEventKind::Response(response) if response.is_success() => self.on_success(ctx, response),
            TransactionEventKind::Response(response) => {
                let status = Status::remote(response.status, response.reason.clone());
                self.on_failure(ctx, &event.request, status, Some(response));
            }
            TransactionEventKind::Failed(status) => self.on_failure(ctx, &event.request, status, None),
            TransactionEventKind::CancelReleased | TransactionEventKind::Terminated => {}
        }
    }

    fn on_success(&mut self, ctx: &mut EngineContext, response: SipResponse) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let status = Status::remote(response.status, response.reason.clone());
        self.auth.reset();

        if self.dialog.is_none() {
            self.dialog = ctx.dialogs.create_uac(&pending.request, &response, self.id);
        } else if let Some(dialog) = &self.dialog {
            if !self.shared_dialog {
                ctx.dialogs.refresh_target(dialog, response.headers.get("Contact"));
            }
        }
        if let Some(operation) = pending.operation {
            ctx.events
                .result(self.id, operation, result_kind(pending.purpose), status, true);
        }

        match pending.purpose {
            Purpose::Unsubscribe => self.terminate(ctx, Some("unsubscribed".to_string())),
            Purpose::Refer => {
                if self.state == SubscriptionState::Embryonic {
                    self.set_state(ctx, SubscriptionState::Pending, None);
                }
            }
            Purpose::Subscribe | Purpose::Refresh => {
                let granted = response
                    .headers
                    .get("Expires")
                    .and_then(parse_delta_seconds)
                    .unwrap_or(self.expires);
                if granted == 0 {
                    self.terminate(ctx, Some("timeout".to_string()));
                    return;
                }
                if self.state == SubscriptionState::Embryonic {
                    self.set_state(ctx, SubscriptionState::Pending, None);
                }
                self.arm_refresh(ctx, granted);
                if self.zombie {
                    if let Err(e) = self.send_subscribe(ctx, None, Purpose::Unsubscribe) {
                        debug!("Unsubscribe on destroy failed: {}", e);
                        self.terminate(ctx, None);
                    }
                }
            }
        }
    }

    fn on_failure(&mut self, ctx: &mut EngineContext, request: &SipRequest, status: Status, response: Option<SipResponse>) {
        let Some(pending) = self.pending.clone() else {
            return;
        };
        if let Some(response) = &response {
            if response.status == 401 || response.status == 407 {
                self.answer_challenge(ctx, request, response);
                return;
            }
            if response.status == 423 && !pending.interval_retried {
                if let Some(min) = response.headers.get("Min-Expires").and_then(parse_delta_seconds) {
                    if min > self.expires {
                        self.expires = min;
                        if self.send_subscribe(ctx, pending.operation, pending.purpose).is_ok() {
                            if let Some(p) = self.pending.as_mut() {
                                p.interval_retried = true;
                            }
                            return;
                        }
                    }
                }
            }
        }
        self.pending = None;
        warn!("{:?} on {} failed: {}", pending.purpose, self.id, status);
        if let Some(operation) = pending.operation {
            ctx.events
                .result(self.id, operation, result_kind(pending.purpose), status.clone(), true);
        }
        let established = matches!(self.state, SubscriptionState::Pending | SubscriptionState::Active);
        match pending.purpose {
            // A NOTIFY may already have set the state; a failed refresh keeps
            // the subscription until it expires unless the dialog is gone
            Purpose::Refresh if status.code != 481 && status.code != 408 => {}
            Purpose::Subscribe if established && !status.is_local() => {}
            _ => self.terminate(ctx, Some("rejected".to_string())),
        }
    }

    fn answer_challenge(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: &SipResponse) {
        let Some(pending) = self.pending.clone() else {
            return;
        };
        let status = Status::remote(response.status, response.reason.clone());
        let target = match &self.dialog {
            Some(dialog) if pending.purpose != Purpose::Subscribe => ctx
                .dialogs
                .next_cseq(dialog)
                .zip(ctx.dialogs.get(dialog).and_then(|d| d.next_hop(ctx.local.protocol))),
            _ => {
                self.cseq += 1;
                ctx.route_for(&self.options.target).map(|d| (self.cseq, d))
            }
        };
        let outcome = match target {
            Some((cseq, destination)) => {
                ctx.answer_challenge(&mut self.auth, request, response, cseq, destination, self.id)
            }
            None => ChallengeOutcome::Failed,
        };
        match outcome {
            ChallengeOutcome::Resent { key, request } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.key = Some(key);
                    pending.request = request;
                }
            }
            ChallengeOutcome::NeedCredentials { realm } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.key = None;
                    pending.request = request.clone();
                    pending.challenge = Some(response.clone());
                }
                ctx.events
                    .indicate(self.id, Indication::AuthenticationRequired { realm });
            }
            ChallengeOutcome::Failed => {
                self.pending = None;
                if let Some(operation) = pending.operation {
                    ctx.events
                        .result(self.id, operation, result_kind(pending.purpose), status, true);
                }
                if pending.purpose != Purpose::Refresh {
                    self.terminate(ctx, Some("rejected".to_string()));
                }
            }
        }
    }

    pub fn authenticate(&mut self, ctx: &mut EngineContext, operation: OperationId, credential: Credential) {
        self.auth.add_credential(credential);
        ctx.events
            .result(self.id, operation, OperationKind::Authenticate, Status::ok(), true);
        let waiting = self
            .pending
            .as_mut()
            .and_then(|p| p.challenge.take().map(|c| (p.request.clone(), c)));
        if let Some((request, response)) = waiting {
            self.answer_challenge(ctx, &request, &response);
        }
    }

    fn on_notify_event(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        let (status, response) = match event.kind {
            TransactionEventKind::Response(r) if r.is_provisional() => return,
            TransactionEventKind::Response(r) => (Status::remote(r.status, r.reason.clone()), Some(r)),
            TransactionEventKind::Failed(status) => (status, None),
            TransactionEventKind::CancelReleased | TransactionEventKind::Terminated => return,
        };
        let Some(notify) = self.in_flight.take() else {
            return;
        };

        if let Some(response) = &response {
            if response.status == 401 || response.status == 407 {
                let retried = self.dialog.clone().and_then(|dialog| {
                    let cseq = ctx.dialogs.next_cseq(&dialog)?;
                    let destination = ctx.dialogs.get(&dialog)?.next_hop(ctx.local.protocol)?;
                    match ctx.answer_challenge(&mut self.auth, &notify.request, response, cseq, destination, self.id) {
                        ChallengeOutcome::Resent { key, request } => Some((key, request)),
                        _ => None,
                    }
                });
                if let Some((key, request)) = retried {
                    self.in_flight = Some(InFlightNotify { key, request, ..notify });
                    return;
                }
            }
        }

        if status.is_success() {
            if let Some(operation) = notify.operation {
                ctx.events
                    .result(self.id, operation, OperationKind::Notify, status, true);
            }
            if notify.terminal {
                let reason = notify
                    .request
                    .headers
                    .get("Subscription-State")
                    .and_then(SubscriptionStateHeader::parse)
                    .and_then(|h| h.reason);
                self.terminate(ctx, reason);
            } else {
                self.send_next_notify(ctx);
            }
        } else {
            warn!("NOTIFY on {} failed: {}", self.id, status);
            self.fail_notifies(ctx, notify.operation, status);
        }
    }

    // ----- lifecycle -----

    pub fn destroy(&mut self, ctx: &mut EngineContext) {
        self.zombie = true;
        info!("Destroying subscription {} in state {}", self.id, self.state.name());
        if let Some((key, request)) = self.server.take() {
            let response = ResponseBuilder::new(480).to_tag(&self.local_tag).build_for_request(&request);
            if let Err(e) = ctx.respond(&key, response) {
                debug!("{}", e);
            }
            self.terminate(ctx, None);
            return;
        }
        match (self.role, self.state) {
            (_, SubscriptionState::Terminated) => {}
            (SubscriptionRole::Notifier, _) => {
                self.notify_queue.clear();
                if self.dialog.is_some() {
                    self.final_notify(ctx, "noresource");
                } else {
                    self.terminate(ctx, None);
                }
            }
            (SubscriptionRole::Subscriber, _) => {
                let waiting = self.pending.as_ref().map(|p| p.key.is_none()).unwrap_or(false);
                if self.pending.is_some() && !waiting {
                    // Un-SUBSCRIBE follows the pending response
                    return;
                }
                self.pending = None;
                if self.dialog.is_some() && !self.is_refer() {
                    if let Err(e) = self.send_subscribe(ctx, None, Purpose::Unsubscribe) {
                        debug!("Unsubscribe on destroy failed: {}", e);
                        self.terminate(ctx, None);
                    }
                } else {
                    self.terminate(ctx, None);
                }
            }
        }
    }

    /// Still using a dialog whose call is going away
    pub fn needs_dialog(&self, dialog: &DialogId) -> bool {
        self.shared_dialog
            && self.state != SubscriptionState::Terminated
            && self.dialog.as_ref() == Some(dialog)
    }

    /// Take over a dialog from the call that shared it
    pub fn adopt_dialog(&mut self, ctx: &mut EngineContext) {
        let Some(dialog) = &self.dialog else {
            return;
        };
        if let Some(entry) = ctx.dialogs.get_mut(dialog) {
            debug!("Subscription {} adopts dialog {}", self.id, dialog);
            entry.owner = self.id;
            self.shared_dialog = false;
        }
    }

    pub fn reclaim(&mut self, ctx: &mut EngineContext) {
        self.timers.stop_all(ctx);
        if !self.shared_dialog {
            ctx.dialogs.remove_owned_by(self.id);
        }
    }

    fn terminate(&mut self, ctx: &mut EngineContext, reason: Option<String>) {
        self.timers.stop_all(ctx);
        self.pending = None;
        self.notify_queue.clear();
        self.set_state(ctx, SubscriptionState::Terminated, reason);
    }

    fn forget_dialog(&mut self, ctx: &mut EngineContext) {
        if let Some(dialog) = self.dialog.take() {
            if !self.shared_dialog {
                ctx.dialogs.remove(&dialog);
            }
        }
    }

    fn set_state(&mut self, ctx: &mut EngineContext, state: SubscriptionState, reason: Option<String>) {
        if self.state == state {
            return;
        }
        info!("Subscription {} {} -> {}", self.id, self.state.name(), state.name());
        self.state = state;
        ctx.events
            .indicate(self.id, Indication::SubscriptionStateChanged { state, reason });
        if state == SubscriptionState::Terminated {
            ctx.defer(Deferred::CheckReclaim(self.id));
        }
    }

    fn require_role(&self, role: SubscriptionRole) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(EngineError::InvalidOperation(format!(
                "{} is a {:?}, not a {:?}",
                self.id, self.role, role
            )))
        }
    }

    // ----- timers -----

    fn arm_refresh(&mut self, ctx: &mut EngineContext, granted: u32) {
        if self.is_refer() {
            return;
        }
        let refresh = Duration::from_secs_f64(f64::from(granted) * self.refresh_ratio);
        debug!("Subscription {} granted {}s, refreshing in {:?}", self.id, granted, refresh);
        self.timers
            .start(ctx, self.id, HandleTimer::SubscriptionRefresh, refresh);
        self.timers.start(
            ctx,
            self.id,
            HandleTimer::SubscriptionExpiry,
            Duration::from_secs(u64::from(granted)),
        );
    }

    fn arm_expiry(&mut self, ctx: &mut EngineContext) {
        let duration = Duration::from_secs(u64::from(self.expires));
        self.expires_at = Some(ctx.now + duration);
        self.timers
            .start(ctx, self.id, HandleTimer::SubscriptionExpiry, duration);
    }

    pub fn on_timer(&mut self, ctx: &mut EngineContext, timer: HandleTimer, token: TimerToken) {
        if !self.timers.fired(timer, token) {
            return;
        }
        match (timer, self.role) {
            (HandleTimer::SubscriptionRefresh, SubscriptionRole::Subscriber) => {
                if self.pending.is_some() {
                    return;
                }
                let purpose = if self.dialog.is_some() {
                    Purpose::Refresh
                } else {
                    Purpose::Subscribe
                };
                if let Err(e) = self.send_subscribe(ctx, None, purpose) {
                    warn!("Refresh of {} failed: {}", self.id, e);
                }
            }
            (HandleTimer::SubscriptionExpiry, SubscriptionRole::Subscriber) => {
                warn!("Subscription {} expired without refresh", self.id);
                self.forget_dialog(ctx);
                self.terminate(ctx, Some("timeout".to_string()));
            }
            (HandleTimer::SubscriptionExpiry, SubscriptionRole::Notifier) => {
                info!("Subscription {} expired", self.id);
                self.final_notify(ctx, "timeout");
            }
            _ => debug!("Subscription {} ignores {:?}", self.id, timer),
        }
    }
}

fn result_kind(purpose: Purpose) -> OperationKind {
    match purpose {
        Purpose::Subscribe | Purpose::Refresh => OperationKind::Subscribe,
        Purpose::Unsubscribe => OperationKind::Unsubscribe,
        Purpose::Refer => OperationKind::Refer,
    }
}

fn dialog_request(ctx: &mut EngineContext, dialog: &DialogId, method: SipMethod) -> Result<(SipRequest, Destination)> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_header() {
        assert_eq!(SubscriptionState::from(SubState::Active), SubscriptionState::Active);
        assert_eq!(SubscriptionState::from(SubState::Terminated), SubscriptionState::Terminated);
        assert_eq!(SubscriptionState::Embryonic.name(), "Embryonic");
    }

    #[test]
    fn test_notify_options() {
        let options = NotifyOptions::terminated("deactivated").with_retry_after(5);
        assert_eq!(options.state, SubState::Terminated);
        assert_eq!(options.reason.as_deref(), Some("deactivated"));
        assert_eq!(options.retry_after, Some(5));
        assert_eq!(NotifyOptions::active().state, SubState::Active);
    }

    #[test]
    fn test_result_kinds() {
        assert_eq!(result_kind(Purpose::Refresh), OperationKind::Subscribe);
        assert_eq!(result_kind(Purpose::Unsubscribe), OperationKind::Unsubscribe);
        assert_eq!(result_kind(Purpose::Refer), OperationKind::Refer);
    }

    #[test]
    fn test_option_builders() {
        let sub = SubscriptionOptions::new("sip:bob@example.com", "presence").with_expires(600);
        assert_eq!(sub.expires, Some(600));
        let refer = ReferOptions::new("sip:carol@example.com").with_referred_by("<sip:alice@example.com>");
        assert!(refer.referred_by.is_some());
    }
}
