//! Registration client
//!
//! Keeps one address-of-record bound at a registrar: refreshes before the
//! granted expiry, answers digest challenges, corrects its Contact when the
//! registrar sees us behind a NAT, and keeps that binding open with
//! OPTIONS keep-alives.

use super::auth::{AuthManager, Credential};
use super::builder::RequestBuilder;
use super::context::{ChallengeOutcome, Deferred, EngineContext, HandleTimer, HandleTimers, TransactionEvent, TransactionEventKind};
use super::events::{Indication, OperationKind};
use super::headers::{parse_delta_seconds, uri_host_port, uri_param, uri_user, NameAddr};
use super::message::{SipMethod, SipRequest, SipResponse};
use super::rport::public_address_from_via;
use super::timer::TimerToken;
use super::transaction::TransactionKey;
use super::transport::Destination;
use crate::config::RegistrationConfig;
use crate::domain::shared::{EngineError, HandleId, OperationId, Result, Status};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registration State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Unregistered,
    /// First REGISTER in flight
    Registering,
    /// Waiting for credentials or for the credentialed retry
    Authenticating,
    Registered,
    /// Refresh REGISTER in flight while still bound
    Refreshing,
    Unregistering,
}

impl RegistrationState {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "Unregistered",
            RegistrationState::Registering => "Registering",
            RegistrationState::Authenticating => "Authenticating",
            RegistrationState::Registered => "Registered",
            RegistrationState::Refreshing => "Refreshing",
            RegistrationState::Unregistering => "Unregistering",
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, RegistrationState::Registered | RegistrationState::Refreshing)
    }
}

/// Where and what to register
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Registrar URI, also the Request-URI
    pub registrar: String,
    /// Address of record placed in From and To
    pub aor: String,
    /// User part of our Contact; defaults to the AOR user
    pub contact_user: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RegistrationOptions {
    pub fn new(registrar: impl Into<String>, aor: impl Into<String>) -> Self {
        Self {
            registrar: registrar.into(),
            aor: aor.into(),
            ..Default::default()
        }
    }

    pub fn with_contact_user(mut self, user: impl Into<String>) -> Self {
        self.contact_user = Some(user.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Per-registration tunables, seeded from [`RegistrationConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationParameters {
    pub expires: u32,
    pub refresh_ratio: f64,
    pub keepalive_interval_secs: u32,
    pub keepalive_max_failures: u32,
    pub nat_detection: bool,
    pub retry_interval_secs: u32,
}

impl From<&RegistrationConfig> for RegistrationParameters {
    fn from(config: &RegistrationConfig) -> Self {
        Self {
            expires: config.expires,
            refresh_ratio: config.refresh_ratio,
            keepalive_interval_secs: config.keepalive_interval_secs,
            keepalive_max_failures: config.keepalive_max_failures,
            nat_detection: config.nat_detection,
            retry_interval_secs: config.retry_interval_secs,
        }
    }
}

impl RegistrationParameters {
    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_keepalive(mut self, interval_secs: u32, max_failures: u32) -> Self {
        self.keepalive_interval_secs = interval_secs;
        self.keepalive_max_failures = max_failures;
        self
    }

    pub fn with_nat_detection(mut self, enabled: bool) -> Self {
        self.nat_detection = enabled;
        self
    }

    pub fn with_retry_interval(mut self, seconds: u32) -> Self {
        self.retry_interval_secs = seconds;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Register,
    Refresh,
    Unregister,
}

/// REGISTER waiting for its final response
#[derive(Debug, Clone)]
struct PendingRegister {
    key: Option<TransactionKey>,
    request: SipRequest,
    operation: Option<OperationId>,
    purpose: Purpose,
    /// Second round removing the stale Contact
    rebinding: bool,
    interval_retried: bool,
    challenge: Option<SipResponse>,
}

/// Registration handle
pub struct Registration {
    id: HandleId,
    state: RegistrationState,
    options: RegistrationOptions,
    params: RegistrationParameters,
    call_id: String,
    local_tag: String,
    cseq: u32,
    /// Contact we register
    contact: NameAddr,
    /// Contact the registrar still holds after a NAT rebinding
    stale_contact: Option<NameAddr>,
    pending: Option<PendingRegister>,
    keepalive: Option<TransactionKey>,
    keepalive_failures: u32,
    nat_detected: bool,
    granted: Option<u32>,
    timers: HandleTimers,
    auth: AuthManager,
    zombie: bool,
}

impl Registration {
    pub fn new(ctx: &mut EngineContext, id: HandleId, options: RegistrationOptions) -> Self {
        let user = options
            .contact_user
            .clone()
            .or_else(|| uri_user(&options.aor))
            .unwrap_or_else(|| ctx.local.user.clone());
        Self {
            id,
            state: RegistrationState::Unregistered,
            contact: ctx.local.contact(Some(&user)),
            options,
            params: RegistrationParameters::from(&ctx.config.registration),
            call_id: ctx.new_call_id(),
            local_tag: ctx.new_tag(),
            cseq: 0,
            stale_contact: None,
            pending: None,
            keepalive: None,
            keepalive_failures: 0,
            nat_detected: false,
            granted: None,
            timers: HandleTimers::default(),
            auth: AuthManager::new(ctx.config.auth.max_retries),
            zombie: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn parameters(&self) -> &RegistrationParameters {
        &self.params
    }

    /// Contact currently registered (or being registered)
    pub fn contact(&self) -> &NameAddr {
        &self.contact
    }

    /// Expiry the registrar granted on the last successful REGISTER
    pub fn granted_expires(&self) -> Option<u32> {
        self.granted
    }

    pub fn nat_detected(&self) -> bool {
        self.nat_detected
    }

    pub fn is_reclaimable(&self, ctx: &EngineContext) -> bool {
        self.zombie
            && self.pending.is_none()
            && !self.state.is_bound()
            && ctx.transactions.owned_by(self.id).is_empty()
    }

    fn registrar(&self, ctx: &EngineContext) -> Result<Destination> {
        ctx.route_for(&self.options.registrar).ok_or_else(|| {
            EngineError::InvalidOperation(format!("Unroutable registrar {}", self.options.registrar))
        })
    }

    // ----- operations -----

    pub fn register(&mut self, ctx: &mut EngineContext, operation: OperationId) -> Result<()> {
        if self.pending.is_some() {
            return Err(EngineError::InvalidState(format!(
                "REGISTER already in progress on {} ({})",
                self.id,
                self.state.name()
            )));
        }
        let purpose = if self.state.is_bound() {
            Purpose::Refresh
        } else {
            Purpose::Register
        };
        self.send_register(ctx, Some(operation), purpose, false)
    }

    pub fn unregister(&mut self, ctx: &mut EngineContext, operation: OperationId) -> Result<()> {
        if self.state == RegistrationState::Unregistered && self.pending.is_none() {
            return Err(EngineError::InvalidState(format!("{} is not registered", self.id)));
        }
        if self.state == RegistrationState::Unregistering {
            return Err(EngineError::InvalidState("Unregister already in progress".to_string()));
        }
        self.abandon_pending(ctx);
        self.send_register(ctx, Some(operation), Purpose::Unregister, false)
    }

    /// Store new parameters; a changed expiry while bound is pushed to the registrar
    pub fn set_parameters(&mut self, ctx: &mut EngineContext, operation: OperationId, params: RegistrationParameters) {
        if params != self.params {
            let expires_changed = params.expires != self.params.expires;
            self.params = params;
            info!("Registration {} parameters updated", self.id);
            if expires_changed && self.state == RegistrationState::Registered && self.pending.is_none() {
                if let Err(e) = self.send_register(ctx, None, Purpose::Refresh, false) {
                    warn!("Refresh after parameter change failed: {}", e);
                }
            }
            if self.params.keepalive_interval_secs == 0 {
                self.timers.stop(ctx, HandleTimer::KeepAlive);
            }
        }
        ctx.events
            .result(self.id, operation, OperationKind::SetParameters, Status::ok(), true);
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

    pub fn destroy(&mut self, ctx: &mut EngineContext) {
        self.zombie = true;
        self.timers.stop_all(ctx);
        let waiting = self.pending.as_ref().map(|p| p.key.is_none()).unwrap_or(false);
        if waiting {
            self.pending = None;
            self.set_state(ctx, RegistrationState::Unregistered, None);
        }
        if self.state.is_bound() && self.pending.is_none() {
            info!("Removing binding of destroyed registration {}", self.id);
            if let Err(e) = self.send_register(ctx, None, Purpose::Unregister, false) {
                warn!("Unregister on destroy failed: {}", e);
                self.state = RegistrationState::Unregistered;
            }
        }
    }

    pub fn reclaim(&mut self, ctx: &mut EngineContext) {
        self.timers.stop_all(ctx);
    }

    /// The transport lost its connection towards `destination`
    pub fn connection_closed(&mut self, ctx: &mut EngineContext, destination: &Destination) {
        if self.zombie || !self.state.is_bound() || self.pending.is_some() {
            return;
        }
        if self.registrar(ctx).ok().as_ref() != Some(destination) {
            return;
        }
        info!("Connection to registrar closed, re-registering {}", self.id);
        self.timers.stop(ctx, HandleTimer::KeepAlive);
        self.keepalive = None;
        if let Err(e) = self.send_register(ctx, None, Purpose::Refresh, false) {
            warn!("Re-registration of {} failed: {}", self.id, e);
        }
    }

    // ----- REGISTER construction -----

    fn build_register(&mut self, ctx: &EngineContext, purpose: Purpose, rebinding: bool) -> SipRequest {
        self.cseq += 1;
        let aor = NameAddr::new(self.options.aor.clone());
        let mut builder = RequestBuilder::new(SipMethod::Register, self.options.registrar.clone())
            .via(&ctx.via())
            .max_forwards(70)
            .route_set(&ctx.outbound_route())
            .from(&aor.clone().with_tag(&self.local_tag))
            .to(&aor)
            .call_id(&self.call_id)
            .cseq(self.cseq);

        let expires = if purpose == Purpose::Unregister { 0 } else { self.params.expires };
        let mut contact = self.contact.clone();
        contact.set_param("expires", Some(&expires.to_string()));
        builder = builder
            .header("Contact", contact.to_string())
            .header("Expires", expires.to_string());
        if rebinding {
            if let Some(stale) = &self.stale_contact {
                let mut stale = stale.clone();
                stale.set_param("expires", Some("0"));
                builder = builder.header("Contact", stale.to_string());
            }
        }
        for (name, value) in &self.options.headers {
            builder = builder.header(name, value.clone());
        }
        builder.build()
    }

    fn send_register(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, purpose: Purpose, rebinding: bool) -> Result<()> {
        let destination = self.registrar(ctx)?;
        let request = self.build_register(ctx, purpose, rebinding);
        let key = ctx.send_request(request.clone(), destination, Some(self.id))?;
        debug!("REGISTER {:?} for {} sent (CSeq {})", purpose, self.id, self.cseq);
        let interval_retried = self.pending.as_ref().map(|p| p.interval_retried).unwrap_or(false);
        self.pending = Some(PendingRegister {
            key: Some(key),
            request,
            operation,
            purpose,
            rebinding,
            interval_retried,
            challenge: None,
        });
        let state = match purpose {
            Purpose::Register => RegistrationState::Registering,
            Purpose::Refresh if self.state.is_bound() => RegistrationState::Refreshing,
            Purpose::Refresh => RegistrationState::Registering,
            Purpose::Unregister => RegistrationState::Unregistering,
        };
        self.set_state(ctx, state, None);
        Ok(())
    }

    /// Drop an outstanding REGISTER; its response is ignored from now on
    fn abandon_pending(&mut self, ctx: &mut EngineContext) {
        self.timers.stop(ctx, HandleTimer::RegistrationRefresh);
        self.timers.stop(ctx, HandleTimer::RegistrationRetry);
        self.timers.stop(ctx, HandleTimer::KeepAlive);
        if let Some(pending) = self.pending.take() {
            if let Some(operation) = pending.operation {
                ctx.events.result(
                    self.id,
                    operation,
                    result_kind(pending.purpose),
                    Status::local_cancelled(),
                    true,
                );
            }
        }
    }

    fn set_state(&mut self, ctx: &mut EngineContext, state: RegistrationState, status: Option<Status>) {
        if self.state == state {
            return;
        }
        info!("Registration {} {} -> {}", self.id, self.state.name(), state.name());
        self.state = state;
        ctx.events
            .indicate(self.id, Indication::RegistrationStateChanged { state, status });
        if state == RegistrationState::Unregistered && self.zombie {
            ctx.defer(Deferred::CheckReclaim(self.id));
        }
    }

    // ----- responses -----

    pub fn on_transaction_event(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        if self.keepalive.as_ref() == Some(&event.key) {
            self.on_keepalive_event(ctx, event);
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

        if pending.purpose == Purpose::Unregister {
            self.timers.stop_all(ctx);
            self.keepalive = None;
            self.granted = None;
            if let Some(operation) = pending.operation {
                ctx.events
                    .result(self.id, operation, OperationKind::Unregister, status.clone(), true);
            }
            self.set_state(ctx, RegistrationState::Unregistered, Some(status));
            return;
        }

        // A destroyed registration goes straight to removing its binding
        if !pending.rebinding && !self.zombie && self.params.nat_detection {
            if let Some(public) = self.public_contact(&response) {
                info!(
                    "Registrar sees {} at {}, re-registering with corrected Contact",
                    self.id, public.uri
                );
                self.stale_contact = Some(std::mem::replace(&mut self.contact, public));
                self.nat_detected = true;
                if let Some(operation) = pending.operation {
                    ctx.events.result(
                        self.id,
                        operation,
                        result_kind(pending.purpose),
                        Status::local(100, "Updating Contact"),
                        false,
                    );
                }
                let public_address = self.contact.uri.clone();
                ctx.events
                    .indicate(self.id, Indication::NatBindingChanged { public_address });
                if let Err(e) = self.send_register(ctx, pending.operation, pending.purpose, true) {
                    warn!("Second REGISTER for {} failed: {}", self.id, e);
                    self.fail(ctx, pending.operation, pending.purpose, Status::local(500, e.to_string()));
                }
                return;
            }
        }

        self.stale_contact = None;
        let granted = self.granted_from(&response);
        self.granted = Some(granted);
        let refresh = Duration::from_secs_f64(f64::from(granted) * self.params.refresh_ratio);
        info!("Registration {} bound for {}s, refreshing in {:?}", self.id, granted, refresh);
        self.timers.stop(ctx, HandleTimer::RegistrationRetry);
        if granted > 0 {
            self.timers
                .start(ctx, self.id, HandleTimer::RegistrationRefresh, refresh);
        }
        if let Some(operation) = pending.operation {
            ctx.events
                .result(self.id, operation, result_kind(pending.purpose), status.clone(), true);
        }
        self.set_state(ctx, RegistrationState::Registered, Some(status));

        if self.nat_detected && self.params.keepalive_interval_secs > 0 && !self.timers.is_running(HandleTimer::KeepAlive) {
            self.keepalive_failures = 0;
            self.timers.start(
                ctx,
                self.id,
                HandleTimer::KeepAlive,
                Duration::from_secs(u64::from(self.params.keepalive_interval_secs)),
            );
        }

        if self.zombie {
            if let Err(e) = self.send_register(ctx, None, Purpose::Unregister, false) {
                warn!("Unregister of destroyed {} failed: {}", self.id, e);
            }
        }
    }

    /// Contact at the address the registrar observed, when it differs from ours
    fn public_contact(&self, response: &SipResponse) -> Option<NameAddr> {
        let via = response.top_via()?;
        let (host, port) = public_address_from_via(&via)?;
        let (our_host, our_port) = uri_host_port(&self.contact.uri)?;
        let our_port = our_port.unwrap_or(5060);
        if host == our_host && port == our_port {
            return None;
        }
        let mut uri = match uri_user(&self.contact.uri) {
            Some(user) => format!("sip:{}@{}:{}", user, host, port),
            None => format!("sip:{}:{}", host, port),
        };
        if let Some(Some(transport)) = uri_param(&self.contact.uri, "transport") {
            uri.push_str(&format!(";transport={}", transport));
        }
        Some(NameAddr::new(uri))
    }

    /// Expiry granted for our Contact: its expires parameter, then Expires, then what we asked
    fn granted_from(&self, response: &SipResponse) -> u32 {
        let from_contact = response
            .headers
            .values("Contact")
            .iter()
            .filter_map(|v| NameAddr::parse(v))
            .find(|c| c.uri == self.contact.uri)
            .and_then(|c| c.param("expires").and_then(|e| e.parse().ok()));
        from_contact
            .or_else(|| response.headers.get("Expires").and_then(parse_delta_seconds))
            .unwrap_or(self.params.expires)
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
                let min = response.headers.get("Min-Expires").and_then(parse_delta_seconds);
                if let Some(min) = min.filter(|m| *m > self.params.expires) {
                    info!("Registrar wants at least {}s, retrying {}", min, self.id);
                    self.params.expires = min;
                    if let Some(pending) = self.pending.as_mut() {
                        pending.interval_retried = true;
                    }
                    if let Err(e) = self.send_register(ctx, pending.operation, pending.purpose, pending.rebinding) {
                        warn!("REGISTER retry failed: {}", e);
                    } else {
                        return;
                    }
                }
            }
        }
        self.fail(ctx, pending.operation, pending.purpose, status);
    }

    fn fail(&mut self, ctx: &mut EngineContext, operation: Option<OperationId>, purpose: Purpose, status: Status) {
        warn!("Registration {} failed: {}", self.id, status);
        self.pending = None;
        self.granted = None;
        self.timers.stop(ctx, HandleTimer::RegistrationRefresh);
        self.timers.stop(ctx, HandleTimer::KeepAlive);
        self.keepalive = None;
        if let Some(operation) = operation {
            ctx.events
                .result(self.id, operation, result_kind(purpose), status.clone(), true);
        }
        self.set_state(ctx, RegistrationState::Unregistered, Some(status));
        if purpose != Purpose::Unregister && !self.zombie && self.params.retry_interval_secs > 0 {
            let delay = Duration::from_secs(u64::from(self.params.retry_interval_secs));
            info!("Retrying registration {} in {:?}", self.id, delay);
            self.timers
                .start(ctx, self.id, HandleTimer::RegistrationRetry, delay);
        }
    }

    fn answer_challenge(&mut self, ctx: &mut EngineContext, request: &SipRequest, response: &SipResponse) {
        let Some(pending) = self.pending.clone() else {
            return;
        };
        let destination = match self.registrar(ctx) {
            Ok(destination) => destination,
            Err(e) => {
                self.fail(ctx, pending.operation, pending.purpose, Status::local(500, e.to_string()));
                return;
            }
        };
        let status = Status::remote(response.status, response.reason.clone());
        self.cseq += 1;
        match ctx.answer_challenge(&mut self.auth, request, response, self.cseq, destination, self.id) {
            ChallengeOutcome::Resent { key, request } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.key = Some(key);
                    pending.request = request;
                }
                if let Some(operation) = pending.operation {
                    ctx.events
                        .result(self.id, operation, result_kind(pending.purpose), status, false);
                }
                if pending.purpose != Purpose::Unregister {
                    self.set_state(ctx, RegistrationState::Authenticating, None);
                }
            }
            ChallengeOutcome::NeedCredentials { realm } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.key = None;
                    pending.request = request.clone();
                    pending.challenge = Some(response.clone());
                }
                if let Some(operation) = pending.operation {
                    ctx.events
                        .result(self.id, operation, result_kind(pending.purpose), status, false);
                }
                self.set_state(ctx, RegistrationState::Authenticating, None);
                ctx.events
                    .indicate(self.id, Indication::AuthenticationRequired { realm });
            }
            ChallengeOutcome::Failed => self.fail(ctx, pending.operation, pending.purpose, status),
        }
    }

    // ----- keep-alive -----

    fn send_keepalive(&mut self, ctx: &mut EngineContext) {
        let destination = match self.registrar(ctx) {
            Ok(destination) => destination,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        let from = NameAddr::new(self.options.aor.clone()).with_tag(&ctx.new_tag());
        let request = RequestBuilder::new(SipMethod::Options, self.options.registrar.clone())
            .via(&ctx.via())
            .max_forwards(70)
            .from(&from)
            .to(&NameAddr::new(self.options.registrar.clone()))
            .call_id(&ctx.new_call_id())
            .cseq(1)
            .build();
        match ctx.send_request(request, destination, Some(self.id)) {
            Ok(key) => self.keepalive = Some(key),
            Err(e) => warn!("Keep-alive for {} not sent: {}", self.id, e),
        }
    }

    fn on_keepalive_event(&mut self, ctx: &mut EngineContext, event: TransactionEvent) {
        let healthy = match &event.kind {
            TransactionEventKind::Response(r) if r.is_provisional() => return,
            TransactionEventKind::Response(r) => r.status != 401 && r.status != 407,
            TransactionEventKind::Failed(_) => false,
            TransactionEventKind::CancelReleased | TransactionEventKind::Terminated => return,
        };
        self.keepalive = None;
        if healthy {
            self.keepalive_failures = 0;
        } else {
            self.keepalive_failures += 1;
            warn!(
                "Keep-alive for {} failed ({}/{})",
                self.id, self.keepalive_failures, self.params.keepalive_max_failures
            );
            if self.state.is_bound() && self.pending.is_none() {
                self.rebind(ctx);
            }
        }
        if self.state.is_bound() || self.pending.is_some() {
            let interval = Duration::from_secs(u64::from(self.params.keepalive_interval_secs));
            self.timers.start(ctx, self.id, HandleTimer::KeepAlive, interval);
        }
    }

    /// The binding may be gone; re-register, over a fresh connection once
    /// failures reach the limit
    fn rebind(&mut self, ctx: &mut EngineContext) {
        if self.keepalive_failures >= self.params.keepalive_max_failures {
            if let Ok(destination) = self.registrar(ctx) {
                ctx.reset_connection(destination);
            }
            self.keepalive_failures = 0;
            self.nat_detected = false;
            let user = uri_user(&self.contact.uri);
            self.contact = ctx.local.contact(user.as_deref());
            self.stale_contact = None;
        }
        if let Err(e) = self.send_register(ctx, None, Purpose::Refresh, false) {
            warn!("Re-registration of {} failed: {}", self.id, e);
        }
    }

    // ----- timers -----

    pub fn on_timer(&mut self, ctx: &mut EngineContext, timer: HandleTimer, token: TimerToken) {
        if !self.timers.fired(timer, token) {
            return;
        }
        match timer {
            HandleTimer::RegistrationRefresh => {
                if self.pending.is_none() && self.state.is_bound() {
                    if let Err(e) = self.send_register(ctx, None, Purpose::Refresh, false) {
                        warn!("Refresh of {} failed: {}", self.id, e);
                    }
                }
            }
            HandleTimer::RegistrationRetry => {
                if self.pending.is_none() && self.state == RegistrationState::Unregistered {
                    if let Err(e) = self.send_register(ctx, None, Purpose::Register, false) {
                        warn!("Registration retry of {} failed: {}", self.id, e);
                    }
                }
            }
            HandleTimer::KeepAlive => {
                if self.keepalive.is_none() && self.state.is_bound() {
                    self.send_keepalive(ctx);
                }
            }
            _ => debug!("Registration {} ignores {:?}", self.id, timer),
        }
    }
}

fn result_kind(purpose: Purpose) -> OperationKind {
    match purpose {
        Purpose::Register | Purpose::Refresh => OperationKind::Register,
        Purpose::Unregister => OperationKind::Unregister,
    }
}
