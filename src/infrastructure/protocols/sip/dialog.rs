//! SIP Dialog Store (RFC 3261 Section 12)
//!
//! Dialogs are keyed by Call-ID plus local and remote tag. Each one keeps a
//! back-reference to its owning handle by index only; removing the handle
//! never leaves a dangling dialog because the engine sweeps
//! [`DialogStore::remove_owned_by`] when the handle is reclaimed.

use super::headers::{uri_param, CSeq, NameAddr, Via};
use super::message::{SipMethod, SipRequest, SipResponse};
use super::transport::{Destination, TransportProtocol};
use crate::domain::shared::HandleId;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Dialog identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        }
    }

    /// Dialog an incoming request belongs to (To carries our tag)
    pub fn for_incoming_request(request: &SipRequest) -> Option<Self> {
        Some(Self::new(
            request.call_id()?,
            &request.to_tag()?,
            &request.from_tag()?,
        ))
    }

    /// Dialog a response to one of our requests belongs to
    pub fn for_response(response: &SipResponse) -> Option<Self> {
        Some(Self::new(
            response.call_id()?,
            &response.from_tag()?,
            &response.to_tag()?,
        ))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Dialog state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Created by a provisional response carrying a To tag
    Early,
    /// Created or promoted by a 2xx
    Confirmed,
}

/// Outcome of checking the CSeq of an incoming in-dialog request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCSeq {
    Accepted,
    /// Lower than or equal to the last seen value; answer 500
    OutOfOrder,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub owner: HandleId,
    /// We sent the request that created the dialog
    pub is_uac: bool,
    /// Our party, with our tag
    pub local_uri: NameAddr,
    /// Peer party, with its tag
    pub remote_uri: NameAddr,
    /// Our Contact
    pub local_contact: NameAddr,
    /// Peer Contact URI (the Request-URI of in-dialog requests)
    pub remote_target: String,
    /// Route set, in the order requests must visit it
    pub route_set: Vec<String>,
    pub local_cseq: u32,
    pub remote_cseq: Option<u32>,
}

impl Dialog {
    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }

    /// Next hop for in-dialog requests
    pub fn next_hop(&self, default_protocol: TransportProtocol) -> Option<Destination> {
        match self.route_set.first() {
            Some(route) => Destination::from_uri(&route_uri(route), default_protocol),
            None => Destination::from_uri(&self.remote_target, default_protocol),
        }
    }

    fn uses_strict_routing(&self) -> bool {
        self.route_set
            .first()
            .map(|route| uri_param(&route_uri(route), "lr").is_none())
            .unwrap_or(false)
    }

    /// Build an in-dialog request from the dialog's current state.
    ///
    /// The CSeq is supplied by the caller so that ACK and CANCEL can reuse
    /// the INVITE number; everything else uses [`DialogStore::next_cseq`].
    pub fn request(&self, method: SipMethod, via: &Via, cseq: u32) -> SipRequest {
        // Strict routing (RFC 3261 12.2.1.1): first route becomes the R-URI
        let (uri, routes) = if self.uses_strict_routing() {
            let mut routes: Vec<String> = self.route_set[1..].to_vec();
            routes.push(format!("<{}>", self.remote_target));
            (route_uri(&self.route_set[0]), routes)
        } else {
            (self.remote_target.clone(), self.route_set.clone())
        };

        let mut request = SipRequest::new(method, uri);
        request.headers.push("Via", via.to_string());
        request.headers.push("Max-Forwards", "70");
        for route in routes {
            request.headers.push("Route", route);
        }
        request.headers.push("From", self.local_uri.to_string());
        request.headers.push("To", self.remote_uri.to_string());
        request.headers.push("Call-ID", self.id.call_id.clone());
        request.headers.push("CSeq", CSeq::new(cseq, method).to_string());
        if method != SipMethod::Ack && method != SipMethod::Cancel {
            request.headers.push("Contact", self.local_contact.to_string());
        }
        request
    }
}

/// URI inside a Route/Record-Route value
fn route_uri(route: &str) -> String {
    NameAddr::parse(route)
        .map(|addr| addr.uri)
        .unwrap_or_else(|| route.trim().to_string())
}

fn contact_uri(headers_contact: Option<&str>) -> Option<String> {
    headers_contact.and_then(NameAddr::parse).map(|c| c.uri)
}

/// All dialogs of one engine instance
#[derive(Debug, Default)]
pub struct DialogStore {
    dialogs: HashMap<DialogId, Dialog>,
}

impl DialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Dialog created by a response to our request (UAC side).
    ///
    /// Returns the existing dialog when the tags are already known; a
    /// response without a To tag creates nothing.
    pub fn create_uac(
        &mut self,
        request: &SipRequest,
        response: &SipResponse,
        owner: HandleId,
    ) -> Option<DialogId> {
        let id = DialogId::for_response(response)?;
        if self.dialogs.contains_key(&id) {
            return Some(id);
        }

        let state = if response.is_success() {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };
        let mut route_set: Vec<String> = response.headers.values("Record-Route");
        route_set.reverse();

        let dialog = Dialog {
            id: id.clone(),
            state,
            owner,
            is_uac: true,
            local_uri: request.from()?,
            remote_uri: response.to()?,
            local_contact: request
                .headers
                .get("Contact")
                .and_then(NameAddr::parse)
                .unwrap_or_else(|| NameAddr::new(request.uri.clone())),
            remote_target: contact_uri(response.headers.values("Contact").first().map(String::as_str))
                .unwrap_or_else(|| request.uri.clone()),
            route_set,
            local_cseq: request.cseq().map(|c| c.seq).unwrap_or(1),
            remote_cseq: None,
        };

        info!("Created {:?} UAC dialog {} for {}", state, id, owner);
        self.dialogs.insert(id.clone(), dialog);
        Some(id)
    }

    /// Dialog created by a NOTIFY that overtook the 2xx to our SUBSCRIBE
    /// (RFC 6665 4.1.2.4). The NOTIFY's Record-Route is already in the
    /// order our requests must follow.
    pub fn create_uac_from_request(
        &mut self,
        subscribe: &SipRequest,
        notify: &SipRequest,
        owner: HandleId,
    ) -> Option<DialogId> {
        let id = DialogId::for_incoming_request(notify)?;
        if self.dialogs.contains_key(&id) {
            return Some(id);
        }

        let dialog = Dialog {
            id: id.clone(),
            state: DialogState::Confirmed,
            owner,
            is_uac: true,
            local_uri: subscribe.from()?,
            remote_uri: notify.from()?,
            local_contact: subscribe
                .headers
                .get("Contact")
                .and_then(NameAddr::parse)
                .unwrap_or_else(|| NameAddr::new(subscribe.uri.clone())),
            remote_target: contact_uri(notify.headers.values("Contact").first().map(String::as_str))?,
            route_set: notify.headers.values("Record-Route"),
            local_cseq: subscribe.cseq().map(|c| c.seq).unwrap_or(1),
            remote_cseq: notify.cseq().map(|c| c.seq),
        };

        info!("Created UAC dialog {} from NOTIFY for {}", id, owner);
        self.dialogs.insert(id.clone(), dialog);
        Some(id)
    }

    /// Dialog created by an incoming request we are about to answer (UAS side)
    pub fn create_uas(
        &mut self,
        request: &SipRequest,
        local_tag: &str,
        local_contact: NameAddr,
        owner: HandleId,
    ) -> Option<DialogId> {
        let remote_tag = request.from_tag()?;
        let id = DialogId::new(request.call_id()?, local_tag, &remote_tag);
        if self.dialogs.contains_key(&id) {
            return Some(id);
        }

        let mut local_uri = request.to()?;
        local_uri.set_param("tag", Some(local_tag));

        let dialog = Dialog {
            id: id.clone(),
            state: DialogState::Early,
            owner,
            is_uac: false,
            local_uri,
            remote_uri: request.from()?,
            local_contact,
            remote_target: contact_uri(request.headers.values("Contact").first().map(String::as_str))?,
            route_set: request.headers.values("Record-Route"),
            local_cseq: 0,
            remote_cseq: request.cseq().map(|c| c.seq),
        };

        info!("Created UAS dialog {} for {}", id, owner);
        self.dialogs.insert(id.clone(), dialog);
        Some(id)
    }

    pub fn get(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    pub fn get_mut(&mut self, id: &DialogId) -> Option<&mut Dialog> {
        self.dialogs.get_mut(id)
    }

    pub fn lookup(&self, call_id: &str, local_tag: &str, remote_tag: &str) -> Option<&Dialog> {
        self.dialogs.get(&DialogId::new(call_id, local_tag, remote_tag))
    }

    /// Every dialog sharing a Call-ID (forked branches of one call)
    pub fn lookup_by_call_id(&self, call_id: &str) -> Vec<&Dialog> {
        self.dialogs
            .values()
            .filter(|d| d.id.call_id == call_id)
            .collect()
    }

    /// Promote an early dialog after a 2xx
    pub fn confirm(&mut self, id: &DialogId) {
        if let Some(dialog) = self.dialogs.get_mut(id) {
            if dialog.state == DialogState::Early {
                debug!("Dialog {} confirmed", id);
            }
            dialog.state = DialogState::Confirmed;
        }
    }

    /// Replace the route set from a response's Record-Route.
    ///
    /// The set is only replaced when the response carries Record-Route, so a
    /// 200 that omits it keeps the route learned from an earlier 1xx.
    pub fn apply_route_set(&mut self, id: &DialogId, response: &SipResponse) {
        let Some(dialog) = self.dialogs.get_mut(id) else {
            return;
        };
        let mut routes = response.headers.values("Record-Route");
        if routes.is_empty() {
            return;
        }
        if dialog.is_uac {
            routes.reverse();
        }
        if routes != dialog.route_set {
            debug!("Dialog {} route set replaced: {:?}", id, routes);
            dialog.route_set = routes;
        }
    }

    /// Replace the remote target from the Contact of a target refresh
    pub fn refresh_target(&mut self, id: &DialogId, contact: Option<&str>) {
        let Some(uri) = contact_uri(contact) else {
            return;
        };
        if let Some(dialog) = self.dialogs.get_mut(id) {
            if dialog.remote_target != uri {
                debug!("Dialog {} remote target {} -> {}", id, dialog.remote_target, uri);
                dialog.remote_target = uri;
            }
        }
    }

    /// Allocate the next local CSeq
    pub fn next_cseq(&mut self, id: &DialogId) -> Option<u32> {
        let dialog = self.dialogs.get_mut(id)?;
        dialog.local_cseq += 1;
        Some(dialog.local_cseq)
    }

    /// Build the next in-dialog request with a fresh CSeq
    pub fn build_request(&mut self, id: &DialogId, method: SipMethod, via: &Via) -> Option<SipRequest> {
        let cseq = self.next_cseq(id)?;
        self.dialogs.get(id).map(|d| d.request(method, via, cseq))
    }

    /// Check and record the CSeq of an incoming in-dialog request
    pub fn check_remote_cseq(&mut self, id: &DialogId, request: &SipRequest) -> RemoteCSeq {
        let Some(dialog) = self.dialogs.get_mut(id) else {
            return RemoteCSeq::Accepted;
        };
        let Some(cseq) = request.cseq() else {
            return RemoteCSeq::OutOfOrder;
        };
        // ACK and CANCEL reuse the number of the request they refer to
        if matches!(request.method, SipMethod::Ack | SipMethod::Cancel) {
            return RemoteCSeq::Accepted;
        }
        match dialog.remote_cseq {
            Some(last) if cseq.seq <= last => {
                warn!("Dialog {} got CSeq {} after {}", id, cseq.seq, last);
                RemoteCSeq::OutOfOrder
            }
            _ => {
                dialog.remote_cseq = Some(cseq.seq);
                RemoteCSeq::Accepted
            }
        }
    }

    pub fn remove(&mut self, id: &DialogId) -> Option<Dialog> {
        let removed = self.dialogs.remove(id);
        if removed.is_some() {
            info!("Dialog {} removed", id);
        }
        removed
    }

    /// Drop every dialog still pointing at a reclaimed handle
    pub fn remove_owned_by(&mut self, owner: HandleId) -> usize {
        let before = self.dialogs.len();
        self.dialogs.retain(|_, d| d.owner != owner);
        before - self.dialogs.len()
    }
}
