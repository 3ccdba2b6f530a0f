//! Offer/answer sequencing (RFC 3264, RFC 6337)
//!
//! The engine never looks inside a session description. It asks an
//! [`OfferAnswer`] collaborator for bodies and tells it what the peer sent,
//! and it keeps at most one offer/answer exchange open per call.

use super::message::Body;
use crate::domain::shared::HandleId;
use std::collections::HashMap;
use tracing::debug;

/// Session description negotiator
#[cfg_attr(test, mockall::automock)]
pub trait OfferAnswer: Send {
    /// Local offer for a new exchange
    fn generate_offer(&mut self, handle: HandleId) -> Option<Body>;

    /// Peer offer; returns false when it is unacceptable (answer 488)
    fn set_remote_offer(&mut self, handle: HandleId, offer: &Body) -> bool;

    /// Answer to the last remote offer
    fn generate_answer(&mut self, handle: HandleId) -> Option<Body>;

    /// Peer answer to our offer; returns false when it cannot be applied
    fn process_answer(&mut self, handle: HandleId, answer: &Body) -> bool;

    /// Our offer was rejected or abandoned
    fn process_reject(&mut self, handle: HandleId);
}

/// Negotiator that offers and answers with a fixed description and accepts
/// whatever the peer sends.
#[derive(Debug, Clone)]
pub struct StaticOfferAnswer {
    local: Body,
    remote: HashMap<HandleId, Body>,
}

impl StaticOfferAnswer {
    pub fn new(local: Body) -> Self {
        Self {
            local,
            remote: HashMap::new(),
        }
    }

    /// Last description received from the peer of a call
    pub fn remote(&self, handle: HandleId) -> Option<&Body> {
        self.remote.get(&handle)
    }
}

impl Default for StaticOfferAnswer {
    fn default() -> Self {
        Self::new(Body::sdp(
            "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\nm=audio 9 RTP/AVP 0\r\n",
        ))
    }
}

impl OfferAnswer for StaticOfferAnswer {
    fn generate_offer(&mut self, _handle: HandleId) -> Option<Body> {
        Some(self.local.clone())
    }

    fn set_remote_offer(&mut self, handle: HandleId, offer: &Body) -> bool {
        self.remote.insert(handle, offer.clone());
        true
    }

    fn generate_answer(&mut self, _handle: HandleId) -> Option<Body> {
        Some(self.local.clone())
    }

    fn process_answer(&mut self, handle: HandleId, answer: &Body) -> bool {
        self.remote.insert(handle, answer.clone());
        true
    }

    fn process_reject(&mut self, handle: HandleId) {
        debug!("Offer of {} rejected", handle);
    }
}

/// Message that carried one half of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    Invite,
    ReliableProvisional,
    Prack,
    Update,
    Final,
}

/// Open exchange of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Idle,
    /// We offered and wait for the answer
    LocalOffer(Carrier),
    /// The peer offered and waits for our answer
    RemoteOffer(Carrier),
}

/// Offer/answer serialization for one call
#[derive(Debug, Clone, Copy)]
pub struct Negotiation {
    pub exchange: Exchange,
    /// At least one exchange has completed
    pub established: bool,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self {
            exchange: Exchange::Idle,
            established: false,
        }
    }
}

impl Negotiation {
    pub fn is_idle(&self) -> bool {
        self.exchange == Exchange::Idle
    }

    /// A new offer may be sent or accepted
    pub fn can_offer(&self) -> bool {
        self.is_idle()
    }

    pub fn local_offer(&mut self, carrier: Carrier) {
        self.exchange = Exchange::LocalOffer(carrier);
    }

    pub fn remote_offer(&mut self, carrier: Carrier) {
        self.exchange = Exchange::RemoteOffer(carrier);
    }

    /// Our offer sent in `carrier` is still waiting for its answer
    pub fn awaiting_answer_to(&self, carrier: Carrier) -> bool {
        self.exchange == Exchange::LocalOffer(carrier)
    }

    pub fn awaiting_answer(&self) -> bool {
        matches!(self.exchange, Exchange::LocalOffer(_))
    }

    pub fn owes_answer(&self) -> bool {
        matches!(self.exchange, Exchange::RemoteOffer(_))
    }

    pub fn complete(&mut self) {
        self.exchange = Exchange::Idle;
        self.established = true;
    }

    pub fn abandon(&mut self) {
        self.exchange = Exchange::Idle;
    }
}
