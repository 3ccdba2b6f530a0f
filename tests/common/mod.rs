//! Scripted peer for driving an engine without a network

#![allow(dead_code)]

use sipua::application::Engine;
use sipua::config::EngineConfig;
use sipua::domain::shared::{HandleId, OperationId, Status};
use sipua::infrastructure::protocols::sip::builder::{RequestBuilder, ResponseBuilder};
use sipua::infrastructure::protocols::sip::headers::{NameAddr, Via};
use sipua::infrastructure::protocols::sip::{
    Body, CallOptions, Destination, EngineEvent, Indication, OperationKind, Outgoing, SipMessage,
    SipMethod, SipRequest, SipResponse, StaticOfferAnswer, TransportProtocol,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const LOCAL_HOST: &str = "192.0.2.1";
pub const BOB: &str = "sip:bob@192.0.2.20:5060";
pub const BOB_CONTACT: &str = "<sip:bob@192.0.2.20:5060>";

pub struct Harness {
    pub engine: Engine,
    pub start: Instant,
    sent: Vec<(SipMessage, Destination)>,
    resets: Vec<Destination>,
    events: Vec<EngineEvent>,
    branch: u32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let start = Instant::now();
        let engine = Engine::new(config, Box::new(StaticOfferAnswer::default()), start)
            .expect("valid config");
        Self {
            engine,
            start,
            sent: Vec::new(),
            resets: Vec::new(),
            events: Vec::new(),
            branch: 0,
        }
    }

    /// Move the clock to `start + at`, firing timers at their own deadlines
    pub fn advance_to(&mut self, at: Duration) {
        let target = self.start + at;
        while let Some(next) = self.engine.next_timeout() {
            if next > target {
                break;
            }
            self.engine.advance(next);
        }
        self.engine.advance(target);
        self.collect();
    }

    pub fn advance(&mut self, by: Duration) {
        let at = self.engine.now() + by - self.start;
        self.advance_to(at);
    }

    fn collect(&mut self) {
        while let Some(outgoing) = self.engine.poll_outgoing() {
            match outgoing {
                Outgoing::Message {
                    message,
                    destination,
                } => self.sent.push((message, destination)),
                Outgoing::ResetConnection { destination } => self.resets.push(destination),
            }
        }
        while let Some(event) = self.engine.poll_event() {
            self.events.push(event);
        }
    }

    /// Everything sent since the last call
    pub fn take_sent(&mut self) -> Vec<(SipMessage, Destination)> {
        self.collect();
        std::mem::take(&mut self.sent)
    }

    /// Connection resets requested since the last call
    pub fn take_resets(&mut self) -> Vec<Destination> {
        self.collect();
        std::mem::take(&mut self.resets)
    }

    pub fn take_requests(&mut self, method: SipMethod) -> Vec<(SipRequest, Destination)> {
        self.take_sent()
            .into_iter()
            .filter_map(|(message, destination)| match message {
                SipMessage::Request(request) if request.method == method => Some((request, destination)),
                _ => None,
            })
            .collect()
    }

    /// The single request of `method` sent since the last call
    pub fn expect_request(&mut self, method: SipMethod) -> (SipRequest, Destination) {
        let mut requests = self.take_requests(method);
        assert_eq!(requests.len(), 1, "expected exactly one {}", method);
        requests.remove(0)
    }

    pub fn take_responses(&mut self) -> Vec<SipResponse> {
        self.take_sent()
            .into_iter()
            .filter_map(|(message, _)| match message {
                SipMessage::Response(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        self.collect();
        std::mem::take(&mut self.events)
    }

    pub fn deliver(&mut self, message: impl Into<SipMessage>, from: &str) {
        let source: SocketAddr = from.parse().expect("peer address");
        self.engine.on_receive(message.into(), source, TransportProtocol::Udp);
        self.collect();
    }

    /// Peer answers `request`; `tag` is its To tag
    pub fn answer(&mut self, request: &SipRequest, code: u16, tag: &str) {
        let response = ResponseBuilder::new(code)
            .to_tag(tag)
            .header("Contact", BOB_CONTACT)
            .build_for_request(request);
        self.deliver(response, "192.0.2.20:5060");
    }

    pub fn next_branch(&mut self) -> String {
        self.branch += 1;
        format!("z9hG4bK-peer-{}", self.branch)
    }

    /// Outgoing call to Bob, answered with 200 from tag `b1` and ACKed
    pub fn established_call(&mut self) -> (HandleId, SipRequest) {
        let call = self.engine.create_call(CallOptions::new(BOB));
        self.engine.start_call(call).expect("start");
        let (invite, _) = self.expect_request(SipMethod::Invite);
        self.answer(&invite, 200, "b1");
        self.expect_request(SipMethod::Ack);
        self.take_events();
        (call, invite)
    }

    /// In-dialog request from the far end of the dialog `invite` created
    pub fn peer_request(&mut self, method: SipMethod, invite: &SipRequest, remote_tag: &str, cseq: u32) -> RequestBuilder {
        let local_tag = invite.from_tag().expect("our tag");
        let local = NameAddr::new(invite.from().expect("From").uri).with_tag(&local_tag);
        let via = Via::new("UDP", "192.0.2.20", 5060, &self.next_branch());
        RequestBuilder::new(method, format!("sip:sipua@{}:5060", LOCAL_HOST))
            .via(&via)
            .max_forwards(70)
            .from(&NameAddr::new(BOB).with_tag(remote_tag))
            .to(&local)
            .call_id(invite.call_id().expect("Call-ID"))
            .cseq(cseq)
            .contact(&NameAddr::new(BOB))
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.local.host = Some(LOCAL_HOST.to_string());
    config
}

pub fn sdp() -> Body {
    Body::sdp("v=0\r\no=bob 1 1 IN IP4 192.0.2.20\r\ns=-\r\nc=IN IP4 192.0.2.20\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\n")
}

/// Final result of `operation`, if one was reported
pub fn final_result(events: &[EngineEvent], operation: OperationId) -> Option<(OperationKind, Status)> {
    events.iter().find_map(|event| match event {
        EngineEvent::Result {
            operation: op,
            kind,
            status,
            is_final: true,
            ..
        } if *op == operation => Some((*kind, status.clone())),
        _ => None,
    })
}

pub fn indications(events: &[EngineEvent]) -> Vec<&Indication> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Indication { indication, .. } => Some(indication),
            _ => None,
        })
        .collect()
}
