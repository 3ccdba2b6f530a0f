//! SIP message builder utilities

use super::headers::{CSeq, NameAddr, Via};
use super::message::{reason_phrase, Body, Headers, SipMethod, SipRequest, SipResponse};
use rand::Rng;

/// Fresh tag for From/To
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

/// Fresh Call-ID scoped to the local host
pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}

/// Build a SIP request header by header
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Headers,
    body: Option<Body>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn via(mut self, via: &Via) -> Self {
        self.headers.push("Via", via.to_string());
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.headers.push("Max-Forwards", hops.to_string());
        self
    }

    pub fn route_set(mut self, routes: &[String]) -> Self {
        for route in routes {
            self.headers.push("Route", route.clone());
        }
        self
    }

    pub fn from(mut self, from: &NameAddr) -> Self {
        self.headers.push("From", from.to_string());
        self
    }

    pub fn to(mut self, to: &NameAddr) -> Self {
        self.headers.push("To", to.to_string());
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.headers.push("Call-ID", call_id);
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        let method = self.method;
        self.headers.push("CSeq", CSeq::new(seq, method).to_string());
        self
    }

    pub fn contact(mut self, contact: &NameAddr) -> Self {
        self.headers.push("Contact", contact.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn body(mut self, body: Option<Body>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> SipRequest {
        let mut request = SipRequest::new(self.method, self.uri);
        request.headers = self.headers;
        request.set_body(self.body);
        request
    }
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    headers: Headers,
    body: Option<Body>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            headers: Headers::new(),
            body: None,
            to_tag: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn body(mut self, body: Option<Body>) -> Self {
        self.body = body;
        self
    }

    /// Tag added to To when the request did not carry one
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut response = SipResponse::new(self.status_code);
        if let Some(reason) = self.reason {
            response.reason = reason;
        } else if response.reason.is_empty() {
            response.reason = reason_phrase(self.status_code).to_string();
        }

        // Copy essential headers from request
        for via in request.headers.get_all("Via") {
            response.headers.push("Via", via);
        }
        if let Some(from) = request.headers.get("From") {
            response.headers.push("From", from);
        }
        if let Some(to) = request.headers.get("To") {
            let to = match (NameAddr::parse(to), &self.to_tag) {
                (Some(addr), Some(tag)) if addr.tag().is_none() && self.status_code > 100 => {
                    addr.with_tag(tag).to_string()
                }
                _ => to.to_string(),
            };
            response.headers.push("To", to);
        }
        if let Some(call_id) = request.headers.get("Call-ID") {
            response.headers.push("Call-ID", call_id);
        }
        if let Some(cseq) = request.headers.get("CSeq") {
            response.headers.push("CSeq", cseq);
        }
        if request.method.creates_dialog() && (101..300).contains(&self.status_code) {
            for record_route in request.headers.get_all("Record-Route") {
                response.headers.push("Record-Route", record_route);
            }
        }

        for (name, value) in self.headers.iter() {
            response.headers.push(name, value);
        }
        response.set_body(self.body);
        response
    }
}

/// ACK for a non-2xx final response; sent by the INVITE client transaction
/// itself and shares the INVITE's branch (RFC 3261 17.1.1.3).
pub fn build_non2xx_ack(invite: &SipRequest, response: &SipResponse) -> SipRequest {
    let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
    if let Some(via) = invite.headers.values("Via").first() {
        ack.headers.push("Via", via.clone());
    }
    ack.headers.push("Max-Forwards", "70");
    for route in invite.headers.get_all("Route") {
        ack.headers.push("Route", route);
    }
    if let Some(from) = invite.headers.get("From") {
        ack.headers.push("From", from);
    }
    if let Some(to) = response.headers.get("To") {
        ack.headers.push("To", to);
    }
    if let Some(call_id) = invite.headers.get("Call-ID") {
        ack.headers.push("Call-ID", call_id);
    }
    if let Some(cseq) = invite.cseq() {
        ack.headers
            .push("CSeq", CSeq::new(cseq.seq, SipMethod::Ack).to_string());
    }
    ack
}

/// CANCEL matching a pending INVITE (RFC 3261 9.1)
pub fn build_cancel(invite: &SipRequest) -> SipRequest {
    let mut cancel = SipRequest::new(SipMethod::Cancel, invite.uri.clone());
    if let Some(via) = invite.headers.values("Via").first() {
        cancel.headers.push("Via", via.clone());
    }
    cancel.headers.push("Max-Forwards", "70");
    for route in invite.headers.get_all("Route") {
        cancel.headers.push("Route", route);
    }
    if let Some(from) = invite.headers.get("From") {
        cancel.headers.push("From", from);
    }
    if let Some(to) = invite.headers.get("To") {
        cancel.headers.push("To", to);
    }
    if let Some(call_id) = invite.headers.get("Call-ID") {
        cancel.headers.push("Call-ID", call_id);
    }
    if let Some(cseq) = invite.cseq() {
        cancel
            .headers
            .push("CSeq", CSeq::new(cseq.seq, SipMethod::Cancel).to_string());
    }
    cancel
}
