//! SIP message types and parsing
//!
//! Messages are kept as structured values with headers addressed by name.
//! Parsing goes through `rsip`; serialization is done here so that the
//! Content-Length always matches the body.

use super::headers::{CSeq, NameAddr, Via};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    /// Methods that can establish a dialog
    pub fn creates_dialog(&self) -> bool {
        matches!(
            self,
            SipMethod::Invite | SipMethod::Subscribe | SipMethod::Refer | SipMethod::Notify
        )
    }

    /// Methods whose 2xx refreshes the remote target
    pub fn is_target_refresh(&self) -> bool {
        matches!(
            self,
            SipMethod::Invite | SipMethod::Update | SipMethod::Subscribe | SipMethod::Notify | SipMethod::Refer
        )
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other => return Err(SipError::InvalidMessage(format!("Unsupported method: {}", other))),
        };
        Ok(method)
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expand a compact header name (RFC 3261 7.3.3 and extensions)
fn canonical_name(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "k" | "K" => "Supported",
        "o" | "O" => "Event",
        "r" | "R" => "Refer-To",
        "x" | "X" => "Session-Expires",
        "u" | "U" => "Allow-Events",
        "s" | "S" => "Subject",
        "e" | "E" => "Content-Encoding",
        other => other,
    }
}

fn same_name(a: &str, b: &str) -> bool {
    canonical_name(a).eq_ignore_ascii_case(canonical_name(b))
}

/// Split a comma separated header value, ignoring commas inside quotes
/// and angle brackets.
pub fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in value.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(c);
            }
            ',' if !in_quotes && !in_angle => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
    items
}

/// Ordered header list addressed by case-insensitive name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value of a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| same_name(n, name))
            .map(|(_, v)| v.as_str())
    }

    /// Every header line with this name, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(n, _)| same_name(n, name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Every element of a list header, across all header lines
    pub fn values(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .into_iter()
            .flat_map(split_list)
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| same_name(n, name))
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let name = canonical_name(&name).to_string();
        self.0.push((name, value.into()));
    }

    /// Insert before any existing header lines
    pub fn push_front(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let name = canonical_name(&name).to_string();
        self.0.insert(0, (name, value.into()));
    }

    /// Replace every line of this header with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|(n, _)| same_name(n, &name)) {
            Some(index) => {
                self.0[index].1 = value;
                let mut seen = 0usize;
                self.0.retain(|(n, _)| {
                    if same_name(n, &name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.push(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !same_name(n, name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lower rsip headers into name/value pairs
    fn from_rsip(headers: &rsip::Headers) -> Self {
        let mut lowered = Headers::new();
        for header in headers.iter() {
            let line = header.to_string();
            if let Some((name, value)) = line.split_once(':') {
                lowered.push(name.trim(), value.trim());
            }
        }
        lowered
    }
}

/// Opaque message body with its content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Body {
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn sdp(data: impl Into<Vec<u8>>) -> Self {
        Self::new("application/sdp", data)
    }

    /// `message/sipfrag` body carrying a status line
    pub fn sipfrag(code: u16, reason: &str) -> Self {
        Self::new("message/sipfrag;version=2.0", format!("SIP/2.0 {} {}", code, reason))
    }

    /// Status code of a `message/sipfrag` body
    pub fn sipfrag_status(&self) -> Option<u16> {
        let text = std::str::from_utf8(&self.data).ok()?;
        let line = text.lines().next()?;
        let mut parts = line.split_whitespace();
        if parts.next()? != "SIP/2.0" {
            return None;
        }
        parts.next()?.parse().ok()
    }
}

/// Default reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        420 => "Bad Extension",
        421 => "Extension Required",
        422 => "Session Interval Too Small",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        580 => "Precondition Failure",
        600 => "Busy Everywhere",
        603 => "Decline",
        _ => "",
    }
}

/// SIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Self::from_rsip(&request)
    }

    fn from_rsip(request: &rsip::Request) -> Result<Self, SipError> {
        let method = SipMethod::from_str(&request.method.to_string())?;
        Ok(Self {
            method,
            uri: request.uri.to_string(),
            headers: Headers::from_rsip(&request.headers),
            body: request.body.clone(),
        })
    }

    pub fn method(&self) -> SipMethod {
        self.method
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.get("CSeq").and_then(CSeq::parse)
    }

    pub fn from(&self) -> Option<NameAddr> {
        self.headers.get("From").and_then(NameAddr::parse)
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.headers.get("To").and_then(NameAddr::parse)
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from().and_then(|f| f.tag().map(str::to_string))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to().and_then(|t| t.tag().map(str::to_string))
    }

    pub fn top_via(&self) -> Option<Via> {
        self.headers.values("Via").first().and_then(|v| Via::parse(v))
    }

    pub fn branch(&self) -> Option<String> {
        self.top_via().and_then(|v| v.branch().map(str::to_string))
    }

    pub fn body(&self) -> Option<Body> {
        message_body(&self.headers, &self.body)
    }

    pub fn set_body(&mut self, body: Option<Body>) {
        set_message_body(&mut self.headers, &mut self.body, body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = format!("{} {} SIP/2.0\r\n", self.method, self.uri);
        write_headers(&mut out, &self.headers, self.body.len());
        let mut data = out.into_bytes();
        data.extend_from_slice(&self.body);
        Bytes::from(data)
    }
}

/// SIP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::from_rsip(&response))
    }

    fn from_rsip(response: &rsip::Response) -> Self {
        let status: u16 = response.status_code.clone().into();
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::from_rsip(&response.headers),
            body: response.body.clone(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.get("CSeq").and_then(CSeq::parse)
    }

    pub fn from(&self) -> Option<NameAddr> {
        self.headers.get("From").and_then(NameAddr::parse)
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.headers.get("To").and_then(NameAddr::parse)
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from().and_then(|f| f.tag().map(str::to_string))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to().and_then(|t| t.tag().map(str::to_string))
    }

    pub fn top_via(&self) -> Option<Via> {
        self.headers.values("Via").first().and_then(|v| Via::parse(v))
    }

    pub fn branch(&self) -> Option<String> {
        self.top_via().and_then(|v| v.branch().map(str::to_string))
    }

    pub fn body(&self) -> Option<Body> {
        message_body(&self.headers, &self.body)
    }

    pub fn set_body(&mut self, body: Option<Body>) {
        set_message_body(&mut self.headers, &mut self.body, body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = format!("SIP/2.0 {} {}\r\n", self.status, self.reason);
        write_headers(&mut out, &self.headers, self.body.len());
        let mut data = out.into_bytes();
        data.extend_from_slice(&self.body);
        Bytes::from(data)
    }
}

fn message_body(headers: &Headers, body: &[u8]) -> Option<Body> {
    if body.is_empty() {
        return None;
    }
    let content_type = headers
        .get("Content-Type")
        .unwrap_or("application/octet-stream");
    Some(Body::new(content_type, body.to_vec()))
}

fn set_message_body(headers: &mut Headers, data: &mut Vec<u8>, body: Option<Body>) {
    match body {
        Some(body) => {
            headers.set("Content-Type", body.content_type);
            *data = body.data;
        }
        None => {
            headers.remove("Content-Type");
            data.clear();
        }
    }
}

fn write_headers(out: &mut String, headers: &Headers, body_len: usize) {
    for (name, value) in headers.iter() {
        if same_name(name, "Content-Length") {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body_len));
}

/// SIP Message (either request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        // Try parsing as response
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl From<SipRequest> for SipMessage {
    fn from(request: SipRequest) -> Self {
        SipMessage::Request(request)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(response: SipResponse) -> Self {
        SipMessage::Response(response)
    }
}
