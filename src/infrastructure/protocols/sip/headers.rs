//! Typed views over header values
//!
//! Only the fields the signalling engine reads or writes are modelled;
//! everything else is carried through as text.

use super::message::SipMethod;
use std::fmt;
use std::str::FromStr;

/// Generic `;name=value` parameter list
pub type Params = Vec<(String, Option<String>)>;

fn parse_params(input: &str) -> Params {
    input
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().trim_matches('"').to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &Params) -> fmt::Result {
    for (name, value) in params {
        match value {
            Some(value) => write!(f, ";{}={}", name, value)?,
            None => write!(f, ";{}", name)?,
        }
    }
    Ok(())
}

fn find_param<'a>(params: &'a Params, name: &str) -> Option<Option<&'a str>> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_deref())
}

fn set_param(params: &mut Params, name: &str, value: Option<&str>) {
    match params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value.map(str::to_string),
        None => params.push((name.to_string(), value.map(str::to_string))),
    }
}

/// `display-name <uri>;params` or `uri;params`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: String,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            display_name: None,
            uri: uri.into(),
            params: Vec::new(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        if let Some(open) = value.find('<') {
            let close = value[open..].find('>')? + open;
            let display = value[..open].trim().trim_matches('"').trim();
            Some(Self {
                display_name: (!display.is_empty()).then(|| display.to_string()),
                uri: value[open + 1..close].trim().to_string(),
                params: parse_params(&value[close + 1..]),
            })
        } else {
            let (uri, params) = match value.split_once(';') {
                Some((uri, params)) => (uri, parse_params(params)),
                None => (value, Vec::new()),
            };
            Some(Self {
                display_name: None,
                uri: uri.trim().to_string(),
                params,
            })
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.set_param("tag", Some(tag));
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        find_param(&self.params, name).flatten()
    }

    pub fn has_param(&self, name: &str) -> bool {
        find_param(&self.params, name).is_some()
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        set_param(&mut self.params, name, value);
    }

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        write_params(f, &self.params)
    }
}

/// Host and port of a SIP URI, ignoring user part and parameters
pub fn uri_host_port(uri: &str) -> Option<(String, Option<u16>)> {
    let rest = uri
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>');
    let rest = rest
        .strip_prefix("sips:")
        .or_else(|| rest.strip_prefix("sip:"))
        .unwrap_or(rest);
    let rest = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
    let hostport = rest.split([';', '?']).next()?;
    parse_host_port(hostport)
}

/// Split `host[:port]`, handling bracketed IPv6 literals
pub fn parse_host_port(hostport: &str) -> Option<(String, Option<u16>)> {
    let hostport = hostport.trim();
    if hostport.is_empty() {
        return None;
    }
    if let Some(stripped) = hostport.strip_prefix('[') {
        let close = stripped.find(']')?;
        let host = format!("[{}]", &stripped[..close]);
        let port = stripped[close + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse().ok());
        return Some((host, port));
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok())),
        None => Some((hostport.to_string(), None)),
    }
}

/// URI parameter such as `transport` or `lr`
pub fn uri_param(uri: &str, name: &str) -> Option<Option<String>> {
    let uri = uri.trim().trim_start_matches('<').trim_end_matches('>');
    let params = uri.split('?').next()?.split_once(';')?.1;
    find_param(&parse_params(params), name).map(|v| v.map(str::to_string))
}

/// User part of a SIP URI
pub fn uri_user(uri: &str) -> Option<String> {
    let rest = uri
        .trim()
        .strip_prefix("sips:")
        .or_else(|| uri.trim().strip_prefix("sip:"))?;
    rest.split_once('@').map(|(user, _)| user.to_string())
}

/// Via header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: &str, host: &str, port: u16, branch: &str) -> Self {
        Self {
            transport: transport.to_string(),
            host: host.to_string(),
            port: Some(port),
            params: vec![("branch".to_string(), Some(branch.to_string()))],
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (protocol, rest) = value.split_once(char::is_whitespace)?;
        let transport = protocol.rsplit('/').next()?.to_string();
        let (sent_by, params) = match rest.trim().split_once(';') {
            Some((sent_by, params)) => (sent_by, parse_params(params)),
            None => (rest.trim(), Vec::new()),
        };
        let (host, port) = parse_host_port(sent_by)?;
        Some(Self {
            transport,
            host,
            port,
            params,
        })
    }

    pub fn branch(&self) -> Option<&str> {
        find_param(&self.params, "branch").flatten()
    }

    pub fn received(&self) -> Option<&str> {
        find_param(&self.params, "received").flatten()
    }

    pub fn rport(&self) -> Option<u16> {
        find_param(&self.params, "rport")
            .flatten()
            .and_then(|p| p.parse().ok())
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        set_param(&mut self.params, name, value);
    }

    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by())?;
        write_params(f, &self.params)
    }
}

/// CSeq header value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(seq: u32, method: SipMethod) -> Self {
        Self { seq, method }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::from_str(parts.next()?).ok()?;
        Some(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// RAck header value (RFC 3262)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: SipMethod,
}

impl RAck {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let rseq = parts.next()?.parse().ok()?;
        let cseq = parts.next()?.parse().ok()?;
        let method = SipMethod::from_str(parts.next()?).ok()?;
        Some(Self { rseq, cseq, method })
    }
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

/// Session refresher role (RFC 4028)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

impl Refresher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Refresher::Uac => "uac",
            Refresher::Uas => "uas",
        }
    }
}

/// Session-Expires header value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpires {
    pub interval: u32,
    pub refresher: Option<Refresher>,
}

impl SessionExpires {
    pub fn parse(value: &str) -> Option<Self> {
        let (interval, params) = match value.split_once(';') {
            Some((interval, params)) => (interval, parse_params(params)),
            None => (value, Vec::new()),
        };
        let refresher = match find_param(&params, "refresher").flatten() {
            Some(r) if r.eq_ignore_ascii_case("uac") => Some(Refresher::Uac),
            Some(r) if r.eq_ignore_ascii_case("uas") => Some(Refresher::Uas),
            _ => None,
        };
        Some(Self {
            interval: interval.trim().parse().ok()?,
            refresher,
        })
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interval)?;
        if let Some(refresher) = self.refresher {
            write!(f, ";refresher={}", refresher.as_str())?;
        }
        Ok(())
    }
}

/// Subscription state as carried by Subscription-State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Active,
    Pending,
    Terminated,
}

impl SubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubState::Active => "active",
            SubState::Pending => "pending",
            SubState::Terminated => "terminated",
        }
    }
}

/// Subscription-State header value (RFC 6665)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateHeader {
    pub state: SubState,
    pub expires: Option<u32>,
    pub reason: Option<String>,
    pub retry_after: Option<u32>,
}

impl SubscriptionStateHeader {
    pub fn active(expires: u32) -> Self {
        Self {
            state: SubState::Active,
            expires: Some(expires),
            reason: None,
            retry_after: None,
        }
    }

    pub fn terminated(reason: &str) -> Self {
        Self {
            state: SubState::Terminated,
            expires: None,
            reason: Some(reason.to_string()),
            retry_after: None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (state, params) = match value.split_once(';') {
            Some((state, params)) => (state, parse_params(params)),
            None => (value, Vec::new()),
        };
        let state = match state.trim().to_ascii_lowercase().as_str() {
            "active" => SubState::Active,
            "pending" => SubState::Pending,
            "terminated" => SubState::Terminated,
            _ => return None,
        };
        Some(Self {
            state,
            expires: find_param(&params, "expires")
                .flatten()
                .and_then(|v| v.parse().ok()),
            reason: find_param(&params, "reason")
                .flatten()
                .map(|r| r.to_ascii_lowercase()),
            retry_after: find_param(&params, "retry-after")
                .flatten()
                .and_then(|v| v.parse().ok()),
        })
    }
}

impl fmt::Display for SubscriptionStateHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state.as_str())?;
        if let Some(reason) = &self.reason {
            write!(f, ";reason={}", reason)?;
        }
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        if let Some(retry_after) = self.retry_after {
            write!(f, ";retry-after={}", retry_after)?;
        }
        Ok(())
    }
}

/// Leading delta-seconds of Retry-After, Expires, Min-SE and similar
pub fn parse_delta_seconds(value: &str) -> Option<u32> {
    value
        .split([';', '('])
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Lower-cased option tags from Supported/Require/Allow style headers
pub fn parse_token_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Event header: package name and optional id
pub fn parse_event(value: &str) -> (String, Option<String>) {
    let (package, params) = match value.split_once(';') {
        Some((package, params)) => (package, parse_params(params)),
        None => (value, Vec::new()),
    };
    (
        package.trim().to_ascii_lowercase(),
        find_param(&params, "id").flatten().map(str::to_string),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_addr_with_display_and_tag() {
        let addr = NameAddr::parse(r#""Alice" <sip:alice@example.com;transport=udp>;tag=1928"#).unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri, "sip:alice@example.com;transport=udp");
        assert_eq!(addr.tag(), Some("1928"));
        assert_eq!(addr.to_string(), r#""Alice" <sip:alice@example.com;transport=udp>;tag=1928"#);
    }

    #[test]
    fn test_name_addr_addr_spec() {
        let addr = NameAddr::parse("sip:bob@example.com;tag=abc").unwrap();
        assert_eq!(addr.uri, "sip:bob@example.com");
        assert_eq!(addr.tag(), Some("abc"));
    }

    #[test]
    fn test_contact_expires_param() {
        let mut addr = NameAddr::parse("<sip:a@10.0.0.1:5060>;expires=60").unwrap();
        assert_eq!(addr.param("expires"), Some("60"));
        addr.set_param("expires", Some("0"));
        assert_eq!(addr.to_string(), "<sip:a@10.0.0.1:5060>;expires=0");
    }

    #[test]
    fn test_uri_host_port() {
        assert_eq!(
            uri_host_port("sip:alice@10.0.0.1:5080;transport=udp"),
            Some(("10.0.0.1".to_string(), Some(5080)))
        );
        assert_eq!(
            uri_host_port("sip:example.com"),
            Some(("example.com".to_string(), None))
        );
        assert_eq!(
            uri_host_port("sip:[2001:db8::1]:5062"),
            Some(("[2001:db8::1]".to_string(), Some(5062)))
        );
        assert_eq!(uri_param("sip:p.example.com;lr", "lr"), Some(None));
        assert_eq!(uri_user("sip:alice@example.com").as_deref(), Some("alice"));
    }

    #[test]
    fn test_via_parse() {
        let via = Via::parse("SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776;rport=40000;received=203.0.113.9").unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.host, "192.168.1.100");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776"));
        assert_eq!(via.rport(), Some(40000));
        assert_eq!(via.received(), Some("203.0.113.9"));
    }

    #[test]
    fn test_cseq_and_rack() {
        let cseq = CSeq::parse("314159 INVITE").unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, SipMethod::Invite);

        let rack = RAck::parse("776656 1 INVITE").unwrap();
        assert_eq!(rack.rseq, 776656);
        assert_eq!(rack.cseq, 1);
        assert_eq!(rack.to_string(), "776656 1 INVITE");
    }

    #[test]
    fn test_session_expires() {
        let se = SessionExpires::parse("1800;refresher=uas").unwrap();
        assert_eq!(se.interval, 1800);
        assert_eq!(se.refresher, Some(Refresher::Uas));
        assert_eq!(SessionExpires::parse("90").unwrap().refresher, None);
    }

    #[test]
    fn test_subscription_state() {
        let state = SubscriptionStateHeader::parse("terminated;reason=deactivated").unwrap();
        assert_eq!(state.state, SubState::Terminated);
        assert_eq!(state.reason.as_deref(), Some("deactivated"));

        let state = SubscriptionStateHeader::parse("active;expires=600").unwrap();
        assert_eq!(state.expires, Some(600));
        assert_eq!(state.to_string(), "active;expires=600");
    }

    #[test]
    fn test_delta_seconds_and_event() {
        assert_eq!(parse_delta_seconds("120 (I'm in a meeting);duration=3600"), Some(120));
        assert_eq!(parse_event("refer;id=93809824"), ("refer".to_string(), Some("93809824".to_string())));
    }
}
