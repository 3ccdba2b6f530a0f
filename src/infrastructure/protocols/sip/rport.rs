/// RPORT support for NAT traversal (RFC 3581)
///
/// Outgoing requests ask the next hop to record the source address it saw;
/// incoming requests get that address stamped into their top Via so that
/// responses travel back through the same NAT binding.

use super::headers::Via;
use super::message::SipRequest;
use std::net::SocketAddr;
use tracing::debug;

/// Check if Via header has rport parameter
pub fn has_rport_parameter(via: &Via) -> bool {
    via.params.iter().any(|(k, _)| k.eq_ignore_ascii_case("rport"))
}

/// Record the observed source address in the top Via of an incoming request.
///
/// `received` is added when the source differs from the sent-by host and
/// `rport` is filled in when the sender asked for it.
pub fn stamp_received(request: &mut SipRequest, source: SocketAddr) {
    let vias = request.headers.values("Via");
    let Some(top) = vias.first() else {
        return;
    };
    let Some(mut via) = Via::parse(top) else {
        return;
    };

    let source_ip = source.ip().to_string();
    if via.host != source_ip {
        via.set_param("received", Some(&source_ip));
    }
    if has_rport_parameter(&via) {
        via.set_param("received", Some(&source_ip));
        via.set_param("rport", Some(&source.port().to_string()));
        debug!("Stamped rport={} received={} on Via", source.port(), source_ip);
    }

    let mut rest: Vec<String> = vias.into_iter().skip(1).collect();
    rest.insert(0, via.to_string());
    request.headers.remove("Via");
    for value in rest {
        request.headers.push("Via", value);
    }
}

/// Address a response to this Via should be sent to (RFC 3261 18.2.2, RFC 3581 4)
pub fn response_address(via: &Via) -> (String, u16) {
    let host = via.received().unwrap_or(&via.host).to_string();
    let port = via.rport().or(via.port).unwrap_or(5060);
    (host, port)
}

/// Public address learned from a response Via (received + rport).
///
/// Returns `None` when the registrar did not report a received address.
pub fn public_address_from_via(via: &Via) -> Option<(String, u16)> {
    let received = via.received()?;
    let port = via.rport().or(via.port).unwrap_or(5060);
    Some((received.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMethod;

    #[test]
    fn test_stamp_received_fills_rport() {
        let mut request = SipRequest::new(SipMethod::Options, "sip:ua@10.0.0.1");
        request
            .headers
            .push("Via", "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKa;rport");
        request
            .headers
            .push("Via", "SIP/2.0/UDP 10.0.0.3:5060;branch=z9hG4bKb");

        stamp_received(&mut request, "203.0.113.7:40123".parse().unwrap());

        let top = request.top_via().unwrap();
        assert_eq!(top.received(), Some("203.0.113.7"));
        assert_eq!(top.rport(), Some(40123));
        assert_eq!(request.headers.values("Via").len(), 2);
        assert_eq!(response_address(&top), ("203.0.113.7".to_string(), 40123));
    }

    #[test]
    fn test_stamp_received_without_rport() {
        let mut request = SipRequest::new(SipMethod::Options, "sip:ua@10.0.0.1");
        request
            .headers
            .push("Via", "SIP/2.0/UDP 10.0.0.2:5070;branch=z9hG4bKa");

        stamp_received(&mut request, "10.0.0.2:5070".parse().unwrap());

        let top = request.top_via().unwrap();
        assert_eq!(top.received(), None);
        assert_eq!(response_address(&top), ("10.0.0.2".to_string(), 5070));
    }

    #[test]
    fn test_public_address_from_via() {
        let via = Via::parse("SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK1;received=198.51.100.4;rport=61000").unwrap();
        assert_eq!(
            public_address_from_via(&via),
            Some(("198.51.100.4".to_string(), 61000))
        );

        let via = Via::parse("SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK1").unwrap();
        assert_eq!(public_address_from_via(&via), None);
    }
}
