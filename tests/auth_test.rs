//! Digest challenges on registrations and calls

mod common;

use common::{final_result, indications, Harness, BOB};
use sipua::infrastructure::protocols::sip::builder::ResponseBuilder;
use sipua::infrastructure::protocols::sip::{
    CallOptions, CallState, Credential, Indication, OperationKind, RegistrationOptions,
    RegistrationState, SessionOptions, SipMethod, SipRequest, SipResponse,
};

const REGISTRAR: &str = "sip:192.0.2.50:5060";
const REGISTRAR_ADDR: &str = "192.0.2.50:5060";
const BOB_ADDR: &str = "192.0.2.20:5060";

fn challenge(request: &SipRequest, code: u16, nonce: &str) -> SipResponse {
    let header = if code == 407 {
        "Proxy-Authenticate"
    } else {
        "WWW-Authenticate"
    };
    ResponseBuilder::new(code)
        .to_tag("auth")
        .header(header, format!("Digest realm=\"example.com\", nonce=\"{}\"", nonce))
        .build_for_request(request)
}

fn required_realms(h: &mut Harness) -> Vec<String> {
    let events = h.take_events();
    indications(&events)
        .into_iter()
        .filter_map(|i| match i {
            Indication::AuthenticationRequired { realm } => Some(realm.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_registration_asks_for_credentials_once() {
    let mut h = Harness::new();
    let reg = h
        .engine
        .create_registration(RegistrationOptions::new(REGISTRAR, "sip:alice@example.com"));
    let op = h.engine.register(reg).unwrap();
    let (first, _) = h.expect_request(SipMethod::Register);
    assert!(first.headers.get("Authorization").is_none());

    h.deliver(challenge(&first, 401, "n1"), REGISTRAR_ADDR);
    assert!(h.take_requests(SipMethod::Register).is_empty());
    assert_eq!(required_realms(&mut h), vec!["example.com".to_string()]);
    assert_eq!(
        h.engine.registration(reg).unwrap().state(),
        RegistrationState::Authenticating
    );

    h.engine
        .authenticate(reg, Credential::new("example.com", "alice", "secret"))
        .unwrap();
    let (second, _) = h.expect_request(SipMethod::Register);
    let authorization = second.headers.get("Authorization").unwrap();
    assert!(authorization.contains("username=\"alice\""));
    assert!(authorization.contains("realm=\"example.com\""));
    assert!(authorization.contains("nonce=\"n1\""));
    assert_eq!(second.call_id(), first.call_id());
    assert!(second.cseq().unwrap().seq > first.cseq().unwrap().seq);

    // The registrar refuses the credentials; no further attempt
    h.deliver(challenge(&second, 401, "n2"), REGISTRAR_ADDR);
    assert!(h.take_requests(SipMethod::Register).is_empty());
    let events = h.take_events();
    let (kind, status) = final_result(&events, op).unwrap();
    assert_eq!(kind, OperationKind::Register);
    assert_eq!(status.code, 401);
    assert_eq!(
        h.engine.registration(reg).unwrap().state(),
        RegistrationState::Unregistered
    );
}

#[test]
fn test_stored_credential_answers_proxy_challenge() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine
        .authenticate(call, Credential::new("example.com", "alice", "secret"))
        .unwrap();
    let op = h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);

    h.deliver(challenge(&invite, 407, "n1"), BOB_ADDR);
    let sent = h.take_sent();
    let ack = sent
        .iter()
        .filter_map(|(m, _)| m.as_request())
        .find(|r| r.method == SipMethod::Ack)
        .expect("ACK for 407");
    assert_eq!(ack.branch(), invite.branch());
    let retry = sent
        .iter()
        .filter_map(|(m, _)| m.as_request())
        .find(|r| r.method == SipMethod::Invite)
        .expect("INVITE with credentials")
        .clone();
    assert!(retry
        .headers
        .get("Proxy-Authorization")
        .unwrap()
        .contains("username=\"alice\""));
    assert_ne!(retry.branch(), invite.branch());
    assert_eq!(retry.call_id(), invite.call_id());
    assert_eq!(retry.from_tag(), invite.from_tag());
    assert_eq!(retry.cseq().unwrap().seq, invite.cseq().unwrap().seq + 1);
    assert!(required_realms(&mut h).is_empty());

    h.answer(&retry, 200, "b1");
    h.expect_request(SipMethod::Ack);
    let events = h.take_events();
    assert_eq!(final_result(&events, op).unwrap().1.code, 200);
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
}

#[test]
fn test_refused_reinvite_credentials_release_queued_reinvite() {
    let mut h = Harness::new();
    let (call, _) = h.established_call();
    let first_op = h.engine.reinvite(call, SessionOptions::default()).unwrap();
    let second_op = h.engine.reinvite(call, SessionOptions::default()).unwrap();
    let (reinvite, _) = h.expect_request(SipMethod::Invite);

    h.deliver(challenge(&reinvite, 401, "n1"), BOB_ADDR);
    assert!(h.take_requests(SipMethod::Invite).is_empty());
    assert_eq!(required_realms(&mut h), vec!["example.com".to_string()]);

    h.engine
        .authenticate(call, Credential::any_realm("alice", "secret"))
        .unwrap();
    let (retry, _) = h.expect_request(SipMethod::Invite);
    assert!(retry.headers.get("Authorization").is_some());
    assert!(retry.cseq().unwrap().seq > reinvite.cseq().unwrap().seq);

    // In-dialog requests keep Bob's tag
    h.deliver(challenge(&retry, 401, "n2"), BOB_ADDR);
    let events = h.take_events();
    let (kind, status) = final_result(&events, first_op).unwrap();
    assert_eq!(kind, OperationKind::Reinvite);
    assert_eq!(status.code, 401);
    assert!(final_result(&events, second_op).is_none());

    // The queued re-INVITE goes out without waiting for anything else
    let (queued, _) = h.expect_request(SipMethod::Invite);
    assert!(queued.cseq().unwrap().seq > retry.cseq().unwrap().seq);
    h.answer(&queued, 200, "b1");
    h.expect_request(SipMethod::Ack);
    let events = h.take_events();
    assert_eq!(final_result(&events, second_op).unwrap().1.code, 200);
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
}
