//! Transfer: the far end REFERs us to a third party

mod common;

use common::{indications, Harness, LOCAL_HOST};
use sipua::infrastructure::protocols::sip::builder::{RequestBuilder, ResponseBuilder};
use sipua::infrastructure::protocols::sip::headers::{NameAddr, Via};
use sipua::infrastructure::protocols::sip::{
    CallOptions, CallState, Indication, SipMethod, SubscriptionRole, SubscriptionState,
};
use std::time::Duration;

const CAROL: &str = "sip:carol@192.0.2.30:5060";
const CAROL_ADDR: &str = "192.0.2.30:5060";

#[test]
fn test_transfer_reports_progress_to_referrer() {
    let mut h = Harness::new();
    let (bob_call, bob_invite) = h.established_call();

    let refer = h
        .peer_request(SipMethod::Refer, &bob_invite, "b1", 1)
        .header("Refer-To", format!("<{}>", CAROL))
        .header("Referred-By", "<sip:bob@192.0.2.20:5060>")
        .build();
    h.deliver(refer, "192.0.2.20:5060");

    let responses = h.take_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 202);
    let events = h.take_events();
    let subscription = indications(&events)
        .iter()
        .find_map(|i| match i {
            Indication::IncomingRefer {
                refer_to,
                referred_by,
                subscription,
                token,
            } => {
                assert_eq!(refer_to, CAROL);
                assert!(referred_by.as_deref().unwrap().contains("bob"));
                assert!(token.is_none());
                Some(*subscription)
            }
            _ => None,
        })
        .expect("IncomingRefer");
    let sub = h.engine.subscription(subscription).unwrap();
    assert_eq!(sub.role(), SubscriptionRole::Notifier);
    assert_eq!(sub.state(), SubscriptionState::Active);

    // Call the transfer target
    let carol_call = h
        .engine
        .create_call(CallOptions::new(CAROL).with_refer_subscription(subscription, None));
    h.engine.start_call(carol_call).unwrap();
    let (carol_invite, destination) = h.expect_request(SipMethod::Invite);
    assert_eq!(destination.host, "192.0.2.30");

    let ok = ResponseBuilder::ok()
        .to_tag("c1")
        .header("Contact", format!("<{}>", CAROL))
        .build_for_request(&carol_invite);
    h.deliver(ok, CAROL_ADDR);
    assert_eq!(h.engine.call(carol_call).unwrap().state(), CallState::Ready);

    let sent = h.take_sent();
    let ack = sent
        .iter()
        .find_map(|(m, d)| m.as_request().filter(|r| r.method == SipMethod::Ack).map(|_| d.clone()))
        .expect("ACK to Carol");
    assert_eq!(ack.host, "192.0.2.30");
    let (notify, destination) = sent
        .iter()
        .find_map(|(m, d)| {
            m.as_request()
                .filter(|r| r.method == SipMethod::Notify)
                .map(|r| (r.clone(), d.clone()))
        })
        .expect("progress NOTIFY");
    assert_eq!(destination.host, "192.0.2.20");
    assert_eq!(notify.headers.get("Event"), Some("refer;id=1"));
    assert!(notify
        .headers
        .get("Subscription-State")
        .unwrap()
        .starts_with("active;expires="));
    assert_eq!(notify.call_id(), bob_invite.call_id());
    let body = notify.body().unwrap();
    assert!(body.content_type.starts_with("message/sipfrag"));
    assert_eq!(body.sipfrag_status(), Some(200));
    h.answer(&notify, 200, "b1");

    // Carol hangs up; the subscription ends with the call
    let carol_bye = RequestBuilder::new(SipMethod::Bye, format!("sip:sipua@{}:5060", LOCAL_HOST))
        .via(&Via::new("UDP", "192.0.2.30", 5060, "z9hG4bK-carol-1"))
        .max_forwards(70)
        .from(&NameAddr::new(CAROL).with_tag("c1"))
        .to(&NameAddr::new(carol_invite.from().unwrap().uri).with_tag(&carol_invite.from_tag().unwrap()))
        .call_id(carol_invite.call_id().unwrap())
        .cseq(1)
        .build();
    h.deliver(carol_bye, CAROL_ADDR);
    assert_eq!(h.engine.call(carol_call).unwrap().state(), CallState::Terminated);

    let (last, destination) = h.expect_request(SipMethod::Notify);
    assert_eq!(destination.host, "192.0.2.20");
    assert_eq!(
        last.headers.get("Subscription-State"),
        Some("terminated;reason=noresource")
    );
    assert_eq!(last.body().unwrap().sipfrag_status(), Some(200));
    assert!(last.cseq().unwrap().seq > notify.cseq().unwrap().seq);
    h.answer(&last, 200, "b1");
    assert_eq!(
        h.engine.subscription(subscription).unwrap().state(),
        SubscriptionState::Terminated
    );

    // The call with Bob is untouched
    assert_eq!(h.engine.call(bob_call).unwrap().state(), CallState::Ready);

    h.advance(Duration::from_secs(40));
    assert!(h.engine.subscription(subscription).is_none());
}

#[test]
fn test_refer_without_target_is_rejected() {
    let mut h = Harness::new();
    let (_, invite) = h.established_call();

    let refer = h.peer_request(SipMethod::Refer, &invite, "b1", 1).build();
    h.deliver(refer, "192.0.2.20:5060");

    let responses = h.take_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 400);
    let events = h.take_events();
    assert!(!indications(&events)
        .iter()
        .any(|i| matches!(i, Indication::IncomingRefer { .. })));
}
