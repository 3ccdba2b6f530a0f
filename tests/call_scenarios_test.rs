//! Call flows driven against a scripted far end

mod common;

use common::{final_result, indications, sdp, test_config, Harness, BOB, BOB_CONTACT};
use sipua::infrastructure::protocols::sip::builder::ResponseBuilder;
use sipua::infrastructure::protocols::sip::{
    ByeOptions, CallOptions, CallState, Destination, Indication, OperationKind, SessionOptions,
    SipMessage, SipMethod, SipRequest, SipResponse,
};
use std::time::Duration;

const BOB_ADDR: &str = "192.0.2.20:5060";

/// Bob's 200 carrying a Session-Expires value
fn answer_with_timer(h: &mut Harness, invite: &SipRequest, session_expires: &str) {
    let ok = ResponseBuilder::ok()
        .to_tag("b1")
        .header("Contact", BOB_CONTACT)
        .header("Session-Expires", session_expires)
        .header("Require", "timer")
        .build_for_request(invite);
    h.deliver(ok, BOB_ADDR);
}

/// Reliable 183 from Bob with an SDP answer
fn reliable_183(invite: &SipRequest, rseq: u32, require: &str) -> SipResponse {
    ResponseBuilder::new(183)
        .to_tag("b1")
        .header("Contact", BOB_CONTACT)
        .header("Require", require)
        .header("RSeq", rseq.to_string())
        .body(Some(sdp()))
        .build_for_request(invite)
}

fn methods(sent: &[(SipMessage, Destination)]) -> Vec<SipMethod> {
    sent.iter()
        .filter_map(|(m, _)| m.as_request().map(|r| r.method))
        .collect()
}

#[test]
fn test_forked_answers_are_each_acknowledged() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    let op = h.engine.start_call(call).unwrap();
    let (invite, destination) = h.expect_request(SipMethod::Invite);
    assert_eq!(destination.host, "192.0.2.20");
    assert_eq!(destination.port, 5060);

    h.answer(&invite, 200, "b1");
    let (ack, to) = h.expect_request(SipMethod::Ack);
    assert_eq!(ack.to_tag().as_deref(), Some("b1"));
    assert_eq!(to.port, 5060);
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
    let events = h.take_events();
    let (kind, status) = final_result(&events, op).unwrap();
    assert_eq!(kind, OperationKind::StartCall);
    assert_eq!(status.code, 200);

    // Second branch of a forking proxy
    let fork = ResponseBuilder::ok()
        .to_tag("b2")
        .header("Contact", "<sip:bob@192.0.2.21:5060>")
        .build_for_request(&invite);
    h.deliver(fork, "192.0.2.20:5060");
    let (ack, to) = h.expect_request(SipMethod::Ack);
    assert_eq!(ack.to_tag().as_deref(), Some("b2"));
    assert_eq!(to.host, "192.0.2.21");
    let events = h.take_events();
    assert!(indications(&events)
        .iter()
        .any(|i| matches!(i, Indication::ForkedDialog { remote_tag } if remote_tag == "b2")));

    // A retransmitted 2xx gets the same ACK again
    h.answer(&invite, 200, "b1");
    let (again, _) = h.expect_request(SipMethod::Ack);
    assert_eq!(again.to_tag().as_deref(), Some("b1"));

    // Once 64*T1 has passed the INVITE transaction is gone
    h.advance(Duration::from_millis(500 * 64 + 100));
    h.take_sent();
    h.answer(&invite, 200, "b3");
    assert!(h.take_requests(SipMethod::Ack).is_empty());
}

#[test]
fn test_cancel_waits_for_provisional_response() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    let start = h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);

    let cancel = h.engine.cancel(call).unwrap();
    assert!(h.take_requests(SipMethod::Cancel).is_empty());

    h.answer(&invite, 180, "b1");
    let (cancel_request, _) = h.expect_request(SipMethod::Cancel);
    assert_eq!(cancel_request.branch(), invite.branch());
    assert_eq!(cancel_request.cseq().map(|c| c.seq), invite.cseq().map(|c| c.seq));
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Proceeding);

    h.answer(&cancel_request, 200, "b1");
    h.answer(&invite, 487, "b1");

    // The INVITE transaction ACKs the 487 on the INVITE's branch
    let (ack, _) = h.expect_request(SipMethod::Ack);
    assert_eq!(ack.branch(), invite.branch());

    let events = h.take_events();
    let (kind, status) = final_result(&events, cancel).unwrap();
    assert_eq!(kind, OperationKind::Cancel);
    assert_eq!(status.code, 200);
    let (kind, status) = final_result(&events, start).unwrap();
    assert_eq!(kind, OperationKind::StartCall);
    assert_eq!(status.code, 487);
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Terminated);
}

#[test]
fn test_answer_racing_cancel_leaves_usable_call() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);

    let cancel = h.engine.cancel(call).unwrap();
    h.answer(&invite, 200, "b1");

    assert!(h.take_requests(SipMethod::Cancel).is_empty());
    let events = h.take_events();
    let (_, status) = final_result(&events, cancel).unwrap();
    assert_eq!(status.code, 481);
    assert!(status.is_local());
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);

    let bye = h.engine.bye(call, ByeOptions::default()).unwrap();
    let (bye_request, _) = h.expect_request(SipMethod::Bye);
    assert_eq!(bye_request.to_tag().as_deref(), Some("b1"));
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Terminating);

    h.answer(&bye_request, 200, "b1");
    let events = h.take_events();
    assert_eq!(final_result(&events, bye).unwrap().1.code, 200);
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Terminated);
}

#[test]
fn test_reinvite_retry_after_then_hangup() {
    let mut h = Harness::new();
    let (call, _) = h.established_call();
    let params = h
        .engine
        .call(call)
        .unwrap()
        .parameters()
        .clone()
        .with_max_invite_retries(1);
    h.engine.set_parameters(call, params).unwrap();
    h.take_events();

    let op = h.engine.reinvite(call, SessionOptions::default()).unwrap();
    let (first, _) = h.expect_request(SipMethod::Invite);
    let busy = ResponseBuilder::new(500)
        .header("Retry-After", "5")
        .build_for_request(&first);
    h.deliver(busy, "192.0.2.20:5060");
    h.take_requests(SipMethod::Ack);
    let events = h.take_events();
    assert!(final_result(&events, op).is_none());

    h.advance(Duration::from_secs(4));
    assert!(h.take_requests(SipMethod::Invite).is_empty());
    h.advance(Duration::from_secs(1));
    let (second, _) = h.expect_request(SipMethod::Invite);
    assert_ne!(second.branch(), first.branch());
    assert!(second.cseq().unwrap().seq > first.cseq().unwrap().seq);

    let busy = ResponseBuilder::new(500)
        .header("Retry-After", "5")
        .build_for_request(&second);
    h.deliver(busy, "192.0.2.20:5060");
    let events = h.take_events();
    let (kind, status) = final_result(&events, op).unwrap();
    assert_eq!(kind, OperationKind::Reinvite);
    assert_eq!(status.code, 500);

    let (bye, _) = h.expect_request(SipMethod::Bye);
    assert_eq!(bye.to_tag().as_deref(), Some("b1"));
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Terminating);
}

#[test]
fn test_session_refreshed_by_far_end() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    assert!(invite.headers.get("Session-Expires").is_some());
    let ok = ResponseBuilder::ok()
        .to_tag("b1")
        .header("Contact", BOB_CONTACT)
        .header("Session-Expires", "1800;refresher=uas")
        .header("Require", "timer")
        .build_for_request(&invite);
    h.deliver(ok, "192.0.2.20:5060");
    h.expect_request(SipMethod::Ack);
    h.take_events();

    // Far end refreshes halfway through the interval
    h.advance_to(Duration::from_secs(900));
    assert!(h.take_requests(SipMethod::Bye).is_empty());
    let refresh = h
        .peer_request(SipMethod::Invite, &invite, "b1", 1)
        .header("Session-Expires", "1800;refresher=uac")
        .header("Supported", "timer")
        .body(Some(common::sdp()))
        .build();
    h.deliver(refresh.clone(), "192.0.2.20:5060");
    let responses = h.take_responses();
    let ok = responses.iter().find(|r| r.status == 200).unwrap();
    assert!(ok.headers.get("Session-Expires").unwrap().contains("refresher=uac"));
    let ack = h
        .peer_request(SipMethod::Ack, &invite, "b1", 1)
        .build();
    h.deliver(ack, "192.0.2.20:5060");

    // The first interval would have run out at 1768s
    h.advance_to(Duration::from_secs(1900));
    assert!(h.take_requests(SipMethod::Bye).is_empty());
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);

    // No second refresh: the session expires and we hang up
    h.advance_to(Duration::from_secs(2700));
    assert!(!h.take_requests(SipMethod::Bye).is_empty());
    let events = h.take_events();
    assert!(indications(&events)
        .iter()
        .any(|i| matches!(i, Indication::SessionExpired)));
}

#[test]
fn test_unchanged_parameters_send_nothing() {
    let mut h = Harness::new();
    let (call, _) = h.established_call();
    let params = h.engine.call(call).unwrap().parameters().clone();

    let op = h.engine.set_parameters(call, params.clone()).unwrap();
    assert!(h.take_sent().is_empty());
    let events = h.take_events();
    let (kind, status) = final_result(&events, op).unwrap();
    assert_eq!(kind, OperationKind::SetParameters);
    assert!(status.is_success());

    let op = h
        .engine
        .set_parameters(call, params.with_session_expires(600))
        .unwrap();
    assert!(h.take_sent().is_empty());
    assert!(final_result(&h.take_events(), op).is_some());
    assert_eq!(h.engine.call(call).unwrap().parameters().session_expires, 600);
}

#[test]
fn test_peer_hangup_ends_call() {
    let mut h = Harness::new();
    let (call, invite) = h.established_call();
    let bye = h.peer_request(SipMethod::Bye, &invite, "b1", 1).build();
    h.deliver(bye, "192.0.2.20:5060");

    let responses = h.take_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 200);
    let events = h.take_events();
    assert!(indications(&events)
        .iter()
        .any(|i| matches!(i, Indication::IncomingBye)));
    let ended = h.engine.call(call).unwrap();
    assert_eq!(ended.state(), CallState::Terminated);
    assert!(ended.times().answered_at.is_some());
    assert!(ended.times().ended_at.is_some());

    h.engine.destroy(call).unwrap();
    // Kept until the INVITE transaction stops absorbing 2xx retransmissions
    h.advance(Duration::from_secs(33));
    assert!(h.engine.call(call).is_none());
}

#[test]
fn test_failed_refresh_lets_session_expire() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    answer_with_timer(&mut h, &invite, "1800;refresher=uac");
    h.expect_request(SipMethod::Ack);
    h.take_events();

    // We refresh halfway through; Bob refuses
    h.advance_to(Duration::from_secs(900));
    let (refresh, _) = h.expect_request(SipMethod::Invite);
    assert!(refresh
        .headers
        .get("Session-Expires")
        .unwrap()
        .contains("refresher=uac"));
    h.answer(&refresh, 488, "b1");
    h.take_sent();
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);

    h.advance_to(Duration::from_secs(1767));
    assert!(h.take_sent().is_empty());
    h.advance_to(Duration::from_secs(1768));
    let (bye, _) = h.expect_request(SipMethod::Bye);
    assert_eq!(bye.to_tag().as_deref(), Some("b1"));
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Terminating);
    let events = h.take_events();
    assert!(indications(&events)
        .iter()
        .any(|i| matches!(i, Indication::SessionExpired)));
}

#[test]
fn test_zero_session_interval_runs_no_timer() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    answer_with_timer(&mut h, &invite, "0;refresher=uac");
    h.expect_request(SipMethod::Ack);

    h.advance_to(Duration::from_secs(3600));
    assert!(h.take_sent().is_empty());
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
}

#[test]
fn test_tiny_session_interval_raised_to_min_se() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    answer_with_timer(&mut h, &invite, "1;refresher=uas");
    h.expect_request(SipMethod::Ack);

    // Min-SE 90 leaves Bob 60s to refresh
    h.advance_to(Duration::from_secs(59));
    assert!(h.take_sent().is_empty());
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
    h.advance_to(Duration::from_secs(60));
    h.expect_request(SipMethod::Bye);
}

#[test]
fn test_retry_waits_for_peer_reinvite_to_finish() {
    let mut h = Harness::new();
    let (call, invite) = h.established_call();
    let op = h.engine.reinvite(call, SessionOptions::default()).unwrap();
    let (first, _) = h.expect_request(SipMethod::Invite);
    let busy = ResponseBuilder::new(500)
        .header("Retry-After", "5")
        .build_for_request(&first);
    h.deliver(busy, BOB_ADDR);
    h.take_sent();

    // Bob's own re-INVITE lands while ours waits for Retry-After
    let theirs = h
        .peer_request(SipMethod::Invite, &invite, "b1", 1)
        .body(Some(sdp()))
        .build();
    h.deliver(theirs, BOB_ADDR);
    assert!(h.take_responses().iter().any(|r| r.status == 200));

    // Retry time passes but Bob has not ACKed our 2xx yet
    h.advance_to(Duration::from_secs(6));
    assert!(h.take_requests(SipMethod::Invite).is_empty());
    let ack = h.peer_request(SipMethod::Ack, &invite, "b1", 1).build();
    h.deliver(ack, BOB_ADDR);

    h.advance_to(Duration::from_secs(9));
    let (second, _) = h.expect_request(SipMethod::Invite);
    assert!(second.cseq().unwrap().seq > first.cseq().unwrap().seq);
    h.answer(&second, 200, "b1");
    h.expect_request(SipMethod::Ack);
    let events = h.take_events();
    let (kind, status) = final_result(&events, op).unwrap();
    assert_eq!(kind, OperationKind::Reinvite);
    assert_eq!(status.code, 200);
}

#[test]
fn test_reinvite_glare_backs_off_and_retries() {
    let mut h = Harness::new();
    let (call, invite) = h.established_call();
    let op = h.engine.reinvite(call, SessionOptions::default()).unwrap();
    let (first, _) = h.expect_request(SipMethod::Invite);

    // Bob's re-INVITE crosses ours
    let theirs = h
        .peer_request(SipMethod::Invite, &invite, "b1", 1)
        .body(Some(sdp()))
        .build();
    h.deliver(theirs, BOB_ADDR);
    let responses = h.take_responses();
    assert!(responses.iter().any(|r| r.status == 491));
    assert!(!responses.iter().any(|r| r.status == 200));

    h.answer(&first, 491, "b1");
    h.take_sent();
    let events = h.take_events();
    assert!(final_result(&events, op).is_none());

    // We own the Call-ID, so the wait is 2.1s to 4s
    h.advance_to(Duration::from_secs(2));
    assert!(h.take_requests(SipMethod::Invite).is_empty());
    h.advance_to(Duration::from_secs(4));
    let retries = h.take_requests(SipMethod::Invite);
    assert!(!retries.is_empty());
    let second = retries[0].0.clone();
    assert!(retries.iter().all(|(r, _)| r.branch() == second.branch()));
    assert_ne!(second.branch(), first.branch());

    h.answer(&second, 200, "b1");
    h.expect_request(SipMethod::Ack);
    let events = h.take_events();
    assert_eq!(final_result(&events, op).unwrap().1.code, 200);
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
}

#[test]
fn test_reliable_provisional_is_acknowledged_before_answer() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    let op = h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    assert!(invite.headers.get("Supported").unwrap().contains("100rel"));

    h.deliver(reliable_183(&invite, 7, "100rel"), BOB_ADDR);
    let (prack, _) = h.expect_request(SipMethod::Prack);
    let rack = format!("7 {} INVITE", invite.cseq().unwrap().seq);
    assert_eq!(prack.headers.get("RAck"), Some(rack.as_str()));
    assert_eq!(prack.to_tag().as_deref(), Some("b1"));

    // A retransmitted 183 is not acknowledged twice
    h.deliver(reliable_183(&invite, 7, "100rel"), BOB_ADDR);
    assert!(h.take_requests(SipMethod::Prack).is_empty());

    // The 2xx is held until the PRACK completes
    h.answer(&invite, 200, "b1");
    assert!(h.take_requests(SipMethod::Ack).is_empty());
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Completing);

    h.answer(&prack, 200, "b1");
    let (ack, _) = h.expect_request(SipMethod::Ack);
    assert_eq!(ack.to_tag().as_deref(), Some("b1"));
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
    let events = h.take_events();
    assert_eq!(final_result(&events, op).unwrap().1.code, 200);
}

#[test]
fn test_precondition_update_follows_prack() {
    let mut config = test_config();
    config.call.preconditions = true;
    let mut h = Harness::with_config(config);
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    assert!(invite.headers.get("Require").unwrap().contains("precondition"));

    h.deliver(reliable_183(&invite, 1, "100rel, precondition"), BOB_ADDR);
    let sent = h.take_sent();
    assert_eq!(methods(&sent), vec![SipMethod::Prack]);
    let prack = sent[0].0.as_request().unwrap().clone();
    assert!(prack.body().is_none());

    // Preconditions are confirmed with a new offer once the PRACK is done
    h.answer(&prack, 200, "b1");
    let (update, destination) = h.expect_request(SipMethod::Update);
    assert_eq!(update.to_tag().as_deref(), Some("b1"));
    assert!(update.body().is_some());
    assert_eq!(destination.host, "192.0.2.20");
    let ok = ResponseBuilder::ok()
        .to_tag("b1")
        .body(Some(sdp()))
        .build_for_request(&update);
    h.deliver(ok, BOB_ADDR);
    assert!(h.take_sent().is_empty());

    h.answer(&invite, 200, "b1");
    let (ack, _) = h.expect_request(SipMethod::Ack);
    assert!(ack.body().is_none());
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Ready);
}

#[test]
fn test_destroy_while_ringing_cancels() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    h.answer(&invite, 180, "b1");
    h.take_events();

    h.engine.destroy(call).unwrap();
    let (cancel, _) = h.expect_request(SipMethod::Cancel);
    assert_eq!(cancel.branch(), invite.branch());
    h.answer(&cancel, 200, "b1");
    h.answer(&invite, 487, "b1");
    h.expect_request(SipMethod::Ack);
    assert!(h.take_events().is_empty());

    h.advance(Duration::from_secs(33));
    assert!(h.engine.call(call).is_none());
}

#[test]
fn test_destroy_while_completing_acks_then_hangs_up() {
    let mut h = Harness::new();
    let call = h.engine.create_call(CallOptions::new(BOB));
    h.engine.start_call(call).unwrap();
    let (invite, _) = h.expect_request(SipMethod::Invite);
    h.deliver(reliable_183(&invite, 1, "100rel"), BOB_ADDR);
    let (prack, _) = h.expect_request(SipMethod::Prack);
    h.answer(&invite, 200, "b1");
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Completing);

    h.engine.destroy(call).unwrap();
    assert!(h.take_sent().is_empty());

    h.answer(&prack, 200, "b1");
    let sent = h.take_sent();
    assert_eq!(methods(&sent), vec![SipMethod::Ack, SipMethod::Bye]);
    let bye = sent[1].0.as_request().unwrap().clone();
    assert_eq!(bye.to_tag().as_deref(), Some("b1"));
    assert_eq!(h.engine.call(call).unwrap().state(), CallState::Terminating);

    h.answer(&bye, 200, "b1");
    assert!(h
        .engine
        .call(call)
        .map_or(true, |c| c.state() == CallState::Terminated));
}
