use super::*;
use sansio::Protocol;
use std::net::SocketAddr;
use stun::error_code::*;
use stun::xoraddr::XorMappedAddress;

const LOCAL: &str = "192.168.1.2:5000";
const SERVER: &str = "203.0.113.1:3478";

fn binding_request() -> Result<Message> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])?;
    Ok(m)
}

fn success_for(request: &Message, mapped: SocketAddr) -> Result<Message> {
    let mut m = Message::new();
    m.build(&[
        Box::new(request.clone()),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress::from(mapped)),
    ])?;
    Ok(m)
}

fn error_for(request: &Message, code: ErrorCode) -> Result<Message> {
    let mut m = Message::new();
    m.build(&[Box::new(request.clone()), Box::new(BINDING_ERROR), Box::new(code)])?;
    Ok(m)
}

fn send(
    mgr: &mut RequestManager<&'static str>,
    now: Instant,
    context: &'static str,
    policy: RetransmitPolicy,
) -> Result<Message> {
    let message = binding_request()?;
    mgr.handle_write(TransportMessage::udp(
        now,
        LOCAL.parse()?,
        SERVER.parse()?,
        StunRequest {
            message: message.clone(),
            context,
            policy,
        },
    ))?;
    Ok(message)
}

fn response(now: Instant, message: Message) -> Result<TransportMessage<Message>> {
    Ok(TransportMessage::udp(
        now,
        LOCAL.parse()?,
        SERVER.parse()?,
        message,
    ))
}

#[test]
fn test_retransmit_policy_intervals() {
    let policy = RetransmitPolicy::default();
    let want_ms = [250, 500, 1000, 2000, 4000, 8000, 8000, 8000, 8000];
    for (n, want) in want_ms.iter().enumerate() {
        assert_eq!(policy.interval(n as u32), Duration::from_millis(*want));
    }
    assert_eq!(policy.total_timeout(), Duration::from_millis(39750));

    // Intervals never shrink, even with absurd exponents.
    let mut prev = Duration::ZERO;
    for n in 0..100 {
        let cur = policy.interval(n);
        assert!(cur >= prev);
        prev = cur;
    }

    let single = RetransmitPolicy::no_retransmit(Duration::from_secs(5));
    assert_eq!(single.interval(0), Duration::from_secs(5));
    assert_eq!(single.total_timeout(), Duration::from_secs(5));

    // A cap below the initial RTO keeps the schedule flat.
    let inverted = RetransmitPolicy::default()
        .with_initial_rto(Duration::from_secs(2))
        .with_max_rto(Duration::from_secs(1))
        .with_max_retransmits(2);
    assert_eq!(inverted.interval(0), Duration::from_secs(2));
    assert_eq!(inverted.interval(5), Duration::from_secs(2));
    assert_eq!(inverted.total_timeout(), Duration::from_secs(6));
}

#[test]
fn test_retransmit_policy_deserialize() -> Result<()> {
    let policy: RetransmitPolicy =
        serde_json::from_str(r#"{"max_retransmits": 2}"#).map_err(|e| Error::Other(e.to_string()))?;
    assert_eq!(policy.max_retransmits, 2);
    assert_eq!(policy.initial_rto, Duration::from_millis(250));
    assert_eq!(policy.max_rto, Duration::from_secs(8));
    Ok(())
}

#[test]
fn test_request_success() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let request = send(&mut mgr, now, "srv", RetransmitPolicy::default())?;

    let transmit = mgr.poll_write().ok_or(Error::ErrTransactionNotExists)?;
    assert_eq!(transmit.transport.peer_addr, SERVER.parse()?);
    assert_eq!(&transmit.message[..], &request.raw[..]);
    assert!(mgr.poll_write().is_none());
    assert_eq!(mgr.poll_timeout(), Some(now + Duration::from_millis(250)));
    assert!(mgr.has_request(&request.transaction_id));

    let mapped: SocketAddr = "198.51.100.7:40000".parse()?;
    let later = now + Duration::from_millis(40);
    mgr.handle_read(response(later, success_for(&request, mapped)?)?)?;

    match mgr.poll_event() {
        Some(RequestEvent::Success {
            transaction_id,
            context,
            response,
            rtt,
        }) => {
            assert_eq!(transaction_id, request.transaction_id);
            assert_eq!(context, "srv");
            assert_eq!(rtt, Duration::from_millis(40));
            let mut xor = XorMappedAddress::default();
            xor.get_from(&response)?;
            assert_eq!(xor.socket_addr(), mapped);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert!(mgr.poll_event().is_none());
    assert!(mgr.is_empty());
    assert!(mgr.poll_timeout().is_none());

    Ok(())
}

#[test]
fn test_request_error_response() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let request = send(&mut mgr, now, "srv", RetransmitPolicy::default())?;

    mgr.handle_read(response(now, error_for(&request, CODE_UNAUTHORIZED)?)?)?;

    match mgr.poll_event() {
        Some(RequestEvent::Failure {
            reason: RequestFailure::ErrorResponse { response, .. },
            ..
        }) => {
            let mut code = ErrorCodeAttribute::default();
            code.get_from(&response)?;
            assert_eq!(code.code, CODE_UNAUTHORIZED);
        }
        other => panic!("expected error response, got {other:?}"),
    }
    assert!(mgr.is_empty());

    Ok(())
}

#[test]
fn test_unmatched_and_duplicate_responses_dropped() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let request = send(&mut mgr, now, "srv", RetransmitPolicy::default())?;
    let mapped: SocketAddr = "198.51.100.7:40000".parse()?;

    let stranger = binding_request()?;
    mgr.handle_read(response(now, success_for(&stranger, mapped)?)?)?;
    assert!(mgr.poll_event().is_none());
    assert!(mgr.has_request(&request.transaction_id));

    // Requests are never treated as responses.
    mgr.handle_read(response(now, request.clone())?)?;
    assert!(mgr.poll_event().is_none());

    let ok = success_for(&request, mapped)?;
    mgr.handle_read(response(now, ok.clone())?)?;
    mgr.handle_read(response(now, ok)?)?;
    assert!(matches!(mgr.poll_event(), Some(RequestEvent::Success { .. })));
    assert!(mgr.poll_event().is_none());

    Ok(())
}

#[test]
fn test_request_timeout_after_schedule() -> Result<()> {
    let mut mgr = RequestManager::new();
    let start = Instant::now();
    let policy = RetransmitPolicy::default();
    send(&mut mgr, start, "srv", policy)?;
    assert!(mgr.poll_write().is_some());

    let mut sends = 1;
    let mut now = start;
    while let Some(deadline) = mgr.poll_timeout() {
        assert!(deadline >= now);
        now = deadline;
        mgr.handle_timeout(now)?;
        while mgr.poll_write().is_some() {
            sends += 1;
        }
        if let Some(evt) = mgr.poll_event() {
            assert_eq!(
                evt,
                RequestEvent::Failure {
                    transaction_id: evt.transaction_id(),
                    context: "srv",
                    reason: RequestFailure::Timeout,
                }
            );
            break;
        }
    }

    assert_eq!(sends, policy.max_retransmits + 1);
    assert_eq!(now.duration_since(start), policy.total_timeout());
    assert!(mgr.is_empty());

    Ok(())
}

#[test]
fn test_no_retransmit_policy() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    send(&mut mgr, now, "ping", RetransmitPolicy::no_retransmit(Duration::from_secs(5)))?;
    assert!(mgr.poll_write().is_some());

    mgr.handle_timeout(now + Duration::from_millis(4999))?;
    assert!(mgr.poll_write().is_none());
    assert!(mgr.poll_event().is_none());

    mgr.handle_timeout(now + Duration::from_secs(5))?;
    assert!(mgr.poll_write().is_none());
    assert!(matches!(
        mgr.poll_event(),
        Some(RequestEvent::Failure {
            reason: RequestFailure::Timeout,
            ..
        })
    ));

    Ok(())
}

#[test]
fn test_rtt_measured_from_last_send() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let request = send(&mut mgr, now, "srv", RetransmitPolicy::default())?;

    let rtx = now + Duration::from_millis(250);
    mgr.handle_timeout(rtx)?;
    assert_eq!(mgr.poll_write().into_iter().count(), 1);

    mgr.handle_read(response(
        rtx + Duration::from_millis(30),
        success_for(&request, "198.51.100.7:1".parse()?)?,
    )?)?;
    match mgr.poll_event() {
        Some(RequestEvent::Success { rtt, .. }) => assert_eq!(rtt, Duration::from_millis(30)),
        other => panic!("expected success, got {other:?}"),
    }

    Ok(())
}

#[test]
fn test_duplicate_transaction_id_rejected() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let request = send(&mut mgr, now, "a", RetransmitPolicy::default())?;

    let result = mgr.send(TransportMessage::udp(
        now,
        LOCAL.parse()?,
        SERVER.parse()?,
        StunRequest {
            message: request,
            context: "b",
            policy: RetransmitPolicy::default(),
        },
    ));
    assert_eq!(result, Err(Error::ErrTransactionExists));
    assert_eq!(mgr.len(), 1);

    Ok(())
}

#[test]
fn test_network_unreachable_fails_immediately() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let request = send(&mut mgr, now, "srv", RetransmitPolicy::default())?;

    mgr.handle_event(RequestInput::SendFailed {
        transaction_id: request.transaction_id,
        kind: SendErrorKind::Other,
    })?;
    assert!(mgr.poll_event().is_none());
    assert!(mgr.has_request(&request.transaction_id));

    mgr.handle_event(RequestInput::SendFailed {
        transaction_id: request.transaction_id,
        kind: SendErrorKind::NetworkUnreachable,
    })?;
    assert_eq!(
        mgr.poll_event(),
        Some(RequestEvent::Failure {
            transaction_id: request.transaction_id,
            context: "srv",
            reason: RequestFailure::NetworkUnreachable,
        })
    );
    assert!(mgr.is_empty());

    Ok(())
}

#[test]
fn test_cancel_emits_failures_synchronously() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let a = send(&mut mgr, now, "a", RetransmitPolicy::default())?;
    send(&mut mgr, now, "b", RetransmitPolicy::default())?;
    send(&mut mgr, now, "b", RetransmitPolicy::default())?;

    assert!(mgr.has_request_where(|c| *c == "b"));
    assert_eq!(mgr.cancel_where(|c| *c == "b"), 2);
    assert!(!mgr.has_request_where(|c| *c == "b"));
    for _ in 0..2 {
        assert!(matches!(
            mgr.poll_event(),
            Some(RequestEvent::Failure {
                context: "b",
                reason: RequestFailure::Cancelled,
                ..
            })
        ));
    }

    assert!(mgr.cancel(&a.transaction_id));
    assert!(!mgr.cancel(&a.transaction_id));
    assert_eq!(mgr.cancel_all(), 0);
    assert!(matches!(
        mgr.poll_event(),
        Some(RequestEvent::Failure { context: "a", .. })
    ));
    assert!(mgr.poll_timeout().is_none());

    Ok(())
}

#[test]
fn test_close_silences_everything() -> Result<()> {
    let mut mgr = RequestManager::new();
    let now = Instant::now();
    let request = send(&mut mgr, now, "srv", RetransmitPolicy::default())?;

    mgr.close()?;
    mgr.close()?;
    assert!(mgr.poll_write().is_none());
    assert!(mgr.poll_event().is_none());
    assert!(mgr.poll_timeout().is_none());

    let result = mgr.handle_read(response(now, success_for(&request, "198.51.100.7:1".parse()?)?)?);
    assert_eq!(result, Err(Error::ErrAlreadyClosed));
    assert_eq!(
        mgr.handle_timeout(now + Duration::from_secs(60)),
        Err(Error::ErrAlreadyClosed)
    );
    assert!(send(&mut mgr, now, "late", RetransmitPolicy::default()).is_err());
    assert!(mgr.poll_event().is_none());

    Ok(())
}
