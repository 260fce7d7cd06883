use super::*;
use crate::candidate::{CandidateConfig, CandidateHostConfig};
use crate::port::PortConfig;
use crate::resolver::ResolveResponse;

use bytes::BytesMut;
use shared::TransportProtocol;
use std::net::IpAddr;
use std::time::Duration;

const A_UFRAG: &str = "aaaa";
const A_PWD: &str = "aaaaaaaaaaaaaaaaaaaaaa";
const B_UFRAG: &str = "bbbb";
const B_PWD: &str = "bbbbbbbbbbbbbbbbbbbbbb";

fn a_addr() -> SocketAddr {
    "10.0.0.1:5000".parse().unwrap()
}

fn b_addr() -> SocketAddr {
    "10.0.0.2:6000".parse().unwrap()
}

fn dead_addr() -> SocketAddr {
    "10.0.0.3:7000".parse().unwrap()
}

fn new_transport(
    addr: SocketAddr,
    ufrag: &str,
    pwd: &str,
    role: Role,
    now: Instant,
) -> Result<IceTransport> {
    let mut transport = IceTransport::new(IceConfig::default());
    transport.set_ice_role(role);
    transport.add_port(
        UdpPort::new(PortConfig::default().with_credentials(ufrag, pwd), addr)?,
        now,
    )?;
    Ok(transport)
}

fn host_of(transport: &IceTransport) -> Candidate {
    transport.ports()[0].candidates()[0].clone()
}

fn remote_host(addr: SocketAddr) -> Result<Candidate> {
    remote_host_with_priority(addr, 0)
}

fn remote_host_with_priority(addr: SocketAddr, priority: u32) -> Result<Candidate> {
    CandidateHostConfig {
        base_config: CandidateConfig {
            protocol: TransportProtocol::UDP,
            address: Some(addr),
            priority,
            ..Default::default()
        },
    }
    .new_candidate_host()
}

fn events(transport: &mut IceTransport) -> Vec<TransportEvent> {
    let mut out = vec![];
    while let Some(evt) = transport.poll_event() {
        out.push(evt);
    }
    out
}

/// Delivers what `from` sent towards `to_addr`; everything else is lost.
fn pump(from: &mut IceTransport, to: &mut IceTransport, to_addr: SocketAddr) -> Result<()> {
    while let Some(w) = from.poll_write() {
        if w.transport.peer_addr != to_addr {
            continue;
        }
        to.handle_read(TransportMessage::udp(
            w.now,
            w.transport.peer_addr,
            w.transport.local_addr,
            w.message,
        ))?;
    }
    Ok(())
}

fn run(a: &mut IceTransport, b: &mut IceTransport, from: Instant, to: Instant) -> Result<()> {
    let mut now = from;
    while now <= to {
        a.handle_timeout(now)?;
        b.handle_timeout(now)?;
        pump(a, b, b_addr())?;
        pump(b, a, a_addr())?;
        now += Duration::from_millis(10);
    }
    Ok(())
}

fn connected_pair(now: Instant) -> Result<(IceTransport, IceTransport)> {
    let mut a = new_transport(a_addr(), A_UFRAG, A_PWD, Role::Controlling, now)?;
    let mut b = new_transport(b_addr(), B_UFRAG, B_PWD, Role::Controlled, now)?;
    let (a_host, b_host) = (host_of(&a), host_of(&b));
    a.add_remote_candidate(b_host, now)?;
    b.add_remote_candidate(a_host, now)?;
    Ok((a, b))
}

#[test]
fn test_transport_selects_nominates_and_carries_data() -> Result<()> {
    //env_logger::init();
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0)?;

    let id = a.controller().connections()[0];
    let evts = events(&mut a);
    assert!(evts.contains(&TransportEvent::Port {
        local_addr: a_addr(),
        event: PortEvent::PortReady,
    }));
    assert!(evts.contains(&TransportEvent::SelectedConnectionChanged(Some(id))));
    assert_eq!(a.selected_connection_id(), Some(id));

    run(&mut a, &mut b, t0, t0 + Duration::from_millis(200))?;

    let selected = a.selected_connection().expect("selected on a");
    assert!(selected.writable());
    assert!(selected.nominated());
    assert_eq!(selected.remote_candidate().address(), b_addr());

    let selected = b.selected_connection().expect("selected on b");
    assert!(selected.remote_nominated());
    assert!(selected.writable());
    assert!(events(&mut b).iter().any(|e| matches!(
        e,
        TransportEvent::Port {
            event: PortEvent::NominationReceived(_),
            ..
        }
    )));

    let now = t0 + Duration::from_millis(300);
    a.handle_write(TransportMessage::udp(
        now,
        a_addr(),
        dead_addr(),
        BytesMut::from(&b"hello"[..]),
    ))?;
    pump(&mut a, &mut b, b_addr())?;
    let read = b.poll_read().expect("data at b");
    assert_eq!(&read.message[..], b"hello");
    assert_eq!(read.transport.peer_addr, a_addr());
    Ok(())
}

#[test]
fn test_transport_write_without_selection() -> Result<()> {
    let t0 = Instant::now();
    let mut a = new_transport(a_addr(), A_UFRAG, A_PWD, Role::Controlling, t0)?;
    assert_eq!(
        a.handle_write(TransportMessage::udp(
            t0,
            a_addr(),
            b_addr(),
            BytesMut::from(&b"hello"[..]),
        )),
        Err(Error::ErrNoSelectedConnection)
    );
    Ok(())
}

#[test]
fn test_transport_remote_candidate_is_idempotent() -> Result<()> {
    let t0 = Instant::now();
    let mut a = new_transport(a_addr(), A_UFRAG, A_PWD, Role::Controlling, t0)?;
    a.set_remote_credentials(B_UFRAG, B_PWD);

    a.add_remote_candidate(remote_host(b_addr())?, t0)?;
    a.add_remote_candidate(remote_host(b_addr())?, t0)?;
    assert_eq!(a.remote_candidates().len(), 1);
    assert_eq!(a.controller().connections().len(), 1);

    // IPv6 remotes do not pair with an IPv4 port.
    a.add_remote_candidate(remote_host("[2001:db8::1]:6000".parse()?)?, t0)?;
    assert_eq!(a.remote_candidates().len(), 2);
    assert_eq!(a.controller().connections().len(), 1);
    Ok(())
}

#[test]
fn test_transport_destroying_selected_connection() -> Result<()> {
    let t0 = Instant::now();
    let mut a = new_transport(a_addr(), A_UFRAG, A_PWD, Role::Controlling, t0)?;
    a.set_remote_credentials(B_UFRAG, B_PWD);
    a.add_remote_candidate(remote_host(b_addr())?, t0)?;
    a.add_remote_candidate(remote_host(dead_addr())?, t0)?;

    let first = a.selected_connection_id().expect("first connection selected");
    let second = a
        .controller()
        .connections()
        .iter()
        .copied()
        .find(|id| *id != first)
        .expect("second connection");
    let _ = events(&mut a);

    a.destroy_connection(first, t0)?;
    assert_eq!(
        events(&mut a),
        vec![
            TransportEvent::SelectedConnectionChanged(None),
            TransportEvent::Port {
                local_addr: a_addr(),
                event: PortEvent::ConnectionDestroyed(first),
            },
            TransportEvent::SelectedConnectionChanged(Some(second)),
        ]
    );
    assert_eq!(a.controller().connections(), &[second]);
    assert_eq!(a.selected_connection_id(), Some(second));
    assert!(a.connection(first).is_none());

    assert_eq!(
        a.destroy_connection(first, t0),
        Err(Error::ErrConnectionNotFound)
    );
    Ok(())
}

#[test]
fn test_transport_prunes_dominated_connection() -> Result<()> {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0)?;
    a.add_remote_candidate(remote_host_with_priority(dead_addr(), 100)?, t0)?;
    let dead = a
        .ports()[0]
        .connection_for(dead_addr())
        .map(|c| c.id())
        .expect("connection to the silent remote");

    run(&mut a, &mut b, t0, t0 + Duration::from_secs(1))?;

    assert!(a.connection(dead).is_none());
    assert_eq!(a.controller().connections().len(), 1);
    assert!(events(&mut a).contains(&TransportEvent::Port {
        local_addr: a_addr(),
        event: PortEvent::ConnectionDestroyed(dead),
    }));
    assert_eq!(
        a.selected_connection().map(|c| c.remote_candidate().address()),
        Some(b_addr())
    );
    Ok(())
}

#[test]
fn test_transport_routes_events() -> Result<()> {
    let t0 = Instant::now();
    let mut a = IceTransport::new(IceConfig::default());
    a.add_port(
        UdpPort::new(
            PortConfig::default().with_stun_servers(vec!["stun.example.org".to_owned()]),
            a_addr(),
        )?,
        t0,
    )?;

    let request = events(&mut a)
        .into_iter()
        .find_map(|e| match e {
            TransportEvent::Port {
                event: PortEvent::ResolveRequested(request),
                ..
            } => Some(request),
            _ => None,
        })
        .expect("lookup requested");

    // Unknown tokens are dropped.
    a.handle_event(PortInput::Resolved {
        now: t0,
        response: ResolveResponse {
            token: request.token.wrapping_add(1000),
            result: Ok(vec![]),
        },
    })?;
    assert!(a.poll_write().is_none());

    let server_ip: IpAddr = "203.0.113.1".parse()?;
    a.handle_event(PortInput::Resolved {
        now: t0,
        response: ResolveResponse {
            token: request.token,
            result: Ok(vec![server_ip]),
        },
    })?;
    let w = a.poll_write().expect("binding request");
    assert_eq!(w.transport.peer_addr, SocketAddr::new(server_ip, 3478));

    a.handle_event(PortInput::SentPacket {
        local_addr: a_addr(),
    })?;
    assert_eq!(a.port(a_addr()).map(|p| p.sent_packet_count()), Some(1));

    a.handle_event(PortInput::ReadyToSend {
        local_addr: a_addr(),
    })?;
    assert_eq!(
        events(&mut a),
        vec![TransportEvent::Port {
            local_addr: a_addr(),
            event: PortEvent::ReadyToSend,
        }]
    );

    assert_eq!(
        a.handle_event(PortInput::SentPacket {
            local_addr: b_addr(),
        }),
        Err(Error::ErrPortNotFound)
    );
    Ok(())
}

#[test]
fn test_transport_close() -> Result<()> {
    let t0 = Instant::now();
    let (mut a, _b) = connected_pair(t0)?;
    assert!(a.poll_timeout().is_some());

    a.close()?;
    a.close()?;
    assert!(a.poll_timeout().is_none());
    assert!(a.poll_event().is_none());
    assert!(a.poll_write().is_none());
    assert_eq!(a.selected_connection_id(), None);
    assert_eq!(a.handle_timeout(t0), Err(Error::ErrAlreadyClosed));
    Ok(())
}
