use super::*;

fn host(addr: &str) -> Result<Candidate> {
    CandidateHostConfig {
        base_config: CandidateConfig {
            address: Some(addr.parse()?),
            component: COMPONENT_RTP,
            ..Default::default()
        },
    }
    .new_candidate_host()
}

#[test]
fn test_candidate_priority() -> Result<()> {
    let tests = vec![
        (CandidateType::Host, 2130706431u32),
        (CandidateType::PeerReflexive, 1862270975),
        (CandidateType::ServerReflexive, 1694498815),
    ];

    let addr: SocketAddr = "10.0.0.1:1000".parse()?;
    for (candidate_type, want) in tests {
        let config = CandidateConfig {
            address: Some(addr),
            component: COMPONENT_RTP,
            ..Default::default()
        };
        let c = match candidate_type {
            CandidateType::Host => CandidateHostConfig {
                base_config: config,
            }
            .new_candidate_host()?,
            CandidateType::PeerReflexive => CandidatePeerReflexiveConfig {
                base_config: config,
                base_address: Some(addr),
            }
            .new_candidate_peer_reflexive()?,
            _ => CandidateServerReflexiveConfig {
                base_config: config,
                base_address: Some("192.168.0.2:1000".parse()?),
                url: "stun:stun.example.org:3478".to_owned(),
            }
            .new_candidate_server_reflexive()?,
        };
        assert_eq!(c.priority(), want, "{candidate_type}");
    }

    let c = CandidateHostConfig {
        base_config: CandidateConfig {
            address: Some(addr),
            component: COMPONENT_RTCP,
            ..Default::default()
        },
    }
    .new_candidate_host()?;
    assert_eq!(c.priority(), 2130706430);

    Ok(())
}

#[test]
fn test_candidate_priority_override() -> Result<()> {
    let c = CandidateHostConfig {
        base_config: CandidateConfig {
            address: Some("10.0.0.1:1000".parse()?),
            priority: 500,
            foundation: "4207374051".to_owned(),
            ..Default::default()
        },
    }
    .new_candidate_host()?;
    assert_eq!(c.priority(), 500);
    assert_eq!(c.foundation(), "4207374051");

    Ok(())
}

#[test]
fn test_candidate_foundation() -> Result<()> {
    // Same type, base IP and protocol share a foundation.
    let a = host("10.0.0.1:1000")?;
    let b = host("10.0.0.1:2000")?;
    assert_eq!(a.foundation(), b.foundation());

    let c = host("10.0.0.2:1000")?;
    assert_ne!(a.foundation(), c.foundation());

    // Reflexive candidates learned from different servers differ.
    let srflx = |url: &str| -> Result<Candidate> {
        CandidateServerReflexiveConfig {
            base_config: CandidateConfig {
                address: Some("203.0.113.5:6000".parse()?),
                ..Default::default()
            },
            base_address: Some("10.0.0.1:1000".parse()?),
            url: url.to_owned(),
        }
        .new_candidate_server_reflexive()
    };
    let s1 = srflx("stun:a.example.org:3478")?;
    let s2 = srflx("stun:b.example.org:3478")?;
    assert_ne!(s1.foundation(), s2.foundation());
    assert_ne!(s1.foundation(), a.foundation());

    Ok(())
}

#[test]
fn test_candidate_id_generated() -> Result<()> {
    let a = host("10.0.0.1:1000")?;
    let b = host("10.0.0.1:1000")?;
    assert!(a.id().starts_with("candidate:"));
    assert_ne!(a.id(), b.id());
    assert!(a.equal(&b));

    Ok(())
}

#[test]
fn test_candidate_missing_address() {
    let result = CandidateHostConfig::default().new_candidate_host();
    assert_eq!(result, Err(Error::ErrAddressParseFailed));
}

#[test]
fn test_candidate_marshal() -> Result<()> {
    let srflx = CandidateServerReflexiveConfig {
        base_config: CandidateConfig {
            address: Some("191.228.238.68:53991".parse()?),
            foundation: "647372371".to_owned(),
            priority: 1694498815,
            generation: 1,
            ..Default::default()
        },
        base_address: Some("192.168.0.27:53991".parse()?),
        url: String::new(),
    }
    .new_candidate_server_reflexive()?;

    assert_eq!(
        srflx.marshal(),
        "647372371 1 udp 1694498815 191.228.238.68 53991 typ srflx raddr 192.168.0.27 rport 53991 generation 1"
    );

    Ok(())
}

#[test]
fn test_candidate_unmarshal() -> Result<()> {
    let c = unmarshal_candidate(
        "candidate:647372371 1 udp 1694498815 191.228.238.68 53991 typ srflx raddr 192.168.0.27 rport 53991 generation 2 ufrag abcd",
    )?;
    assert_eq!(c.candidate_type(), CandidateType::ServerReflexive);
    assert_eq!(c.foundation(), "647372371");
    assert_eq!(c.priority(), 1694498815);
    assert_eq!(c.address(), "191.228.238.68:53991".parse()?);
    assert_eq!(c.related_address(), Some("192.168.0.27:53991".parse()?));
    assert_eq!(c.generation(), 2);
    assert_eq!(c.username(), "abcd");
    assert_eq!(c.network_cost(), 0);

    let again = unmarshal_candidate(&c.marshal())?;
    assert!(again.equal(&c));
    assert_eq!(again.foundation(), c.foundation());

    let h = unmarshal_candidate("1 1 UDP 2130706431 fe80::1 9 typ host network-cost 900")?;
    assert_eq!(h.network_cost(), 900);
    assert_eq!(h.candidate_type(), CandidateType::Host);
    assert!(h.address().is_ipv6());

    Ok(())
}

#[test]
fn test_candidate_unmarshal_errors() {
    let tests = vec![
        "",
        "1 1 udp 100 10.0.0.1 9",
        "1 1 sctp 100 10.0.0.1 9 typ host",
        "1 1 udp 100 10.0.0.1 9 typ bogus",
        "1 1 udp 100 10.0.0.1 9 kind host",
        "1 1 udp 100 10.0.0.1 9 typ srflx raddr 10.0.0.2",
        "1 1 udp 100 10.0.0.1 9 typ srflx raddr 10.0.0.2 generation 0",
        "1 1 udp 100 not-an-ip 9 typ host",
    ];

    for raw in tests {
        assert!(unmarshal_candidate(raw).is_err(), "{raw:?} should fail");
    }
}

#[test]
fn test_candidate_compatibility() -> Result<()> {
    let v4 = host("10.0.0.1:1000")?;
    let v4b = host("10.0.0.9:1000")?;
    let v6 = host("[::1]:1000")?;
    let rtcp = CandidateHostConfig {
        base_config: CandidateConfig {
            address: Some("10.0.0.1:1001".parse()?),
            component: COMPONENT_RTCP,
            ..Default::default()
        },
    }
    .new_candidate_host()?;

    assert!(v4.is_compatible_with(&v4b));
    assert!(!v4.is_compatible_with(&v6));
    assert!(!v4.is_compatible_with(&rtcp));

    Ok(())
}

#[test]
fn test_pair_priority() {
    assert_eq!(pair_priority(0, 0), 0);
    assert_eq!(pair_priority(1, 0), 3);
    assert_eq!(pair_priority(0, 1), 2);
    assert_eq!(pair_priority(1, 1), (1 << 32) - 1 + 2);
    assert_eq!(
        pair_priority(u32::MAX, u32::MAX),
        ((1u64 << 32) - 1) * u64::from(u32::MAX) + 2 * u64::from(u32::MAX)
    );
}
