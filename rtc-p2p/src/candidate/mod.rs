#[cfg(test)]
mod candidate_test;

use crc::{CRC_32_ISCSI, Crc};
use serde::{Deserialize, Serialize};
use shared::TransportProtocol;
use shared::error::*;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::rand::generate_cand_id;

pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Indicates that the candidate is used for RTP.
pub const COMPONENT_RTP: u16 = 1;
/// Indicates that the candidate is used for RTCP.
pub const COMPONENT_RTCP: u16 = 2;

/// Represents the type of candidate `CandidateType` enum.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{s}")
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | CandidateType::Unspecified => 0,
        }
    }

    fn from_typ(typ: &str) -> Result<Self> {
        match typ {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(Error::Other(format!(
                "{:?} ({})",
                Error::ErrUnknownCandidateType,
                typ
            ))),
        }
    }
}

/// RFC 5245 - 5.7.2.  Computing Pair Priority and Ordering Pairs
/// Let G be the priority for the candidate provided by the controlling
/// agent.  Let D be the priority for the candidate provided by the
/// controlled agent.
/// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
pub fn pair_priority(g: u32, d: u32) -> u64 {
    // 1<<32 overflows uint32; and if both g && d are
    // maxUint32, this result would overflow uint64
    ((1 << 32_u64) - 1) * u64::from(std::cmp::min(g, d))
        + 2 * u64::from(std::cmp::max(g, d))
        + u64::from(g > d)
}

/// Fields shared by every kind of candidate.
#[derive(Default, Debug, Clone)]
pub struct CandidateConfig {
    pub candidate_id: String,
    pub protocol: TransportProtocol,
    pub address: Option<SocketAddr>,
    pub component: u16,
    pub priority: u32,
    pub foundation: String,
    pub network_name: String,
    pub network_cost: u16,
    pub generation: u32,
    pub username: String,
    pub password: String,
}

/// The config required to create a new host candidate.
#[derive(Default, Debug, Clone)]
pub struct CandidateHostConfig {
    pub base_config: CandidateConfig,
}

impl CandidateHostConfig {
    /// Creates a new host candidate. The base of a host candidate is itself.
    pub fn new_candidate_host(self) -> Result<Candidate> {
        let address = self.base_config.address.ok_or(Error::ErrAddressParseFailed)?;
        Ok(Candidate::new(
            self.base_config,
            CandidateType::Host,
            address,
            address,
            None,
            String::new(),
        ))
    }
}

/// The config required to create a new server reflexive candidate.
#[derive(Default, Debug, Clone)]
pub struct CandidateServerReflexiveConfig {
    pub base_config: CandidateConfig,
    /// Local socket address the mapping was learned through.
    pub base_address: Option<SocketAddr>,
    /// STUN server the mapping was learned from.
    pub url: String,
}

impl CandidateServerReflexiveConfig {
    /// Creates a new server reflexive candidate.
    pub fn new_candidate_server_reflexive(self) -> Result<Candidate> {
        let address = self.base_config.address.ok_or(Error::ErrAddressParseFailed)?;
        let base = self.base_address.ok_or(Error::ErrAddressParseFailed)?;
        Ok(Candidate::new(
            self.base_config,
            CandidateType::ServerReflexive,
            address,
            base,
            Some(base),
            self.url,
        ))
    }
}

/// The config required to create a new peer reflexive candidate.
#[derive(Default, Debug, Clone)]
pub struct CandidatePeerReflexiveConfig {
    pub base_config: CandidateConfig,
    pub base_address: Option<SocketAddr>,
}

impl CandidatePeerReflexiveConfig {
    /// Creates a new peer reflexive candidate.
    pub fn new_candidate_peer_reflexive(self) -> Result<Candidate> {
        let address = self.base_config.address.ok_or(Error::ErrAddressParseFailed)?;
        let base = self.base_address.unwrap_or(address);
        let related = self.base_address;
        Ok(Candidate::new(
            self.base_config,
            CandidateType::PeerReflexive,
            address,
            base,
            related,
            String::new(),
        ))
    }
}

/// A discovered transport address and its metadata.
///
/// Candidates are immutable once created; a network change produces a new
/// `Candidate` rather than mutating an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    id: String,
    candidate_type: CandidateType,
    protocol: TransportProtocol,
    component: u16,
    address: SocketAddr,
    base_address: SocketAddr,
    related_address: Option<SocketAddr>,
    url: String,

    foundation: String,
    priority: u32,

    network_name: String,
    network_cost: u16,
    generation: u32,

    username: String,
    password: String,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.protocol.as_str(),
            self.candidate_type,
            self.address
        )?;
        if let Some(related_address) = self.related_address {
            write!(f, " related {related_address}")?;
        }
        Ok(())
    }
}

impl Candidate {
    fn new(
        config: CandidateConfig,
        candidate_type: CandidateType,
        address: SocketAddr,
        base_address: SocketAddr,
        related_address: Option<SocketAddr>,
        url: String,
    ) -> Self {
        let id = if config.candidate_id.is_empty() {
            generate_cand_id()
        } else {
            config.candidate_id
        };

        let mut c = Candidate {
            id,
            candidate_type,
            protocol: config.protocol,
            component: if config.component == 0 {
                COMPONENT_RTP
            } else {
                config.component
            },
            address,
            base_address,
            related_address,
            url,
            foundation: config.foundation,
            priority: config.priority,
            network_name: config.network_name,
            network_cost: config.network_cost,
            generation: config.generation,
            username: config.username,
            password: config.password,
        };

        if c.foundation.is_empty() {
            c.foundation = c.compute_foundation();
        }
        if c.priority == 0 {
            c.priority = c.compute_priority();
        }
        c
    }

    fn compute_foundation(&self) -> String {
        let mut buf = vec![];
        buf.extend_from_slice(self.candidate_type.to_string().as_bytes());
        buf.extend_from_slice(self.base_address.ip().to_string().as_bytes());
        buf.extend_from_slice(self.protocol.as_str().as_bytes());
        buf.extend_from_slice(self.url.as_bytes());

        let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);

        format!("{checksum}")
    }

    fn compute_priority(&self) -> u32 {
        // The local preference MUST be an integer from 0 (lowest preference) to
        // 65535 (highest preference) inclusive.  When there is only a single IP
        // address, this value SHOULD be set to 65535.
        (1 << 24) * u32::from(self.candidate_type.preference())
            + (1 << 8) * u32::from(DEFAULT_LOCAL_PREFERENCE)
            + (256 - u32::from(self.component.min(256)))
    }

    /// Returns Candidate ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    /// Returns candidate type.
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    /// Returns candidate component.
    pub fn component(&self) -> u16 {
        self.component
    }

    /// Transport address of the candidate.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Local socket address this candidate sends from.
    pub fn base_address(&self) -> SocketAddr {
        self.base_address
    }

    pub fn related_address(&self) -> Option<SocketAddr> {
        self.related_address
    }

    /// STUN server URL a reflexive candidate was learned from, empty otherwise.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Priority per RFC 8445 section 5.1.2, unless overridden at creation.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn network_cost(&self) -> u16 {
        self.network_cost
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Whether the two candidates could form a pair: same component,
    /// transport protocol and address family.
    pub fn is_compatible_with(&self, other: &Candidate) -> bool {
        self.component == other.component
            && self.protocol == other.protocol
            && self.address.is_ipv4() == other.address.is_ipv4()
    }

    /// Used to compare two candidates regardless of id and credentials.
    pub fn equal(&self, other: &Candidate) -> bool {
        self.candidate_type == other.candidate_type
            && self.protocol == other.protocol
            && self.address == other.address
            && self.base_address == other.base_address
            && self.related_address == other.related_address
    }

    /// Returns a copy carrying different credentials. Every other field is kept.
    pub fn with_credentials(&self, username: &str, password: &str) -> Self {
        let mut c = self.clone();
        c.username = username.to_owned();
        c.password = password.to_owned();
        c
    }

    /// Returns a copy on a network of a different cost. Priority and
    /// foundation are kept.
    pub fn with_network_cost(&self, network_cost: u16) -> Self {
        let mut c = self.clone();
        c.network_cost = network_cost;
        c
    }

    /// Returns the string representation of the ICE candidate.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol.as_str(),
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type
        );

        if let Some(related_address) = self.related_address {
            val += format!(
                " raddr {} rport {}",
                related_address.ip(),
                related_address.port(),
            )
            .as_str();
        }

        val += format!(" generation {}", self.generation).as_str();
        if !self.username.is_empty() {
            val += format!(" ufrag {}", self.username).as_str();
        }
        if self.network_cost != 0 {
            val += format!(" network-cost {}", self.network_cost).as_str();
        }

        val
    }
}

/// Creates a Candidate from its string representation.
///
/// The optional `candidate:` prefix is accepted. Unknown extension
/// attributes are skipped.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let raw = raw.strip_prefix("candidate:").unwrap_or(raw);
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::Other(format!(
            "attribute too short for ICE candidate ({})",
            split.len()
        )));
    }

    let foundation = split[0].to_owned();
    let component: u16 = split[1].parse()?;
    let protocol = match split[2].to_ascii_lowercase().as_str() {
        "udp" => TransportProtocol::UDP,
        "tcp" => TransportProtocol::TCP,
        other => {
            return Err(Error::Other(format!("unknown protocol {other}")));
        }
    };
    let priority: u32 = split[3].parse()?;
    let ip: IpAddr = split[4].parse()?;
    let port: u16 = split[5].parse()?;
    if split[6] != "typ" {
        return Err(Error::Other(format!("expected typ, got {}", split[6])));
    }
    let candidate_type = CandidateType::from_typ(split[7])?;

    let mut rel_addr: Option<IpAddr> = None;
    let mut rel_port: Option<u16> = None;
    let mut generation = 0;
    let mut username = String::new();
    let mut network_cost = 0;

    for pair in split[8..].chunks(2) {
        let [key, value] = pair else {
            return Err(Error::Other(format!(
                "extension attribute {} has no value",
                pair[0]
            )));
        };
        match *key {
            "raddr" => rel_addr = Some(value.parse()?),
            "rport" => rel_port = Some(value.parse()?),
            "generation" => generation = value.parse()?,
            "ufrag" => username = (*value).to_owned(),
            "network-cost" => network_cost = value.parse()?,
            _ => log::trace!("skipping candidate extension {key}"),
        }
    }

    let related_address = match (rel_addr, rel_port) {
        (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
        (None, None) => None,
        _ => {
            return Err(Error::Other(
                "raddr and rport must appear together".to_owned(),
            ));
        }
    };

    let address = SocketAddr::new(ip, port);
    let config = CandidateConfig {
        protocol,
        address: Some(address),
        component,
        priority,
        foundation,
        network_cost,
        generation,
        username,
        ..Default::default()
    };

    Ok(Candidate::new(
        config,
        candidate_type,
        address,
        related_address.unwrap_or(address),
        related_address,
        String::new(),
    ))
}
