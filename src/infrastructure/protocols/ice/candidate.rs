//! ICE candidates exchanged between peer links.
//!
//! Candidates travel over signaling as [`CandidateDescriptor`]s whose
//! `candidate` field holds an RFC 8839 attribute value:
//!
//! ```text
//! candidate:<foundation> <component> <transport> <priority> <ip> <port> typ <kind> [raddr <ip> rport <port>]
//! ```
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::signaling::CandidateDescriptor;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

const ATTRIBUTE_PREFIX: &str = "candidate:";

/// Where a candidate address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    /// Learned from a STUN binding response
    ServerReflexive,
    /// Learned from an inbound connectivity check
    PeerReflexive,
    /// Allocated on a TURN server
    Relay,
}

impl CandidateType {
    /// RFC 8445 section 5.1.2.2 recommended type preference
    pub fn priority_preference(&self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }

    /// Whether the candidate must carry the base it was derived from
    pub fn is_derived(&self) -> bool {
        !matches!(self, Self::Host)
    }
}

impl FromStr for CandidateType {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        [Self::Host, Self::ServerReflexive, Self::PeerReflexive, Self::Relay]
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CallError::Codec(format!("unknown candidate type '{}'", s)))
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else {
            Err(CallError::Codec(format!("unsupported candidate transport '{}'", s)))
        }
    }
}

/// A single transport address a peer may be reachable on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    /// 1 for RTP, 2 for RTCP when not multiplexed
    pub component: u16,
    pub transport: TransportProtocol,
    pub priority: u32,
    pub address: SocketAddr,
    pub candidate_type: CandidateType,
    pub related_address: Option<SocketAddr>,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    /// Builds a UDP candidate for the first media section
    pub fn new(candidate_type: CandidateType, address: SocketAddr, component: u16) -> Self {
        Self {
            foundation: foundation_for(candidate_type, address.ip(), TransportProtocol::Udp),
            component,
            transport: TransportProtocol::Udp,
            priority: Self::compute_priority(candidate_type, component),
            address,
            candidate_type,
            related_address: None,
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    pub fn with_related_address(mut self, base: SocketAddr) -> Self {
        self.related_address = Some(base);
        self
    }

    /// RFC 8445 section 5.1.2.1 with the maximum local preference
    pub fn compute_priority(candidate_type: CandidateType, component: u16) -> u32 {
        const LOCAL_PREFERENCE: u32 = u16::MAX as u32;
        let component = u32::from(component.clamp(1, 256));
        (candidate_type.priority_preference() << 24) | (LOCAL_PREFERENCE << 8) | (256 - component)
    }

    /// Attribute value without the `a=` prefix
    pub fn to_sdp(&self) -> String {
        let mut fields = vec![
            format!("{}{}", ATTRIBUTE_PREFIX, self.foundation),
            self.component.to_string(),
            self.transport.as_str().to_string(),
            self.priority.to_string(),
            self.address.ip().to_string(),
            self.address.port().to_string(),
            "typ".to_string(),
            self.candidate_type.as_str().to_string(),
        ];
        if let Some(base) = self.related_address {
            fields.extend([
                "raddr".to_string(),
                base.ip().to_string(),
                "rport".to_string(),
                base.port().to_string(),
            ]);
        }
        fields.join(" ")
    }

    /// Accepts the attribute value with or without a leading `a=`
    pub fn from_sdp(line: &str) -> Result<Self> {
        let reject = |why: &str| CallError::Codec(format!("bad candidate '{}': {}", line.trim(), why));

        let body = line.trim();
        let body = body.strip_prefix("a=").unwrap_or(body);
        let body = body
            .strip_prefix(ATTRIBUTE_PREFIX)
            .ok_or_else(|| reject("missing candidate: prefix"))?;

        let mut fields = body.split_ascii_whitespace();
        let mut next = |what: &str| fields.next().ok_or_else(|| reject(&format!("missing {}", what)));

        let foundation = next("foundation")?.to_string();
        let component: u16 = next("component")?.parse().map_err(|_| reject("component is not a number"))?;
        let transport: TransportProtocol = next("transport")?.parse()?;
        let priority: u32 = next("priority")?.parse().map_err(|_| reject("priority is not a number"))?;
        let address = socket_addr(next("address")?, next("port")?).ok_or_else(|| reject("bad address"))?;
        if next("typ")? != "typ" {
            return Err(reject("expected typ"));
        }
        let candidate_type: CandidateType = next("candidate type")?.parse()?;

        // Extensions come as name/value pairs; only the related address matters here.
        let mut raddr = None;
        let mut rport = None;
        let rest: Vec<&str> = fields.collect();
        for pair in rest.chunks(2) {
            match pair {
                ["raddr", value] => raddr = Some(*value),
                ["rport", value] => rport = Some(*value),
                _ => {}
            }
        }
        let related_address = match (raddr, rport) {
            (Some(ip), Some(port)) => Some(socket_addr(ip, port).ok_or_else(|| reject("bad related address"))?),
            _ => None,
        };

        Ok(Self {
            foundation,
            component,
            transport,
            priority,
            address,
            candidate_type,
            related_address,
            sdp_mid: None,
            sdp_m_line_index: None,
        })
    }

    /// Validates a candidate received over signaling
    pub fn from_descriptor(descriptor: &CandidateDescriptor) -> Result<Self> {
        Ok(Self {
            sdp_mid: descriptor.sdp_mid.clone(),
            sdp_m_line_index: descriptor.sdp_m_line_index,
            ..Self::from_sdp(&descriptor.candidate)?
        })
    }

    pub fn to_descriptor(&self) -> CandidateDescriptor {
        CandidateDescriptor {
            candidate: self.to_sdp(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_m_line_index: self.sdp_m_line_index,
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sdp())
    }
}

/// Same type, base IP and transport share a foundation
fn foundation_for(candidate_type: CandidateType, base: IpAddr, transport: TransportProtocol) -> String {
    let digest = Sha256::new()
        .chain_update(candidate_type.as_str())
        .chain_update(base.to_string())
        .chain_update(transport.as_str())
        .finalize();
    hex::encode(&digest[..4])
}

fn socket_addr(ip: &str, port: &str) -> Option<SocketAddr> {
    Some(SocketAddr::new(ip.parse().ok()?, port.parse().ok()?))
}
