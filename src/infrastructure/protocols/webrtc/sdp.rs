//! Session descriptions carried in Offer and Answer messages.
//!
//! Only the subset a call needs is modelled: one audio section, an optional
//! video section, BUNDLE, ICE credentials, DTLS fingerprints and inline
//! candidates. Unknown lines are skipped when parsing.
use crate::domain::call::value_object::CallKind;
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::infrastructure::protocols::ice::candidate::IceCandidate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

const SECURE_AVPF: &str = "UDP/TLS/RTP/SAVPF";
/// Placeholder port used when candidates are trickled
const DISCARD_PORT: u16 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Raw SDP text plus its role in the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }

    pub fn parse(&self) -> Result<WebRtcSdp> {
        WebRtcSdp::from_sdp_string(&self.sdp, self.sdp_type)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.sdp_type.as_str(), self.sdp.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    const ALL: [Self; 4] = [Self::SendRecv, Self::SendOnly, Self::RecvOnly, Self::Inactive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(attribute: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == attribute)
    }

    /// Direction an answerer uses in response to this one
    pub fn reversed(self) -> Self {
        match self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Application,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Application => "application",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        [Self::Audio, Self::Video, Self::Application]
            .into_iter()
            .find(|t| t.as_str() == token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCodec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    /// `a=fmtp` parameters
    pub parameters: BTreeMap<String, String>,
}

impl RtpCodec {
    pub fn new(payload_type: u8, name: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            payload_type,
            name: name.into(),
            clock_rate,
            channels: None,
            parameters: BTreeMap::new(),
        }
    }

    fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    /// Codecs offered for a section, in preference order
    pub fn defaults_for(media_type: MediaType) -> Vec<Self> {
        match media_type {
            MediaType::Audio => vec![
                Self::new(111, "opus", 48_000)
                    .with_channels(2)
                    .with_parameter("minptime", "10")
                    .with_parameter("useinbandfec", "1"),
                Self::new(0, "PCMU", 8_000),
            ],
            MediaType::Video => vec![
                Self::new(96, "VP8", 90_000),
                Self::new(102, "H264", 90_000).with_parameter("profile-level-id", "42e01f"),
            ],
            MediaType::Application => Vec::new(),
        }
    }

    /// `<pt> <name>/<rate>[/<channels>]`
    pub fn to_rtpmap(&self) -> String {
        let mut value = format!("{} {}/{}", self.payload_type, self.name, self.clock_rate);
        if let Some(channels) = self.channels {
            let _ = write!(value, "/{}", channels);
        }
        value
    }

    pub fn from_rtpmap(value: &str) -> Option<Self> {
        let (payload_type, encoding) = value.split_once(' ')?;
        let mut parts = encoding.splitn(3, '/');
        let mut codec = Self::new(payload_type.parse().ok()?, parts.next()?, parts.next()?.parse().ok()?);
        codec.channels = parts.next().and_then(|c| c.parse().ok());
        Some(codec)
    }

    fn fmtp(&self) -> Option<String> {
        if self.parameters.is_empty() {
            return None;
        }
        let joined = self
            .parameters
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(";");
        Some(format!("{} {}", self.payload_type, joined))
    }
}

#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub port: u16,
    pub protocol: String,
    pub codecs: Vec<RtpCodec>,
    pub direction: MediaDirection,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_fingerprint: Option<DtlsFingerprint>,
    pub dtls_setup: Option<DtlsSetup>,
    pub rtcp_mux: bool,
    pub mid: Option<String>,
}

impl MediaDescription {
    pub fn new(media_type: MediaType, port: u16) -> Self {
        Self {
            media_type,
            port,
            protocol: SECURE_AVPF.to_string(),
            codecs: Vec::new(),
            direction: MediaDirection::SendRecv,
            ice_ufrag: None,
            ice_pwd: None,
            ice_candidates: Vec::new(),
            dtls_fingerprint: None,
            dtls_setup: None,
            rtcp_mux: true,
            mid: None,
        }
    }

    /// A bundled section sharing one set of transport credentials
    fn bundled(media_type: MediaType, mid: Option<String>, transport: &TransportParams, setup: DtlsSetup) -> Self {
        Self {
            mid,
            ice_ufrag: Some(transport.ufrag.clone()),
            ice_pwd: Some(transport.pwd.clone()),
            dtls_fingerprint: Some(transport.fingerprint.clone()),
            dtls_setup: Some(setup),
            ..Self::new(media_type, DISCARD_PORT)
        }
    }

    fn write_to(&self, out: &mut String) {
        let formats: Vec<String> = self.codecs.iter().map(|c| c.payload_type.to_string()).collect();
        push_line(out, 'm', format_args!("{} {} {} {}", self.media_type.as_str(), self.port, self.protocol, formats.join(" ")));
        push_line(out, 'c', format_args!("IN IP4 0.0.0.0"));

        if let Some(mid) = &self.mid {
            push_line(out, 'a', format_args!("mid:{}", mid));
        }
        push_line(out, 'a', format_args!("{}", self.direction.as_str()));
        if self.rtcp_mux {
            push_line(out, 'a', format_args!("rtcp-mux"));
        }
        if let (Some(ufrag), Some(pwd)) = (&self.ice_ufrag, &self.ice_pwd) {
            push_line(out, 'a', format_args!("ice-ufrag:{}", ufrag));
            push_line(out, 'a', format_args!("ice-pwd:{}", pwd));
        }
        if let Some(fingerprint) = &self.dtls_fingerprint {
            push_line(out, 'a', format_args!("fingerprint:{}", fingerprint.to_sdp()));
        }
        if let Some(setup) = self.dtls_setup {
            push_line(out, 'a', format_args!("setup:{}", setup.as_str()));
        }
        for codec in &self.codecs {
            push_line(out, 'a', format_args!("rtpmap:{}", codec.to_rtpmap()));
            if let Some(fmtp) = codec.fmtp() {
                push_line(out, 'a', format_args!("fmtp:{}", fmtp));
            }
        }
        for candidate in &self.ice_candidates {
            push_line(out, 'a', format_args!("{}", candidate.to_sdp()));
        }
    }

    fn apply_attribute(&mut self, name: &str, value: &str, raw: &str) -> Result<()> {
        match name {
            "mid" => self.mid = Some(value.to_string()),
            "rtcp-mux" => self.rtcp_mux = true,
            "ice-ufrag" => self.ice_ufrag = Some(value.to_string()),
            "ice-pwd" => self.ice_pwd = Some(value.to_string()),
            "setup" => self.dtls_setup = DtlsSetup::parse(value),
            "fingerprint" => {
                self.dtls_fingerprint = value
                    .split_once(' ')
                    .map(|(algorithm, digest)| DtlsFingerprint::new(algorithm, digest));
            }
            "rtpmap" => self.codecs.extend(RtpCodec::from_rtpmap(value)),
            "fmtp" => self.apply_fmtp(value),
            "candidate" => self.ice_candidates.push(IceCandidate::from_sdp(raw)?),
            flag => {
                if let Some(direction) = MediaDirection::parse(flag) {
                    self.direction = direction;
                }
            }
        }
        Ok(())
    }

    fn apply_fmtp(&mut self, value: &str) {
        let Some((payload_type, params)) = value.split_once(' ') else {
            return;
        };
        let Some(codec) = self
            .codecs
            .iter_mut()
            .find(|c| c.payload_type.to_string() == payload_type)
        else {
            return;
        };
        for param in params.split(';') {
            if let Some((key, val)) = param.trim().split_once('=') {
                codec.parameters.insert(key.to_string(), val.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            value: value.into(),
        }
    }

    pub fn sha256(value: impl Into<String>) -> Self {
        Self::new("sha-256", value)
    }

    pub fn to_sdp(&self) -> String {
        format!("{} {}", self.algorithm, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlsSetup {
    Active,
    Passive,
    Actpass,
}

impl DtlsSetup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Passive => "passive",
            Self::Actpass => "actpass",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [Self::Active, Self::Passive, Self::Actpass]
            .into_iter()
            .find(|s| s.as_str() == value)
    }
}

/// Parsed form of a session description
#[derive(Debug, Clone)]
pub struct WebRtcSdp {
    pub sdp_type: SdpType,
    pub session_id: String,
    pub session_version: u64,
    pub origin_username: String,
    pub origin_address: String,
    pub session_name: String,
    pub media_descriptions: Vec<MediaDescription>,
    pub bundle_group: Option<Vec<String>>,
}

impl WebRtcSdp {
    pub fn new(sdp_type: SdpType) -> Self {
        Self {
            sdp_type,
            session_id: rand::random::<u32>().to_string(),
            session_version: 1,
            origin_username: "-".to_string(),
            origin_address: "127.0.0.1".to_string(),
            session_name: "-".to_string(),
            media_descriptions: Vec::new(),
            bundle_group: None,
        }
    }

    pub fn add_media(&mut self, media: MediaDescription) {
        self.media_descriptions.push(media);
    }

    /// Groups every section that has a mid
    pub fn enable_bundle(&mut self) {
        let mids: Vec<String> = self.media_descriptions.iter().filter_map(|m| m.mid.clone()).collect();
        self.bundle_group = (!mids.is_empty()).then_some(mids);
    }

    pub fn has_media(&self, media_type: MediaType) -> bool {
        self.media_descriptions.iter().any(|m| m.media_type == media_type)
    }

    /// A description with a video section is a video call
    pub fn call_kind(&self) -> CallKind {
        if self.has_media(MediaType::Video) {
            CallKind::Video
        } else {
            CallKind::Voice
        }
    }

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.media_descriptions.iter().find_map(|m| m.ice_ufrag.as_deref())
    }

    pub fn to_sdp_string(&self) -> String {
        let mut out = String::new();
        push_line(&mut out, 'v', format_args!("0"));
        push_line(
            &mut out,
            'o',
            format_args!(
                "{} {} {} IN IP4 {}",
                self.origin_username, self.session_id, self.session_version, self.origin_address
            ),
        );
        push_line(&mut out, 's', format_args!("{}", self.session_name));
        push_line(&mut out, 't', format_args!("0 0"));
        if let Some(mids) = &self.bundle_group {
            push_line(&mut out, 'a', format_args!("group:BUNDLE {}", mids.join(" ")));
        }
        for media in &self.media_descriptions {
            media.write_to(&mut out);
        }
        out
    }

    /// Requires `v=0` and at least one `m=` section
    pub fn from_sdp_string(text: &str, sdp_type: SdpType) -> Result<Self> {
        let mut parsed = Self::new(sdp_type);
        let mut version_seen = false;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (kind, value) = line
                .split_once('=')
                .filter(|(kind, _)| kind.len() == 1)
                .ok_or_else(|| negotiation(format!("not an SDP line: '{}'", line)))?;

            match kind {
                "v" if value == "0" => version_seen = true,
                "v" => return Err(negotiation(format!("SDP version {} is not supported", value))),
                "o" => parsed.apply_origin(value),
                "s" => parsed.session_name = value.to_string(),
                "m" => parsed.add_media(parse_media_line(value)?),
                "a" => {
                    let (name, attr) = value.split_once(':').unwrap_or((value, ""));
                    match parsed.media_descriptions.last_mut() {
                        Some(media) => media.apply_attribute(name, attr, line)?,
                        None if name == "group" => {
                            if let Some(mids) = attr.strip_prefix("BUNDLE") {
                                parsed.bundle_group = Some(mids.split_whitespace().map(String::from).collect());
                            }
                        }
                        None => {}
                    }
                }
                _ => {}
            }
        }

        if !version_seen {
            return Err(negotiation("missing v=0".to_string()));
        }
        if parsed.media_descriptions.is_empty() {
            return Err(negotiation("no m= sections".to_string()));
        }
        Ok(parsed)
    }

    fn apply_origin(&mut self, value: &str) {
        let fields: Vec<&str> = value.split_whitespace().collect();
        if let [username, session_id, version, _net, _addr_type, address, ..] = fields[..] {
            self.origin_username = username.to_string();
            self.session_id = session_id.to_string();
            self.session_version = version.parse().unwrap_or_default();
            self.origin_address = address.to_string();
        }
    }
}

fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let mut fields = value.split_whitespace();
    let (Some(media), Some(port), Some(protocol)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(negotiation(format!("short media line 'm={}'", value)));
    };
    let media_type = MediaType::parse(media).ok_or_else(|| negotiation(format!("unsupported media '{}'", media)))?;
    let port = port
        .parse()
        .map_err(|_| negotiation(format!("bad port '{}' in media line", port)))?;

    Ok(MediaDescription {
        protocol: protocol.to_string(),
        rtcp_mux: false,
        ..MediaDescription::new(media_type, port)
    })
}

fn push_line(out: &mut String, kind: char, value: fmt::Arguments<'_>) {
    let _ = write!(out, "{}={}\r\n", kind, value);
}

fn negotiation(message: String) -> CallError {
    CallError::Negotiation(message)
}

struct TransportParams {
    ufrag: String,
    pwd: String,
    fingerprint: DtlsFingerprint,
}

/// Offer with an audio section, plus video for video calls
pub fn create_offer(kind: CallKind, ice_ufrag: String, ice_pwd: String, fingerprint: DtlsFingerprint) -> WebRtcSdp {
    let transport = TransportParams { ufrag: ice_ufrag, pwd: ice_pwd, fingerprint };
    let mut sections = vec![MediaType::Audio];
    if kind.has_video() {
        sections.push(MediaType::Video);
    }

    let mut offer = WebRtcSdp::new(SdpType::Offer);
    for (index, media_type) in sections.into_iter().enumerate() {
        let mut media = MediaDescription::bundled(media_type, Some(index.to_string()), &transport, DtlsSetup::Actpass);
        media.codecs = RtpCodec::defaults_for(media_type);
        offer.add_media(media);
    }
    offer.enable_bundle();
    offer
}

/// Answer accepting every section of `remote` with its codecs
pub fn create_answer(remote: &WebRtcSdp, ice_ufrag: String, ice_pwd: String, fingerprint: DtlsFingerprint) -> WebRtcSdp {
    let transport = TransportParams { ufrag: ice_ufrag, pwd: ice_pwd, fingerprint };

    let mut answer = WebRtcSdp::new(SdpType::Answer);
    for offered in &remote.media_descriptions {
        let mut media = MediaDescription::bundled(offered.media_type, offered.mid.clone(), &transport, DtlsSetup::Active);
        media.direction = offered.direction.reversed();
        media.codecs = offered.codecs.clone();
        answer.add_media(media);
    }
    answer.enable_bundle();
    answer
}
