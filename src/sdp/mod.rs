//! The session description product consumed by the peer connection.
//!
//! Only the attribute subset the transport stack needs is modeled: media
//! sections keyed by mid, payload-type maps, SSRC records, SCTP ports, ICE
//! credentials, the DTLS fingerprint and the setup role. The full SDP
//! grammar stays out of scope; unknown lines are ignored on parse.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::utils::{explode, implode};

/// The literal type string exchanged next to the SDP blob.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            "pranswer" => Ok(SdpType::Pranswer),
            "rollback" => Ok(SdpType::Rollback),
            _ => Err(Error::ErrInvalidArgument(format!("unknown SDP type: {s}"))),
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// The direction as seen from the remote side.
    pub fn reversed(&self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }
}

/// DTLS setup role attribute, RFC 5763.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum SetupRole {
    #[default]
    ActPass,
    Active,
    Passive,
}

impl SetupRole {
    fn as_str(&self) -> &'static str {
        match self {
            SetupRole::ActPass => "actpass",
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "actpass" => Some(SetupRole::ActPass),
            "active" => Some(SetupRole::Active),
            "passive" => Some(SetupRole::Passive),
            _ => None,
        }
    }
}

/// One `a=rtpmap` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    /// Encoding name, e.g. "H264" or "opus".
    pub format: String,
    pub clock_rate: u32,
    /// Encoding parameters, e.g. the opus channel count.
    pub encoding_params: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ssrc {
    pub ssrc: u32,
    pub cname: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SectionKind {
    Audio,
    Video,
    Application,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Audio => "audio",
            SectionKind::Video => "video",
            SectionKind::Application => "application",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(SectionKind::Audio),
            "video" => Some(SectionKind::Video),
            "application" => Some(SectionKind::Application),
            _ => None,
        }
    }
}

/// One m-line and its attributes.
#[derive(Debug, Clone)]
pub struct MediaSection {
    pub mid: String,
    pub kind: SectionKind,
    pub direction: Direction,
    /// Payload type to codec mapping; unique payload types per section.
    pub rtp_maps: BTreeMap<u8, RtpMap>,
    pub ssrcs: Vec<Ssrc>,
    /// SCTP port, application sections only.
    pub sctp_port: Option<u16>,
    /// RFC 8841 `a=max-message-size`; zero advertises no limit.
    pub max_message_size: Option<usize>,
}

impl MediaSection {
    pub fn application(mid: impl Into<String>, sctp_port: u16, max_message_size: usize) -> Self {
        Self {
            mid: mid.into(),
            kind: SectionKind::Application,
            direction: Direction::SendRecv,
            rtp_maps: BTreeMap::new(),
            ssrcs: Vec::new(),
            sctp_port: Some(sctp_port),
            max_message_size: Some(max_message_size),
        }
    }

    pub fn media(mid: impl Into<String>, kind: SectionKind, direction: Direction) -> Self {
        Self {
            mid: mid.into(),
            kind,
            direction,
            rtp_maps: BTreeMap::new(),
            ssrcs: Vec::new(),
            sctp_port: None,
            max_message_size: None,
        }
    }

    /// Registers a payload-type mapping. Payload types are unique within a
    /// section.
    pub fn add_rtp_map(&mut self, map: RtpMap) -> Result<()> {
        if self.rtp_maps.contains_key(&map.payload_type) {
            return Err(Error::ErrInvalidArgument(format!(
                "duplicate payload type {}",
                map.payload_type
            )));
        }
        self.rtp_maps.insert(map.payload_type, map);
        Ok(())
    }

    pub fn add_ssrc(&mut self, ssrc: u32, cname: Option<String>) {
        self.ssrcs.push(Ssrc { ssrc, cname });
    }

    pub fn has_payload_type(&self, payload_type: u8) -> bool {
        self.rtp_maps.contains_key(&payload_type)
    }
}

/// An ICE candidate line paired with the mid it belongs to, delivered to
/// the peer as it is gathered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// The candidate line without the `a=` prefix.
    pub candidate: String,
    pub mid: String,
}

/// Parsed form of a session description.
#[derive(Debug, Clone)]
pub struct Description {
    pub sdp_type: SdpType,
    session_id: String,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    /// Lowercase colon-separated SHA-256 fingerprint.
    pub fingerprint: Option<String>,
    pub setup: SetupRole,
    media: Vec<MediaSection>,
    pub candidates: Vec<IceCandidate>,
    pub end_of_candidates: bool,
}

impl Description {
    pub fn new(sdp_type: SdpType, session_id: String) -> Self {
        Self {
            sdp_type,
            session_id,
            ice_ufrag: None,
            ice_pwd: None,
            fingerprint: None,
            setup: SetupRole::ActPass,
            media: Vec::new(),
            candidates: Vec::new(),
            end_of_candidates: false,
        }
    }

    /// Parses an SDP blob received from the peer.
    pub fn parse(sdp: &str, sdp_type: SdpType) -> Result<Self> {
        let mut description = Description::new(sdp_type, "0".to_string());
        let mut current: Option<MediaSection> = None;

        for raw_line in sdp.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some(m_line) = line.strip_prefix("m=") {
                if let Some(section) = current.take() {
                    description.push_media(section)?;
                }
                current = Some(parse_m_line(m_line)?);
            } else if let Some(o_line) = line.strip_prefix("o=") {
                let tokens = explode(o_line, ' ');
                if tokens.len() >= 2 {
                    description.session_id = tokens[1].clone();
                }
            } else if let Some(attribute) = line.strip_prefix("a=") {
                parse_attribute(attribute, &mut description, current.as_mut())?;
            }
        }
        if let Some(section) = current.take() {
            description.push_media(section)?;
        }

        Ok(description)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn media(&self) -> &[MediaSection] {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut [MediaSection] {
        &mut self.media
    }

    /// Appends a media section, keeping mids unique.
    pub fn push_media(&mut self, section: MediaSection) -> Result<()> {
        if self.media.iter().any(|m| m.mid == section.mid) {
            return Err(Error::ErrInvalidArgument(format!(
                "duplicate mid: {}",
                section.mid
            )));
        }
        self.media.push(section);
        Ok(())
    }

    /// The first application section, if any.
    pub fn application(&self) -> Option<&MediaSection> {
        self.media
            .iter()
            .find(|m| m.kind == SectionKind::Application)
    }

    pub fn media_with_mid(&self, mid: &str) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.mid == mid)
    }

    pub fn add_candidate(&mut self, candidate: IceCandidate) {
        self.candidates.push(candidate);
    }

    /// RFC 8841: a value of zero advertises handling of messages of any
    /// size; an absent attribute implies the protocol default.
    pub fn remote_max_message_size(&self, default: usize) -> usize {
        match self.application().and_then(|a| a.max_message_size) {
            Some(0) => usize::MAX,
            Some(size) => size,
            None => default,
        }
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v=0\r")?;
        writeln!(f, "o=rtc {} 0 IN IP4 127.0.0.1\r", self.session_id)?;
        writeln!(f, "s=-\r")?;
        writeln!(f, "t=0 0\r")?;
        if !self.media.is_empty() {
            let mids: Vec<String> = self.media.iter().map(|m| m.mid.clone()).collect();
            writeln!(f, "a=group:BUNDLE {}\r", implode(&mids, ' '))?;
        }
        writeln!(f, "a=msid-semantic:WMS *\r")?;
        writeln!(f, "a=setup:{}\r", self.setup.as_str())?;
        if let Some(ice_ufrag) = &self.ice_ufrag {
            writeln!(f, "a=ice-ufrag:{ice_ufrag}\r")?;
        }
        if let Some(ice_pwd) = &self.ice_pwd {
            writeln!(f, "a=ice-pwd:{ice_pwd}\r")?;
        }
        if let Some(fingerprint) = &self.fingerprint {
            writeln!(f, "a=fingerprint:sha-256 {fingerprint}\r")?;
        }

        for (index, section) in self.media.iter().enumerate() {
            match section.kind {
                SectionKind::Application => {
                    writeln!(f, "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r")?;
                    writeln!(f, "c=IN IP4 0.0.0.0\r")?;
                    writeln!(f, "a=mid:{}\r", section.mid)?;
                    if let Some(port) = section.sctp_port {
                        writeln!(f, "a=sctp-port:{port}\r")?;
                    }
                    if let Some(size) = section.max_message_size {
                        writeln!(f, "a=max-message-size:{size}\r")?;
                    }
                }
                kind => {
                    let payload_types: Vec<String> = section
                        .rtp_maps
                        .keys()
                        .map(|payload_type| payload_type.to_string())
                        .collect();
                    writeln!(
                        f,
                        "m={} 9 UDP/TLS/RTP/SAVPF {}\r",
                        kind.as_str(),
                        implode(&payload_types, ' ')
                    )?;
                    writeln!(f, "c=IN IP4 0.0.0.0\r")?;
                    writeln!(f, "a=mid:{}\r", section.mid)?;
                    writeln!(f, "a={}\r", section.direction.as_str())?;
                    writeln!(f, "a=rtcp-mux\r")?;
                    for map in section.rtp_maps.values() {
                        match &map.encoding_params {
                            Some(params) => writeln!(
                                f,
                                "a=rtpmap:{} {}/{}/{}\r",
                                map.payload_type, map.format, map.clock_rate, params
                            )?,
                            None => writeln!(
                                f,
                                "a=rtpmap:{} {}/{}\r",
                                map.payload_type, map.format, map.clock_rate
                            )?,
                        }
                        if map.format.eq_ignore_ascii_case("H264") {
                            writeln!(
                                f,
                                "a=fmtp:{} level-asymmetry-allowed=1;packetization-mode=1\r",
                                map.payload_type
                            )?;
                        }
                    }
                    for ssrc in &section.ssrcs {
                        match &ssrc.cname {
                            Some(cname) => writeln!(f, "a=ssrc:{} cname:{cname}\r", ssrc.ssrc)?,
                            None => writeln!(f, "a=ssrc:{}\r", ssrc.ssrc)?,
                        }
                    }
                }
            }
            for candidate in self
                .candidates
                .iter()
                .filter(|c| c.mid == section.mid || c.mid.is_empty())
            {
                writeln!(f, "a={}\r", candidate.candidate)?;
            }
            if index == 0 && self.end_of_candidates {
                writeln!(f, "a=end-of-candidates\r")?;
            }
        }
        Ok(())
    }
}

fn parse_m_line(m_line: &str) -> Result<MediaSection> {
    let tokens = explode(m_line, ' ');
    if tokens.is_empty() {
        return Err(Error::ErrProtocol("empty m-line".to_string()));
    }
    let kind = SectionKind::from_str(&tokens[0])
        .ok_or_else(|| Error::ErrProtocol(format!("unknown media type: {}", tokens[0])))?;
    Ok(MediaSection {
        mid: String::new(),
        kind,
        direction: Direction::default(),
        rtp_maps: BTreeMap::new(),
        ssrcs: Vec::new(),
        sctp_port: None,
        max_message_size: None,
    })
}

fn parse_attribute(
    attribute: &str,
    description: &mut Description,
    current: Option<&mut MediaSection>,
) -> Result<()> {
    let (key, value) = match attribute.split_once(':') {
        Some((key, value)) => (key, value),
        None => (attribute, ""),
    };

    match key {
        "mid" => {
            if let Some(section) = current {
                section.mid = value.to_string();
            }
        }
        "ice-ufrag" => description.ice_ufrag = Some(value.to_string()),
        "ice-pwd" => description.ice_pwd = Some(value.to_string()),
        "fingerprint" => {
            let tokens = explode(value, ' ');
            if tokens.len() != 2 {
                return Err(Error::ErrProtocol(format!("invalid fingerprint: {value}")));
            }
            if tokens[0].eq_ignore_ascii_case("sha-256") {
                description.fingerprint = Some(tokens[1].to_lowercase());
            }
        }
        "setup" => {
            description.setup = SetupRole::from_str(value)
                .ok_or_else(|| Error::ErrProtocol(format!("invalid setup role: {value}")))?;
        }
        "sctp-port" => {
            if let Some(section) = current {
                section.sctp_port = Some(
                    value
                        .parse()
                        .map_err(|_| Error::ErrProtocol(format!("invalid sctp-port: {value}")))?,
                );
            }
        }
        "max-message-size" => {
            if let Some(section) = current {
                section.max_message_size = Some(value.parse().map_err(|_| {
                    Error::ErrProtocol(format!("invalid max-message-size: {value}"))
                })?);
            }
        }
        "rtpmap" => {
            if let Some(section) = current {
                let (payload_type, codec) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrProtocol(format!("invalid rtpmap: {value}")))?;
                let payload_type: u8 = payload_type
                    .parse()
                    .map_err(|_| Error::ErrProtocol(format!("invalid payload type: {value}")))?;
                let parts = explode(codec, '/');
                if parts.len() < 2 {
                    return Err(Error::ErrProtocol(format!("invalid rtpmap codec: {value}")));
                }
                let clock_rate: u32 = parts[1]
                    .parse()
                    .map_err(|_| Error::ErrProtocol(format!("invalid clock rate: {value}")))?;
                section.add_rtp_map(RtpMap {
                    payload_type,
                    format: parts[0].clone(),
                    clock_rate,
                    encoding_params: parts.get(2).cloned(),
                })?;
            }
        }
        "ssrc" => {
            if let Some(section) = current {
                let tokens = explode(value, ' ');
                let ssrc: u32 = tokens[0]
                    .parse()
                    .map_err(|_| Error::ErrProtocol(format!("invalid ssrc: {value}")))?;
                let cname = tokens
                    .get(1)
                    .and_then(|t| t.strip_prefix("cname:"))
                    .map(str::to_string);
                if !section.ssrcs.iter().any(|s| s.ssrc == ssrc) {
                    section.add_ssrc(ssrc, cname);
                }
            }
        }
        "candidate" => {
            let mid = current.map(|s| s.mid.clone()).unwrap_or_default();
            description.add_candidate(IceCandidate {
                candidate: format!("candidate:{value}"),
                mid,
            });
        }
        "end-of-candidates" => description.end_of_candidates = true,
        "sendrecv" | "sendonly" | "recvonly" | "inactive" => {
            if let Some(section) = current {
                if let Some(direction) = Direction::from_str(key) {
                    section.direction = direction;
                }
            }
        }
        _ => {} // unknown attributes are ignored
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Description {
        let mut description = Description::new(SdpType::Offer, "1234".to_string());
        description.ice_ufrag = Some("frag".to_string());
        description.ice_pwd = Some("pass".to_string());
        description.fingerprint = Some("ab:cd:ef".to_string());
        description.setup = SetupRole::ActPass;
        description
            .push_media(MediaSection::application("0", 5000, 262144))
            .unwrap();
        let mut video = MediaSection::media("1", SectionKind::Video, Direction::SendOnly);
        video
            .add_rtp_map(RtpMap {
                payload_type: 102,
                format: "H264".to_string(),
                clock_rate: 90000,
                encoding_params: None,
            })
            .unwrap();
        video.add_ssrc(1, Some("stream".to_string()));
        description.push_media(video).unwrap();
        description
    }

    #[test]
    fn test_marshal_parse_roundtrip() {
        let description = sample();
        let sdp = description.to_string();
        let parsed = Description::parse(&sdp, SdpType::Offer).unwrap();

        assert_eq!(parsed.session_id(), "1234");
        assert_eq!(parsed.ice_ufrag.as_deref(), Some("frag"));
        assert_eq!(parsed.ice_pwd.as_deref(), Some("pass"));
        assert_eq!(parsed.fingerprint.as_deref(), Some("ab:cd:ef"));
        assert_eq!(parsed.setup, SetupRole::ActPass);
        assert_eq!(parsed.media().len(), 2);

        let application = parsed.application().unwrap();
        assert_eq!(application.mid, "0");
        assert_eq!(application.sctp_port, Some(5000));
        assert_eq!(application.max_message_size, Some(262144));

        let video = parsed.media_with_mid("1").unwrap();
        assert_eq!(video.kind, SectionKind::Video);
        assert_eq!(video.direction, Direction::SendOnly);
        let map = &video.rtp_maps[&102];
        assert_eq!(map.format, "H264");
        assert_eq!(map.clock_rate, 90000);
        assert_eq!(video.ssrcs[0].ssrc, 1);
        assert_eq!(video.ssrcs[0].cname.as_deref(), Some("stream"));
    }

    #[test]
    fn test_duplicate_mid_rejected() {
        let mut description = Description::new(SdpType::Offer, "1".to_string());
        description
            .push_media(MediaSection::application("0", 5000, 0))
            .unwrap();
        let result = description.push_media(MediaSection::application("0", 5000, 0));
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_payload_type_rejected() {
        let mut section = MediaSection::media("0", SectionKind::Audio, Direction::SendRecv);
        let map = RtpMap {
            payload_type: 111,
            format: "opus".to_string(),
            clock_rate: 48000,
            encoding_params: Some("2".to_string()),
        };
        section.add_rtp_map(map.clone()).unwrap();
        assert!(section.add_rtp_map(map).is_err());
    }

    #[test]
    fn test_candidate_lines() {
        let mut description = sample();
        description.add_candidate(IceCandidate {
            candidate: "candidate:1 1 UDP 2122317823 192.0.2.1 49152 typ host".to_string(),
            mid: "0".to_string(),
        });
        let sdp = description.to_string();
        assert!(sdp.contains("a=candidate:1 1 UDP 2122317823 192.0.2.1 49152 typ host"));

        let parsed = Description::parse(&sdp, SdpType::Offer).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.candidates[0].mid, "0");
    }

    #[test]
    fn test_max_message_size_semantics() {
        let mut description = Description::new(SdpType::Offer, "1".to_string());
        description
            .push_media(MediaSection::application("0", 5000, 0))
            .unwrap();
        assert_eq!(description.remote_max_message_size(65536), usize::MAX);

        let mut absent = Description::new(SdpType::Offer, "1".to_string());
        let mut section = MediaSection::application("0", 5000, 0);
        section.max_message_size = None;
        absent.push_media(section).unwrap();
        assert_eq!(absent.remote_max_message_size(65536), 65536);
    }

    #[test]
    fn test_sdp_type_literals() {
        assert_eq!(SdpType::from_str("offer").unwrap(), SdpType::Offer);
        assert_eq!(SdpType::from_str("answer").unwrap(), SdpType::Answer);
        assert_eq!(SdpType::from_str("pranswer").unwrap(), SdpType::Pranswer);
        assert_eq!(SdpType::from_str("rollback").unwrap(), SdpType::Rollback);
        assert!(SdpType::from_str("bogus").is_err());
    }
}
