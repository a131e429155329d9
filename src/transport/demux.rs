//! First-byte demultiplexing of multiplexed datagrams, RFC 7983:
//!
//! ```text
//!             +----------------+
//!             |        [0..3] -+--> forward to STUN
//!             |                |
//!             |      [20..63] -+--> forward to DTLS
//!             |                |
//! packet -->  |      [64..79] -+--> forward to TURN Channel
//!             |                |
//!             |    [128..191] -+--> forward to RTP/RTCP
//!             +----------------+
//! ```

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketClass {
    Stun,
    Dtls,
    TurnChannel,
    Rtp,
    Unknown,
}

pub(crate) fn classify(data: &[u8]) -> PacketClass {
    let Some(&first) = data.first() else {
        return PacketClass::Unknown;
    };
    match first {
        0..=3 => PacketClass::Stun,
        20..=63 => PacketClass::Dtls,
        64..=79 => PacketClass::TurnChannel,
        128..=191 => PacketClass::Rtp,
        _ => PacketClass::Unknown,
    }
}

/// RFC 5761 demultiplexing of RTCP from RTP inside the RTP class: packets
/// whose payload-type octet falls in [192, 223] are RTCP.
pub(crate) fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (192..=223).contains(&data[1])
}
