//! Minimal RTCP wire support: Sender Report generation, NACK feedback and
//! REMB parsing. Compound packets are walked header by header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub(crate) const RTCP_PT_SENDER_REPORT: u8 = 200;
pub(crate) const RTCP_PT_RTPFB: u8 = 205;
pub(crate) const RTCP_PT_PSFB: u8 = 206;
pub(crate) const RTPFB_FMT_NACK: u8 = 1;
pub(crate) const PSFB_FMT_AFB: u8 = 15;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub(crate) const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Common RTCP packet header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RtcpHeader {
    pub(crate) report_count: u8,
    pub(crate) payload_type: u8,
    /// Total packet length in bytes, header included.
    pub(crate) length_bytes: usize,
}

impl RtcpHeader {
    pub(crate) fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::ErrUnexpectedEndOfBuffer {
                expected: 4,
                actual: data.len(),
            });
        }
        if data[0] >> 6 != 2 {
            return Err(Error::ErrProtocol(format!("RTCP version {}", data[0] >> 6)));
        }
        let length_words = u16::from_be_bytes([data[2], data[3]]) as usize;
        Ok(Self {
            report_count: data[0] & 0x1f,
            payload_type: data[1],
            length_bytes: 4 * (length_words + 1),
        })
    }
}

/// Walks the packets of a compound RTCP payload.
pub(crate) fn for_each_packet(data: &[u8], mut f: impl FnMut(RtcpHeader, &[u8])) {
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let Ok(header) = RtcpHeader::unmarshal(&data[offset..]) else {
            return;
        };
        let end = offset + header.length_bytes;
        if end > data.len() {
            return;
        }
        f(header, &data[offset..end]);
        offset = end;
    }
}

/// RTCP Sender Report, RFC 3550 §6.4.1, without report blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    /// 64-bit NTP timestamp (seconds since 1900 in the high word).
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u8(0x80);
        buf.put_u8(RTCP_PT_SENDER_REPORT);
        buf.put_u16(6); // 7 words - 1
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        buf.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let header = RtcpHeader::unmarshal(data)?;
        if header.payload_type != RTCP_PT_SENDER_REPORT {
            return Err(Error::ErrProtocol(format!(
                "not a sender report: PT {}",
                header.payload_type
            )));
        }
        if data.len() < 28 {
            return Err(Error::ErrUnexpectedEndOfBuffer {
                expected: 28,
                actual: data.len(),
            });
        }
        let mut buf = &data[4..];
        Ok(Self {
            ssrc: buf.get_u32(),
            ntp_timestamp: buf.get_u64(),
            rtp_timestamp: buf.get_u32(),
            packet_count: buf.get_u32(),
            octet_count: buf.get_u32(),
        })
    }

    /// NTP seconds as a float, for pairing against the RTP timestamp.
    pub fn ntp_seconds(&self) -> f64 {
        let seconds = (self.ntp_timestamp >> 32) as f64;
        let fraction = (self.ntp_timestamp & 0xffff_ffff) as f64 / 4294967296.0;
        seconds + fraction
    }
}

/// Generic NACK feedback message, RFC 4585 §6.2.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    /// (packet id, bitmask of following lost packets) pairs.
    pub entries: Vec<(u16, u16)>,
}

impl Nack {
    /// Builds a NACK covering the given sequence numbers.
    pub fn from_sequence_numbers(sender_ssrc: u32, media_ssrc: u32, lost: &[u16]) -> Self {
        let mut entries: Vec<(u16, u16)> = Vec::new();
        for &seq in lost {
            if let Some((pid, blp)) = entries.last_mut() {
                let distance = seq.wrapping_sub(*pid);
                if distance >= 1 && distance <= 16 {
                    *blp |= 1 << (distance - 1);
                    continue;
                }
            }
            entries.push((seq, 0));
        }
        Self {
            sender_ssrc,
            media_ssrc,
            entries,
        }
    }

    /// The sequence numbers this NACK requests.
    pub fn sequence_numbers(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for &(pid, blp) in &self.entries {
            out.push(pid);
            for bit in 0..16 {
                if blp & (1 << bit) != 0 {
                    out.push(pid.wrapping_add(bit + 1));
                }
            }
        }
        out
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + 4 * self.entries.len());
        buf.put_u8(0x80 | RTPFB_FMT_NACK);
        buf.put_u8(RTCP_PT_RTPFB);
        buf.put_u16(2 + self.entries.len() as u16);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for &(pid, blp) in &self.entries {
            buf.put_u16(pid);
            buf.put_u16(blp);
        }
        buf.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let header = RtcpHeader::unmarshal(data)?;
        if header.payload_type != RTCP_PT_RTPFB || header.report_count != RTPFB_FMT_NACK {
            return Err(Error::ErrProtocol("not a NACK".to_string()));
        }
        if data.len() < 12 || header.length_bytes < 12 {
            return Err(Error::ErrUnexpectedEndOfBuffer {
                expected: 12,
                actual: data.len(),
            });
        }
        let mut buf = &data[4..header.length_bytes.min(data.len())];
        let sender_ssrc = buf.get_u32();
        let media_ssrc = buf.get_u32();
        let mut entries = Vec::new();
        while buf.remaining() >= 4 {
            entries.push((buf.get_u16(), buf.get_u16()));
        }
        Ok(Self {
            sender_ssrc,
            media_ssrc,
            entries,
        })
    }
}

/// Extracts the bitrate from a REMB message, RFC draft-alvestrand-rmcat-remb:
/// PSFB (PT 206) with FMT 15 and the "REMB" identifier.
pub(crate) fn parse_remb(data: &[u8]) -> Option<u64> {
    let header = RtcpHeader::unmarshal(data).ok()?;
    if header.payload_type != RTCP_PT_PSFB || header.report_count != PSFB_FMT_AFB {
        return None;
    }
    if data.len() < 20 || &data[12..16] != b"REMB" {
        return None;
    }
    let exponent = u64::from(data[17] >> 2);
    let mantissa = (u64::from(data[17] & 0x03) << 16) | (u64::from(data[18]) << 8) | u64::from(data[19]);
    Some(mantissa << exponent)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sender_report_roundtrip() {
        let report = SenderReport {
            ssrc: 1,
            ntp_timestamp: (3_900_000_000u64 << 32) | 0x8000_0000,
            rtp_timestamp: 90000,
            packet_count: 30,
            octet_count: 4096,
        };
        let data = report.marshal();
        assert_eq!(data.len(), 28);
        assert_eq!(data[1], 200);
        let parsed = SenderReport::unmarshal(&data).unwrap();
        assert_eq!(parsed, report);
        assert!((parsed.ntp_seconds() - (3_900_000_000.0 + 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_nack_blp_compression() {
        let nack = Nack::from_sequence_numbers(7, 1, &[100, 101, 116, 200]);
        assert_eq!(nack.entries, vec![(100, 0x8001), (200, 0)]);
        let mut numbers = nack.sequence_numbers();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![100, 101, 116, 200]);
    }

    #[test]
    fn test_nack_roundtrip() {
        let nack = Nack::from_sequence_numbers(7, 1, &[55, 56, 57]);
        let data = nack.marshal();
        let parsed = Nack::unmarshal(&data).unwrap();
        assert_eq!(parsed, nack);
    }

    #[test]
    fn test_compound_walk() {
        let mut compound = BytesMut::new();
        compound.extend_from_slice(&SenderReport {
            ssrc: 1,
            ntp_timestamp: 0,
            rtp_timestamp: 0,
            packet_count: 0,
            octet_count: 0,
        }
        .marshal());
        compound.extend_from_slice(&Nack::from_sequence_numbers(7, 1, &[9]).marshal());

        let mut seen = Vec::new();
        for_each_packet(&compound, |header, _packet| {
            seen.push(header.payload_type);
        });
        assert_eq!(seen, vec![200, 205]);
    }

    #[test]
    fn test_parse_remb() {
        // PSFB FMT=15, "REMB", 1 SSRC, bitrate = mantissa 100_000 << 2
        let mut buf = BytesMut::new();
        buf.put_u8(0x80 | 15);
        buf.put_u8(206);
        buf.put_u16(4); // 5 words total
        buf.put_u32(7); // sender ssrc
        buf.put_u32(0); // media ssrc
        buf.put_slice(b"REMB");
        buf.put_u8(1); // num ssrc
        let exponent: u8 = 2;
        let mantissa: u32 = 100_000;
        buf.put_u8(exponent << 2 | ((mantissa >> 16) as u8 & 0x03));
        buf.put_u8((mantissa >> 8) as u8);
        buf.put_u8(mantissa as u8);
        assert_eq!(parse_remb(&buf), Some(400_000));
    }

    #[test]
    fn test_parse_remb_rejects_other_psfb() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80 | 1); // FMT 1 = PLI
        buf.put_u8(206);
        buf.put_u16(2);
        buf.put_u32(7);
        buf.put_u32(0);
        assert_eq!(parse_remb(&buf), None);
    }
}
