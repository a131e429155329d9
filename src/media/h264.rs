use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use log::warn;

use crate::media::packetizer::RtpPacketizer;
use crate::media::rtp::RtpPacketizationConfig;
use crate::media::MediaHandler;
use crate::message::Message;

const FUA_NALU_TYPE: u8 = 28;
const FUA_HEADER_SIZE: usize = 2;
const NALU_TYPE_BITMASK: u8 = 0x1f;
const NALU_REF_IDC_BITMASK: u8 = 0x60;
const FU_START_BITMASK: u8 = 0x80;
const FU_END_BITMASK: u8 = 0x40;

/// How NAL units are delimited in the samples handed to the track.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum NalUnitSeparator {
    /// 4-byte big-endian length prefix per NAL unit.
    #[default]
    Length,
    /// Annex B start sequences (0x000001 or 0x00000001).
    StartSequence,
}

/// Fragments H264 samples into RTP packets: single NAL units when they
/// fit, FU-A otherwise, RFC 6184.
pub struct H264PacketizationHandler {
    packetizer: RtpPacketizer,
    separator: NalUnitSeparator,
}

impl H264PacketizationHandler {
    pub fn new(config: Arc<Mutex<RtpPacketizationConfig>>, separator: NalUnitSeparator) -> Self {
        Self {
            packetizer: RtpPacketizer::new(config),
            separator,
        }
    }

    pub fn with_max_fragment_size(
        config: Arc<Mutex<RtpPacketizationConfig>>,
        separator: NalUnitSeparator,
        max_fragment_size: usize,
    ) -> Self {
        Self {
            packetizer: RtpPacketizer::with_max_fragment_size(config, max_fragment_size),
            separator,
        }
    }

    fn split_nal_units(&self, sample: &Bytes) -> Vec<Bytes> {
        match self.separator {
            NalUnitSeparator::Length => split_length_prefixed(sample),
            NalUnitSeparator::StartSequence => split_annex_b(sample),
        }
    }

    /// One sample becomes the payloads of its RTP packets.
    fn fragment(&self, sample: &Bytes) -> Vec<Bytes> {
        let max = self.packetizer.max_fragment_size;
        let mut payloads = Vec::new();
        for nalu in self.split_nal_units(sample) {
            if nalu.is_empty() {
                continue;
            }
            if nalu.len() <= max {
                payloads.push(nalu);
                continue;
            }
            // FU-A: the NAL header octet is replaced by indicator + header
            let indicator = (nalu[0] & NALU_REF_IDC_BITMASK) | FUA_NALU_TYPE;
            let nalu_type = nalu[0] & NALU_TYPE_BITMASK;
            let data = &nalu[1..];
            let chunk_size = max.saturating_sub(FUA_HEADER_SIZE).max(1);
            let count = data.len().div_ceil(chunk_size);
            for (index, chunk) in data.chunks(chunk_size).enumerate() {
                let mut fu_header = nalu_type;
                if index == 0 {
                    fu_header |= FU_START_BITMASK;
                }
                if index + 1 == count {
                    fu_header |= FU_END_BITMASK;
                }
                let mut payload = BytesMut::with_capacity(FUA_HEADER_SIZE + chunk.len());
                payload.extend_from_slice(&[indicator, fu_header]);
                payload.extend_from_slice(chunk);
                payloads.push(payload.freeze());
            }
        }
        payloads
    }
}

impl MediaHandler for H264PacketizationHandler {
    fn outgoing(&mut self, messages: &mut Vec<Message>, _send: &mut dyn FnMut(Message)) {
        let mut packets = Vec::new();
        for message in messages.drain(..) {
            let fragments = self.fragment(&message.payload);
            if fragments.is_empty() {
                warn!("H264 sample without any NAL unit, dropping");
                continue;
            }
            packets.extend(self.packetizer.packetize_fragments(fragments));
        }
        *messages = packets;
    }
}

fn split_length_prefixed(sample: &Bytes) -> Vec<Bytes> {
    let mut units = Vec::new();
    let mut offset = 0;
    while offset + 4 <= sample.len() {
        let len = u32::from_be_bytes([
            sample[offset],
            sample[offset + 1],
            sample[offset + 2],
            sample[offset + 3],
        ]) as usize;
        let start = offset + 4;
        let end = start + len;
        if end > sample.len() {
            warn!("Truncated length-prefixed NAL unit, dropping the rest of the sample");
            break;
        }
        units.push(sample.slice(start..end));
        offset = end;
    }
    units
}

fn split_annex_b(sample: &Bytes) -> Vec<Bytes> {
    let data = &sample[..];
    let mut units = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                units.push(sample.slice(s..code_start));
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        units.push(sample.slice(s..));
    }
    units
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::rtp::RtpHeader;

    fn handler(separator: NalUnitSeparator, max: usize) -> H264PacketizationHandler {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(1, "c", 102, 90000)));
        H264PacketizationHandler::with_max_fragment_size(config, separator, max)
    }

    #[test]
    fn test_split_annex_b() {
        let sample = Bytes::from_static(&[
            0, 0, 0, 1, 0x65, 1, 2, 3, // IDR
            0, 0, 1, 0x41, 4, 5, // non-IDR, short start code
        ]);
        let units = split_annex_b(&sample);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &[0x65, 1, 2, 3]);
        assert_eq!(&units[1][..], &[0x41, 4, 5]);
    }

    #[test]
    fn test_split_length_prefixed() {
        let sample = Bytes::from_static(&[0, 0, 0, 2, 0x65, 9, 0, 0, 0, 1, 0x41]);
        let units = split_length_prefixed(&sample);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &[0x65, 9]);
        assert_eq!(&units[1][..], &[0x41]);
    }

    #[test]
    fn test_small_nalu_single_packet_with_marker() {
        let mut h = handler(NalUnitSeparator::StartSequence, 1200);
        let mut messages = vec![Message::binary(Bytes::from_static(&[0, 0, 0, 1, 0x65, 1, 2]))];
        h.outgoing(&mut messages, &mut |_| {});
        assert_eq!(messages.len(), 1);
        let (header, offset) = RtpHeader::unmarshal(&messages[0].payload).unwrap();
        assert!(header.marker);
        assert_eq!(&messages[0].payload[offset..], &[0x65, 1, 2]);
    }

    #[test]
    fn test_fua_fragmentation_roundtrippable() {
        let mut h = handler(NalUnitSeparator::StartSequence, 10);
        let mut nalu = vec![0, 0, 0, 1, 0x65];
        nalu.extend_from_slice(&[0xAAu8; 25]);
        let mut messages = vec![Message::binary(Bytes::from(nalu))];
        h.outgoing(&mut messages, &mut |_| {});
        assert!(messages.len() > 1);

        let mut reassembled = Vec::new();
        for (index, message) in messages.iter().enumerate() {
            let (header, offset) = RtpHeader::unmarshal(&message.payload).unwrap();
            let payload = &message.payload[offset..];
            assert_eq!(payload[0] & NALU_TYPE_BITMASK, FUA_NALU_TYPE);
            let fu_header = payload[1];
            if index == 0 {
                assert_ne!(fu_header & FU_START_BITMASK, 0);
                reassembled.push((payload[0] & NALU_REF_IDC_BITMASK) | (fu_header & NALU_TYPE_BITMASK));
            }
            if index + 1 == messages.len() {
                assert_ne!(fu_header & FU_END_BITMASK, 0);
                assert!(header.marker);
            } else {
                assert!(!header.marker);
            }
            reassembled.extend_from_slice(&payload[2..]);
        }
        let mut expected = vec![0x65u8];
        expected.extend_from_slice(&[0xAAu8; 25]);
        assert_eq!(reassembled, expected);
    }

    #[test]
    fn test_fragments_respect_max_size() {
        let mut h = handler(NalUnitSeparator::StartSequence, 10);
        let mut nalu = vec![0, 0, 0, 1, 0x65];
        nalu.extend_from_slice(&[0x11u8; 100]);
        let mut messages = vec![Message::binary(Bytes::from(nalu))];
        h.outgoing(&mut messages, &mut |_| {});
        for message in &messages {
            let (_, offset) = RtpHeader::unmarshal(&message.payload).unwrap();
            assert!(message.payload.len() - offset <= 10);
        }
    }
}
