use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::media::rtp::{RtpHeader, RtpPacketizationConfig};
use crate::message::{Message, MessageType};

/// Default payload budget per RTP packet, leaving room for the header
/// inside a typical path MTU.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 1200;

/// Turns codec payload fragments into RTP packets using a shared
/// packetization config.
pub struct RtpPacketizer {
    pub config: Arc<Mutex<RtpPacketizationConfig>>,
    pub max_fragment_size: usize,
}

impl RtpPacketizer {
    pub fn new(config: Arc<Mutex<RtpPacketizationConfig>>) -> Self {
        Self {
            config,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
        }
    }

    pub fn with_max_fragment_size(
        config: Arc<Mutex<RtpPacketizationConfig>>,
        max_fragment_size: usize,
    ) -> Self {
        Self {
            config,
            max_fragment_size,
        }
    }

    /// Builds one RTP packet, advancing the sequence number.
    pub fn packetize(&self, payload: &[u8], marker: bool) -> Message {
        let mut config = self.config.lock().unwrap();
        let header = RtpHeader {
            marker,
            payload_type: config.payload_type,
            sequence_number: config.sequence_number,
            timestamp: config.timestamp,
            ssrc: config.ssrc,
            csrc: vec![],
        };
        config.sequence_number = config.sequence_number.wrapping_add(1);

        let mut buf = BytesMut::with_capacity(header.marshal_size() + payload.len());
        header.marshal_to(&mut buf);
        buf.extend_from_slice(payload);
        Message {
            message_type: MessageType::Binary,
            payload: buf.freeze(),
            ..Default::default()
        }
    }

    /// Packetizes a fragmented sample; the marker bit is set on the last
    /// packet of the sample.
    pub fn packetize_fragments(&self, fragments: Vec<Bytes>) -> Vec<Message> {
        let count = fragments.len();
        fragments
            .into_iter()
            .enumerate()
            .map(|(index, fragment)| self.packetize(&fragment, index + 1 == count))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::rtp::RTP_HEADER_SIZE;

    #[test]
    fn test_sequence_numbers_increase() {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(1, "c", 102, 90000)));
        let packetizer = RtpPacketizer::new(Arc::clone(&config));
        let first = packetizer.packetize(b"a", false);
        let second = packetizer.packetize(b"b", true);

        let (h1, _) = RtpHeader::unmarshal(&first.payload).unwrap();
        let (h2, _) = RtpHeader::unmarshal(&second.payload).unwrap();
        assert_eq!(h2.sequence_number, h1.sequence_number.wrapping_add(1));
        assert!(!h1.marker);
        assert!(h2.marker);
    }

    #[test]
    fn test_marker_on_last_fragment() {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(1, "c", 96, 90000)));
        let packetizer = RtpPacketizer::new(config);
        let packets =
            packetizer.packetize_fragments(vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
        assert_eq!(packets.len(), 2);
        let (h1, o1) = RtpHeader::unmarshal(&packets[0].payload).unwrap();
        let (h2, _) = RtpHeader::unmarshal(&packets[1].payload).unwrap();
        assert!(!h1.marker);
        assert!(h2.marker);
        assert_eq!(o1, RTP_HEADER_SIZE);
        assert_eq!(&packets[0].payload[o1..], b"x");
    }
}
