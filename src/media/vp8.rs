use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::media::packetizer::RtpPacketizer;
use crate::media::rtp::RtpPacketizationConfig;
use crate::media::MediaHandler;
use crate::message::Message;

const VP8_S_BIT: u8 = 0x10; // start of VP8 partition

/// Fragments VP8 frames into RTP packets with the minimal payload
/// descriptor, RFC 7741.
pub struct Vp8PacketizationHandler {
    packetizer: RtpPacketizer,
}

impl Vp8PacketizationHandler {
    pub fn new(config: Arc<Mutex<RtpPacketizationConfig>>) -> Self {
        Self {
            packetizer: RtpPacketizer::new(config),
        }
    }
}

impl MediaHandler for Vp8PacketizationHandler {
    fn outgoing(&mut self, messages: &mut Vec<Message>, _send: &mut dyn FnMut(Message)) {
        let max = self.packetizer.max_fragment_size.saturating_sub(1).max(1);
        let mut packets = Vec::new();
        for message in messages.drain(..) {
            if message.payload.is_empty() {
                continue;
            }
            let fragments: Vec<_> = message
                .payload
                .chunks(max)
                .enumerate()
                .map(|(index, chunk)| {
                    let mut payload = BytesMut::with_capacity(1 + chunk.len());
                    payload.extend_from_slice(&[if index == 0 { VP8_S_BIT } else { 0x00 }]);
                    payload.extend_from_slice(chunk);
                    payload.freeze()
                })
                .collect();
            packets.extend(self.packetizer.packetize_fragments(fragments));
        }
        *messages = packets;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::rtp::RtpHeader;
    use bytes::Bytes;

    #[test]
    fn test_descriptor_start_bit_and_marker() {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(2, "c", 96, 90000)));
        let mut handler = Vp8PacketizationHandler::new(config);
        handler.packetizer.max_fragment_size = 5;

        let mut messages = vec![Message::binary(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7]))];
        handler.outgoing(&mut messages, &mut |_| {});
        assert_eq!(messages.len(), 2);

        let (h1, o1) = RtpHeader::unmarshal(&messages[0].payload).unwrap();
        let (h2, o2) = RtpHeader::unmarshal(&messages[1].payload).unwrap();
        assert_eq!(messages[0].payload[o1], VP8_S_BIT);
        assert_eq!(messages[1].payload[o2], 0x00);
        assert!(!h1.marker);
        assert!(h2.marker);
        assert_eq!(&messages[0].payload[o1 + 1..], &[1, 2, 3, 4]);
        assert_eq!(&messages[1].payload[o2 + 1..], &[5, 6, 7]);
    }
}
