use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::media::packetizer::RtpPacketizer;
use crate::media::rtp::RtpPacketizationConfig;
use crate::media::MediaHandler;
use crate::message::Message;

const VP9_B_BIT: u8 = 0x08; // begins a frame
const VP9_E_BIT: u8 = 0x04; // ends a frame

/// Fragments VP9 frames into RTP packets with the minimal payload
/// descriptor (no layer indices, no picture id),
/// draft-ietf-payload-vp9.
///
/// VP9 is a first-class codec here: it gets its own descriptor writer and
/// a proper `VP9/90000` rtpmap, never the VP8 one.
pub struct Vp9PacketizationHandler {
    packetizer: RtpPacketizer,
}

impl Vp9PacketizationHandler {
    pub fn new(config: Arc<Mutex<RtpPacketizationConfig>>) -> Self {
        Self {
            packetizer: RtpPacketizer::new(config),
        }
    }
}

impl MediaHandler for Vp9PacketizationHandler {
    fn outgoing(&mut self, messages: &mut Vec<Message>, _send: &mut dyn FnMut(Message)) {
        let max = self.packetizer.max_fragment_size.saturating_sub(1).max(1);
        let mut packets = Vec::new();
        for message in messages.drain(..) {
            if message.payload.is_empty() {
                continue;
            }
            let count = message.payload.len().div_ceil(max);
            let fragments: Vec<_> = message
                .payload
                .chunks(max)
                .enumerate()
                .map(|(index, chunk)| {
                    let mut descriptor = 0u8;
                    if index == 0 {
                        descriptor |= VP9_B_BIT;
                    }
                    if index + 1 == count {
                        descriptor |= VP9_E_BIT;
                    }
                    let mut payload = BytesMut::with_capacity(1 + chunk.len());
                    payload.extend_from_slice(&[descriptor]);
                    payload.extend_from_slice(chunk);
                    payload.freeze()
                })
                .collect();
            packets.extend(self.packetizer.packetize_fragments(fragments));
        }
        *messages = packets;
    }
}
