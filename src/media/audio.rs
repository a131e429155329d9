//! Audio packetization: one sample becomes one RTP packet. Applies to
//! Opus (RFC 7587) and the G.711 companders PCMU/PCMA (RFC 3551).

use std::sync::{Arc, Mutex};

use crate::media::packetizer::RtpPacketizer;
use crate::media::rtp::RtpPacketizationConfig;
use crate::media::MediaHandler;
use crate::message::Message;

macro_rules! audio_handler {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        pub struct $name {
            packetizer: RtpPacketizer,
        }

        impl $name {
            pub fn new(config: Arc<Mutex<RtpPacketizationConfig>>) -> Self {
                Self {
                    packetizer: RtpPacketizer::new(config),
                }
            }
        }

        impl MediaHandler for $name {
            fn outgoing(&mut self, messages: &mut Vec<Message>, _send: &mut dyn FnMut(Message)) {
                let packets = messages
                    .drain(..)
                    .filter(|message| !message.payload.is_empty())
                    .map(|message| self.packetizer.packetize(&message.payload, false))
                    .collect();
                *messages = packets;
            }
        }
    };
}

audio_handler!(OpusPacketizationHandler, "Opus audio packetization.");
audio_handler!(PcmuPacketizationHandler, "G.711 mu-law audio packetization.");
audio_handler!(PcmaPacketizationHandler, "G.711 A-law audio packetization.");

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::rtp::RtpHeader;
    use bytes::Bytes;

    #[test]
    fn test_one_packet_per_sample() {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(4, "c", 111, 48000)));
        let mut handler = OpusPacketizationHandler::new(config);
        let mut messages = vec![
            Message::binary(Bytes::from_static(&[1, 2])),
            Message::binary(Bytes::from_static(&[3])),
        ];
        handler.outgoing(&mut messages, &mut |_| {});
        assert_eq!(messages.len(), 2);
        let (h1, o1) = RtpHeader::unmarshal(&messages[0].payload).unwrap();
        assert_eq!(h1.payload_type, 111);
        assert!(!h1.marker);
        assert_eq!(&messages[0].payload[o1..], &[1, 2]);
    }
}
