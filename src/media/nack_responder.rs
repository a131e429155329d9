use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::media::rtcp::{for_each_packet, Nack, RTCP_PT_RTPFB, RTPFB_FMT_NACK};
use crate::media::rtp::RtpHeader;
use crate::media::MediaHandler;
use crate::message::Message;

pub(crate) const DEFAULT_MAX_STORED_PACKETS: usize = 512;

/// Answers incoming RTCP NACKs by retransmitting recently sent RTP
/// packets.
///
/// Keeps the last N transmitted packets indexed by sequence number;
/// requested sequences still in the store are sent again unchanged.
pub struct RtcpNackResponder {
    max_stored_packets: usize,
    order: VecDeque<u16>,
    stored: HashMap<u16, Message>,
}

impl Default for RtcpNackResponder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STORED_PACKETS)
    }
}

impl RtcpNackResponder {
    pub fn new(max_stored_packets: usize) -> Self {
        Self {
            max_stored_packets,
            order: VecDeque::with_capacity(max_stored_packets),
            stored: HashMap::with_capacity(max_stored_packets),
        }
    }

    fn store(&mut self, message: &Message) {
        let Ok((header, _)) = RtpHeader::unmarshal(&message.payload) else {
            return;
        };
        if self.order.len() == self.max_stored_packets {
            if let Some(evicted) = self.order.pop_front() {
                self.stored.remove(&evicted);
            }
        }
        self.order.push_back(header.sequence_number);
        self.stored.insert(header.sequence_number, message.clone());
    }
}

impl MediaHandler for RtcpNackResponder {
    fn outgoing(&mut self, messages: &mut Vec<Message>, _send: &mut dyn FnMut(Message)) {
        for message in messages.iter() {
            self.store(message);
        }
    }

    fn incoming(&mut self, messages: &mut Vec<Message>, send: &mut dyn FnMut(Message)) {
        for message in messages.iter() {
            for_each_packet(&message.payload, |header, packet| {
                if header.payload_type != RTCP_PT_RTPFB || header.report_count != RTPFB_FMT_NACK {
                    return;
                }
                let Ok(nack) = Nack::unmarshal(packet) else {
                    return;
                };
                for sequence_number in nack.sequence_numbers() {
                    if let Some(stored) = self.stored.get(&sequence_number) {
                        trace!("Retransmitting sequence number {sequence_number}");
                        send(stored.clone());
                    } else {
                        trace!("NACKed sequence number {sequence_number} no longer stored");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::packetizer::RtpPacketizer;
    use crate::media::rtp::RtpPacketizationConfig;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn packets(count: usize) -> (Vec<Message>, u16) {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(1, "c", 102, 90000)));
        let first_seq = config.lock().unwrap().sequence_number;
        let packetizer = RtpPacketizer::new(config);
        let messages = (0..count)
            .map(|i| packetizer.packetize(format!("payload-{i}").as_bytes(), false))
            .collect();
        (messages, first_seq)
    }

    #[test]
    fn test_retransmits_stored_packet() {
        let mut responder = RtcpNackResponder::default();
        let (mut messages, first_seq) = packets(5);
        let original = messages[2].payload.clone();
        responder.outgoing(&mut messages, &mut |_| {});

        let lost = first_seq.wrapping_add(2);
        let nack = Message::binary(Nack::from_sequence_numbers(7, 1, &[lost]).marshal());
        let mut inbound = vec![nack];
        let mut retransmitted = Vec::new();
        responder.incoming(&mut inbound, &mut |m| retransmitted.push(m));

        assert_eq!(retransmitted.len(), 1);
        assert_eq!(retransmitted[0].payload, original, "identical payload and sequence");
        assert_eq!(inbound.len(), 1, "the NACK itself passes through");
    }

    #[test]
    fn test_unknown_sequence_is_ignored() {
        let mut responder = RtcpNackResponder::default();
        let (mut messages, first_seq) = packets(2);
        responder.outgoing(&mut messages, &mut |_| {});

        let nack = Message::binary(
            Nack::from_sequence_numbers(7, 1, &[first_seq.wrapping_add(1000)]).marshal(),
        );
        let mut inbound = vec![nack];
        let mut retransmitted = Vec::new();
        responder.incoming(&mut inbound, &mut |m| retransmitted.push(m));
        assert!(retransmitted.is_empty());
    }

    #[test]
    fn test_storage_evicts_oldest() {
        let mut responder = RtcpNackResponder::new(3);
        let (mut messages, first_seq) = packets(5);
        responder.outgoing(&mut messages, &mut |_| {});

        assert_eq!(responder.stored.len(), 3);
        assert!(!responder.stored.contains_key(&first_seq));
        assert!(responder
            .stored
            .contains_key(&first_seq.wrapping_add(4)));
    }

    #[test]
    fn test_non_rtp_messages_are_not_stored() {
        let mut responder = RtcpNackResponder::default();
        let mut messages = vec![Message::binary(Bytes::from_static(b"xx"))];
        responder.outgoing(&mut messages, &mut |_| {});
        assert!(responder.stored.is_empty());
    }
}
