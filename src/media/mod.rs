use crate::message::Message;

pub(crate) mod audio;
pub(crate) mod h264;
pub(crate) mod nack_responder;
pub(crate) mod packetizer;
pub(crate) mod remb;
pub(crate) mod rtcp;
pub(crate) mod rtp;
pub(crate) mod sr_reporter;
pub(crate) mod vp8;
pub(crate) mod vp9;

pub use audio::{OpusPacketizationHandler, PcmaPacketizationHandler, PcmuPacketizationHandler};
pub use h264::{H264PacketizationHandler, NalUnitSeparator};
pub use nack_responder::RtcpNackResponder;
pub use packetizer::RtpPacketizer;
pub use remb::RembHandler;
pub use rtcp::{Nack, SenderReport};
pub use rtp::{RtpHeader, RtpPacketizationConfig};
pub use sr_reporter::RtcpSrReporter;
pub use vp8::Vp8PacketizationHandler;
pub use vp9::Vp9PacketizationHandler;

/// One element of a track's media-handler chain.
///
/// Outbound messages run through the chain head to tail, inbound messages
/// tail to head. A handler edits the message vector in place: replacing a
/// sample with its packetized form, appending reports, or draining it to
/// drop traffic. `send` transmits a message in the opposite direction of
/// the one being processed, e.g. a retransmission in response to an
/// incoming NACK.
pub trait MediaHandler: Send {
    fn incoming(&mut self, messages: &mut Vec<Message>, send: &mut dyn FnMut(Message)) {
        let _ = (messages, send);
    }

    fn outgoing(&mut self, messages: &mut Vec<Message>, send: &mut dyn FnMut(Message)) {
        let _ = (messages, send);
    }
}

/// Runs `messages` through the chain in outbound order.
pub(crate) fn chain_outgoing(
    handlers: &mut [Box<dyn MediaHandler>],
    messages: &mut Vec<Message>,
    send: &mut dyn FnMut(Message),
) {
    for handler in handlers.iter_mut() {
        handler.outgoing(messages, send);
        if messages.is_empty() {
            return;
        }
    }
}

/// Runs `messages` through the chain in inbound order (tail to head).
pub(crate) fn chain_incoming(
    handlers: &mut [Box<dyn MediaHandler>],
    messages: &mut Vec<Message>,
    send: &mut dyn FnMut(Message),
) {
    for handler in handlers.iter_mut().rev() {
        handler.incoming(messages, send);
        if messages.is_empty() {
            return;
        }
    }
}
