use crate::callback::Callback;
use crate::media::rtcp::parse_remb;
use crate::media::MediaHandler;
use crate::message::Message;

/// Surfaces Receiver Estimated Maximum Bitrate feedback.
///
/// Scans incoming compound RTCP for a REMB message and reports the
/// advertised bitrate in bits per second; all traffic passes through
/// untouched.
pub struct RembHandler {
    on_remb: Callback<u64>,
}

impl RembHandler {
    pub fn new(on_remb: Callback<u64>) -> Self {
        Self { on_remb }
    }
}

impl MediaHandler for RembHandler {
    fn incoming(&mut self, messages: &mut Vec<Message>, _send: &mut dyn FnMut(Message)) {
        for message in messages.iter() {
            let mut bitrate = None;
            crate::media::rtcp::for_each_packet(&message.payload, |_, packet| {
                if bitrate.is_none() {
                    bitrate = parse_remb(packet);
                }
            });
            if let Some(bitrate) = bitrate {
                (self.on_remb)(bitrate);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn remb_packet(exponent: u8, mantissa: u32) -> Message {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80 | 15);
        buf.put_u8(206);
        buf.put_u16(4);
        buf.put_u32(7);
        buf.put_u32(0);
        buf.put_slice(b"REMB");
        buf.put_u8(1);
        buf.put_u8(exponent << 2 | ((mantissa >> 16) as u8 & 0x03));
        buf.put_u8((mantissa >> 8) as u8);
        buf.put_u8(mantissa as u8);
        Message::binary(buf.freeze())
    }

    #[test]
    fn test_reports_bitrate() {
        let bitrate = Arc::new(AtomicU64::new(0));
        let b = Arc::clone(&bitrate);
        let mut handler = RembHandler::new(Box::new(move |value| {
            b.store(value, Ordering::SeqCst);
        }));

        let mut messages = vec![remb_packet(0, 250_000)];
        handler.incoming(&mut messages, &mut |_| {});
        assert_eq!(bitrate.load(Ordering::SeqCst), 250_000);
        assert_eq!(messages.len(), 1, "message passes through");
    }
}
