//! Data channel establishment protocol messages, RFC 8832.
//!
//! Both messages travel on the channel's own stream with PPID 50, network
//! byte order.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::Reliability;

const MESSAGE_TYPE_ACK: u8 = 0x02;
const MESSAGE_TYPE_OPEN: u8 = 0x03;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_PARTIAL_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_TIMED: u8 = 0x02;
const CHANNEL_TYPE_UNORDERED_FLAG: u8 = 0x80;

/// DCEP OPEN: carried on the initiator's chosen stream, answered by ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DcepOpen {
    pub(crate) reliability: Reliability,
    pub(crate) priority: u16,
    pub(crate) label: String,
    pub(crate) protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DcepMessage {
    Open(DcepOpen),
    Ack,
}

impl DcepMessage {
    pub(crate) fn marshal(&self) -> Bytes {
        match self {
            DcepMessage::Ack => {
                let mut buf = BytesMut::with_capacity(1);
                buf.put_u8(MESSAGE_TYPE_ACK);
                buf.freeze()
            }
            DcepMessage::Open(open) => {
                let (channel_type, reliability_parameter) = encode_reliability(&open.reliability);
                let mut buf =
                    BytesMut::with_capacity(12 + open.label.len() + open.protocol.len());
                buf.put_u8(MESSAGE_TYPE_OPEN);
                buf.put_u8(channel_type);
                buf.put_u16(open.priority);
                buf.put_u32(reliability_parameter);
                buf.put_u16(open.label.len() as u16);
                buf.put_u16(open.protocol.len() as u16);
                buf.put_slice(open.label.as_bytes());
                buf.put_slice(open.protocol.as_bytes());
                buf.freeze()
            }
        }
    }

    pub(crate) fn unmarshal(data: &Bytes) -> Result<Self> {
        let mut buf = data.clone();
        if buf.remaining() < 1 {
            return Err(Error::ErrUnexpectedEndOfBuffer {
                expected: 1,
                actual: 0,
            });
        }
        match buf.get_u8() {
            MESSAGE_TYPE_ACK => Ok(DcepMessage::Ack),
            MESSAGE_TYPE_OPEN => {
                if buf.remaining() < 11 {
                    return Err(Error::ErrUnexpectedEndOfBuffer {
                        expected: 11,
                        actual: buf.remaining(),
                    });
                }
                let channel_type = buf.get_u8();
                let priority = buf.get_u16();
                let reliability_parameter = buf.get_u32();
                let label_len = buf.get_u16() as usize;
                let protocol_len = buf.get_u16() as usize;
                if buf.remaining() < label_len + protocol_len {
                    return Err(Error::ErrUnexpectedEndOfBuffer {
                        expected: label_len + protocol_len,
                        actual: buf.remaining(),
                    });
                }
                let label = String::from_utf8(buf.copy_to_bytes(label_len).to_vec())?;
                let protocol = String::from_utf8(buf.copy_to_bytes(protocol_len).to_vec())?;
                let reliability = decode_reliability(channel_type, reliability_parameter)?;
                Ok(DcepMessage::Open(DcepOpen {
                    reliability,
                    priority,
                    label,
                    protocol,
                }))
            }
            other => Err(Error::ErrProtocol(format!("unknown DCEP message type {other:#04x}"))),
        }
    }
}

fn encode_reliability(reliability: &Reliability) -> (u8, u32) {
    let (mut channel_type, parameter) = if let Some(count) = reliability.max_retransmits {
        (CHANNEL_TYPE_PARTIAL_REXMIT, count as u32)
    } else if let Some(lifetime) = reliability.max_packet_life_time {
        (CHANNEL_TYPE_PARTIAL_TIMED, lifetime.as_millis() as u32)
    } else {
        (CHANNEL_TYPE_RELIABLE, 0)
    };
    if reliability.unordered {
        channel_type |= CHANNEL_TYPE_UNORDERED_FLAG;
    }
    (channel_type, parameter)
}

fn decode_reliability(channel_type: u8, parameter: u32) -> Result<Reliability> {
    let unordered = channel_type & CHANNEL_TYPE_UNORDERED_FLAG != 0;
    let mut reliability = Reliability {
        unordered,
        ..Default::default()
    };
    match channel_type & !CHANNEL_TYPE_UNORDERED_FLAG {
        CHANNEL_TYPE_RELIABLE => {}
        CHANNEL_TYPE_PARTIAL_REXMIT => reliability.max_retransmits = Some(parameter as usize),
        CHANNEL_TYPE_PARTIAL_TIMED => {
            reliability.max_packet_life_time = Some(Duration::from_millis(u64::from(parameter)))
        }
        other => {
            return Err(Error::ErrProtocol(format!(
                "unknown DCEP channel type {other:#04x}"
            )))
        }
    }
    Ok(reliability)
}
