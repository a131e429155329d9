use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    #[default]
    Binary,
    String,
    Control,
    Reset,
}

/// Per-stream reliability policy.
///
/// If both `max_packet_life_time` and `max_retransmits` are unset, the
/// stream is reliable. The settings are exclusive, so both must not be set
/// at the same time. Immutable once the owning channel is open.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reliability {
    /// If true, the stream does not enforce message ordering and
    /// out-of-order delivery is allowed.
    pub unordered: bool,
    /// Time window during which transmissions and retransmissions may occur.
    pub max_packet_life_time: Option<Duration>,
    /// Maximum number of retransmissions that are attempted.
    pub max_retransmits: Option<usize>,
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        self.max_packet_life_time.is_none() && self.max_retransmits.is_none()
    }
}

/// Media frame metadata attached to an outbound sample.
#[derive(Debug, Default, Clone)]
pub struct FrameInfo {
    pub timestamp: u32,
    pub payload_type: u8,
    /// Wall-clock sample time relative to the stream epoch, if known.
    pub timestamp_seconds: Option<Duration>,
}

impl FrameInfo {
    pub fn new(timestamp: u32, payload_type: u8, timestamp_seconds: Option<Duration>) -> FrameInfo {
        Self {
            timestamp,
            payload_type,
            timestamp_seconds,
        }
    }
}

/// A tagged byte buffer travelling through the transport pipeline.
///
/// Transports may wrap a message but never mutate its payload bytes; the
/// buffer is freed when all consumers drop their reference.
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub message_type: MessageType,
    /// SCTP stream id, or SSRC-selecting stream for media transports.
    pub stream: Option<u16>,
    /// Differentiated Services Code Point hint.
    pub dscp: Option<u8>,
    pub reliability: Option<Arc<Reliability>>,
    pub frame_info: Option<Arc<FrameInfo>>,
    pub payload: Bytes,
}

impl Message {
    pub fn binary(payload: Bytes) -> Self {
        Self {
            message_type: MessageType::Binary,
            payload,
            ..Default::default()
        }
    }

    pub fn string(payload: Bytes) -> Self {
        Self {
            message_type: MessageType::String,
            payload,
            ..Default::default()
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self {
            message_type: MessageType::Control,
            payload,
            ..Default::default()
        }
    }

    pub fn reset(stream: u16) -> Self {
        Self {
            message_type: MessageType::Reset,
            stream: Some(stream),
            ..Default::default()
        }
    }

    pub fn with_stream(mut self, stream: u16) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Amount function weighing a message by its payload size, for byte-bounded
/// queues.
pub(crate) fn message_size_func(message: &Message) -> usize {
    message.payload.len()
}
