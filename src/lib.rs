//! Peer-to-peer real-time communication: data channels and media tracks
//! over a layered ICE / DTLS / SCTP / SRTP transport pipeline, plus a
//! WebSocket client and server for out-of-band signaling.
//!
//! The protocol engines themselves (the ICE agent, the DTLS record layer,
//! the SCTP stack and the SRTP cipher) are collaborators behind the
//! [`backend`] traits; this crate owns everything above them: the
//! transport state machines, RFC 7983 demultiplexing, DCEP channel
//! establishment, outbound queueing with buffered-amount accounting, RTP
//! packetization with RTCP SR / NACK handling, and SDP offer/answer
//! orchestration.
//!
//! ```no_run
//! use rtcdc::{Configuration, PeerConnection};
//!
//! # fn example(backend: std::sync::Arc<dyn rtcdc::backend::Backend>) -> rtcdc::Result<()> {
//! let config = Configuration {
//!     backend: Some(backend),
//!     ..Default::default()
//! };
//! let pc = PeerConnection::new(config)?;
//! pc.on_local_description(Some(Box::new(|description| {
//!     // ship `description.to_string()` to the peer
//! })));
//! let channel = pc.create_data_channel("chat", None)?;
//! channel.on_open(Some(Box::new(move |_| {
//!     // channel.send(b"hello") from a clone captured here
//! })));
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod backend;
mod callback;
mod certificate;
mod configuration;
mod data_channel;
mod error;
mod internal;
mod media;
mod message;
mod peer_connection;
mod queue;
mod runtime;
pub mod sdp;
mod track;
mod transport;
mod utils;
pub mod websocket;

pub use callback::Callback;
pub use certificate::Certificate;
pub use configuration::{CertificateType, Configuration, IceServer, IceTransportPolicy};
pub use data_channel::{DataChannel, DataChannelInit, DataChannelState};
pub use error::{Error, Result};
pub use media::{
    H264PacketizationHandler, MediaHandler, Nack, NalUnitSeparator, OpusPacketizationHandler,
    PcmaPacketizationHandler, PcmuPacketizationHandler, RembHandler, RtcpNackResponder,
    RtcpSrReporter, RtpHeader, RtpPacketizationConfig, RtpPacketizer, SenderReport,
    Vp8PacketizationHandler, Vp9PacketizationHandler,
};
pub use message::{FrameInfo, Message, MessageType, Reliability};
pub use peer_connection::{PeerConnection, PeerConnectionState, SignalingState};
pub use queue::Queue;
pub use runtime::{Processor, Runtime};
pub use track::Track;
pub use transport::ice::GatheringState;
pub use websocket::{
    WebSocket, WebSocketConfiguration, WebSocketServer, WebSocketServerConfiguration,
    WebSocketState,
};
