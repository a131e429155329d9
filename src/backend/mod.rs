//! Interfaces of the external protocol engines the pipeline composes.
//!
//! The ICE agent, DTLS endpoint, SCTP stack and SRTP cipher session are
//! collaborators, not part of this library; they are named only by their
//! interface here, the way the upstream design treats its juice, usrsctp
//! and TLS backends. A [`Backend`] bundles factories for all four and is
//! supplied through [`Configuration::backend`](crate::Configuration).
//!
//! The [`loopback`] module provides an in-process backend used by the test
//! suite and local harnesses.

use std::time::Duration;

use bytes::Bytes;

use crate::callback::Callback;
use crate::configuration::Configuration;
use crate::error::{Error, Result};
use crate::transport::State;

pub mod loopback;

/// Local ICE credentials advertised in the SDP.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// The nominated candidate pair, with the measured round-trip time if the
/// agent knows one.
#[derive(Debug, Clone)]
pub struct SelectedCandidatePair {
    pub local: String,
    pub remote: String,
    pub rtt: Option<Duration>,
}

/// Upcalls installed on an ICE agent when it starts.
pub struct IceAgentHandler {
    /// A locally gathered candidate line, without the `a=` prefix.
    pub on_candidate: Callback<String>,
    pub on_gathering_done: Callback<()>,
    pub on_state_change: Callback<State>,
    /// A datagram received on the selected pair.
    pub on_recv: Callback<Bytes>,
}

/// Connectivity-establishment engine, RFC 8445.
///
/// Engines take `&self` and synchronize internally: upcalls may run
/// concurrently with downcalls, and an upcall is allowed to issue a
/// downcall on the same thread. Implementations must not hold a lock
/// across an upcall that a downcall also takes.
pub trait IceAgent: Send + Sync {
    /// Installs the upcalls and begins gathering local candidates.
    fn start(&self, handler: IceAgentHandler) -> Result<()>;
    fn local_parameters(&self) -> IceParameters;
    fn set_remote_parameters(&self, parameters: IceParameters, role: IceRole) -> Result<()>;
    fn add_remote_candidate(&self, candidate: &str) -> Result<()>;
    fn selected_pair(&self) -> Option<SelectedCandidatePair>;
    /// Sends a datagram on the selected pair.
    fn send(&self, data: Bytes) -> Result<()>;
    fn stop(&self);
}

/// SRTP protection profile negotiated by DTLS-SRTP.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum SrtpProfile {
    #[default]
    AesCm128HmacSha1_80,
    AesGcm128,
}

/// Exporter output keying the SRTP sessions, RFC 5764.
#[derive(Debug, Clone)]
pub struct SrtpKeyingMaterial {
    pub profile: SrtpProfile,
    pub material: Bytes,
}

/// Settings for a DTLS endpoint about to handshake.
pub struct DtlsConfig {
    pub is_client: bool,
    /// Local certificate, DER.
    pub certificate_der: Bytes,
    /// Local private key, PKCS#8 DER.
    pub private_key_der: Bytes,
    /// Upper bound for outgoing record size.
    pub mtu: usize,
    /// Negotiate the use_srtp extension and export keying material.
    pub export_srtp: bool,
}

/// Handshake-completion report.
pub struct DtlsConnected {
    /// The peer certificate, DER, for fingerprint verification.
    pub peer_certificate_der: Bytes,
    pub srtp_keying_material: Option<SrtpKeyingMaterial>,
}

/// Upcalls installed on a DTLS endpoint when it starts.
pub struct DtlsHandler {
    /// An encrypted record to put on the wire.
    pub on_output: Callback<Bytes>,
    /// Decrypted application data.
    pub on_data: Callback<Bytes>,
    pub on_connected: Callback<DtlsConnected>,
    pub on_error: Callback<Error>,
}

/// Datagram TLS engine, RFC 6347. Locking contract as for [`IceAgent`].
pub trait DtlsEndpoint: Send + Sync {
    /// Installs the upcalls and, for the client role, emits the first
    /// handshake flight.
    fn start(&self, handler: DtlsHandler) -> Result<()>;
    /// Feeds one datagram received from the wire.
    fn handle_input(&self, datagram: Bytes) -> Result<()>;
    /// Encrypts application data into one or more records.
    fn send(&self, payload: Bytes) -> Result<()>;
    fn stop(&self);
}

/// Per-send reliability and identification parameters, mirroring
/// `sctp_sendv_spa`.
#[derive(Debug, Default, Clone)]
pub struct SctpSendOptions {
    pub stream: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub max_retransmits: Option<usize>,
    pub max_packet_life_time: Option<Duration>,
}

/// A received, fully reassembled chunk payload.
#[derive(Debug, Clone)]
pub struct SctpIncomingMessage {
    pub stream: u16,
    pub ppid: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum SctpNotification {
    /// The association reached the established state.
    Connected,
    /// The association ended or the peer went away.
    Disconnected,
    /// The association failed; the inner string names the cause.
    Failed(String),
    /// `amount` bytes previously accepted for `stream` have left the send
    /// buffer (transmitted or abandoned).
    WriteSpace { stream: u16, amount: usize },
    /// The peer reset the given stream.
    StreamReset { stream: u16 },
}

/// Upcalls installed on an SCTP association when it starts.
pub struct SctpHandler {
    /// An SCTP packet to hand to the DTLS transport below.
    pub on_output: Callback<Bytes>,
    pub on_message: Callback<SctpIncomingMessage>,
    pub on_notification: Callback<SctpNotification>,
}

/// SCTP protocol engine carrying an association over DTLS, RFC 8261.
/// Locking contract as for [`IceAgent`].
pub trait SctpAssociation: Send + Sync {
    /// Installs the upcalls. The DTLS client side actively connects; the
    /// other side waits for INIT.
    fn start(
        &self,
        handler: SctpHandler,
        local_port: u16,
        remote_port: u16,
        is_client: bool,
    ) -> Result<()>;
    /// Feeds one SCTP packet received from the DTLS transport.
    fn handle_input(&self, packet: Bytes) -> Result<()>;
    /// Hands one message to the association send buffer.
    ///
    /// Returns [`Error::ErrBufferFull`] when the buffer cannot take the
    /// message now; the caller retries after a
    /// [`SctpNotification::WriteSpace`].
    fn send(&self, options: &SctpSendOptions, data: Bytes) -> Result<()>;
    fn reset_stream(&self, stream: u16) -> Result<()>;
    /// Maximum message size advertised by the peer.
    fn max_message_size(&self) -> usize;
    fn rtt(&self) -> Option<Duration>;
    /// Graceful SHUTDOWN exchange.
    fn shutdown(&self) -> Result<()>;
    fn abort(&self);
}

/// SRTP cipher session keyed from DTLS exporter output, RFC 3711.
pub trait SrtpSession: Send {
    fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes>;
    fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes>;
    fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes>;
    fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes>;
}

/// Factory bundle for the four protocol engines.
pub trait Backend: Send + Sync {
    fn new_ice_agent(&self, config: &Configuration) -> Result<Box<dyn IceAgent>>;
    fn new_dtls_endpoint(&self, config: DtlsConfig) -> Result<Box<dyn DtlsEndpoint>>;
    fn new_sctp_association(&self) -> Result<Box<dyn SctpAssociation>>;
    fn new_srtp_session(&self, keying_material: &SrtpKeyingMaterial) -> Result<Box<dyn SrtpSession>>;
}
