//! In-process protocol engines pairing two peers inside one process.
//!
//! The agents rendezvous over a process-global registry keyed by ICE
//! username fragment, the "DTLS" endpoints run a two-message certificate
//! exchange framed inside the DTLS first-byte range, and the "SCTP"
//! association moves whole messages with a trivial chunk header. None of
//! it speaks the real wire protocols; the point is exercising everything
//! above the engine seams — pipelines, demultiplexing, DCEP, queueing,
//! reliability policy and teardown — without network or crypto.
//!
//! An optional loss rate drops partially-reliable traffic, which is how
//! the test suite exercises `max_retransmits` / `max_packet_life_time`
//! semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{trace, warn};
use sha2::{Digest, Sha256};

use crate::backend::{
    Backend, DtlsConfig, DtlsConnected, DtlsEndpoint, DtlsHandler, IceAgent, IceAgentHandler,
    IceParameters, IceRole, SctpAssociation, SctpHandler, SctpIncomingMessage, SctpNotification,
    SctpSendOptions, SelectedCandidatePair, SrtpKeyingMaterial, SrtpProfile, SrtpSession,
};
use crate::callback::Callback;
use crate::configuration::Configuration;
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::transport::State;
use crate::utils::random_string;

/// Process-global rendezvous: ufrag -> inbound datagram queue.
static WIRES: Mutex<Option<HashMap<String, Arc<Queue<Bytes>>>>> = Mutex::new(None);

fn register_wire(ufrag: &str, queue: Arc<Queue<Bytes>>) {
    let mut wires = WIRES.lock().unwrap();
    wires
        .get_or_insert_with(HashMap::new)
        .insert(ufrag.to_string(), queue);
}

fn lookup_wire(ufrag: &str) -> Option<Arc<Queue<Bytes>>> {
    let wires = WIRES.lock().unwrap();
    wires.as_ref().and_then(|map| map.get(ufrag).cloned())
}

fn unregister_wire(ufrag: &str) {
    let mut wires = WIRES.lock().unwrap();
    if let Some(map) = wires.as_mut() {
        map.remove(ufrag);
    }
}

/// In-process backend; see the module docs.
pub struct LoopbackBackend {
    /// Probability in [0, 1] that a partially-reliable SCTP message is
    /// dropped instead of delivered.
    loss_rate: f64,
}

impl LoopbackBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { loss_rate: 0.0 })
    }

    /// A backend dropping partially-reliable messages with the given
    /// probability.
    pub fn with_loss(loss_rate: f64) -> Arc<Self> {
        Arc::new(Self { loss_rate })
    }
}

impl Backend for LoopbackBackend {
    fn new_ice_agent(&self, _config: &Configuration) -> Result<Box<dyn IceAgent>> {
        Ok(Box::new(LoopbackIceAgent::new()))
    }

    fn new_dtls_endpoint(&self, config: DtlsConfig) -> Result<Box<dyn DtlsEndpoint>> {
        Ok(Box::new(LoopbackDtlsEndpoint::new(config)))
    }

    fn new_sctp_association(&self) -> Result<Box<dyn SctpAssociation>> {
        Ok(Box::new(LoopbackSctpAssociation::new(self.loss_rate)))
    }

    fn new_srtp_session(&self, keying_material: &SrtpKeyingMaterial) -> Result<Box<dyn SrtpSession>> {
        Ok(Box::new(LoopbackSrtpSession {
            _profile: keying_material.profile,
        }))
    }
}

// ---- ICE ----

struct LoopbackIceAgent {
    parameters: IceParameters,
    inbound: Arc<Queue<Bytes>>,
    peer: Mutex<Option<Arc<Queue<Bytes>>>>,
    state_callback: Mutex<Option<Callback<State>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl LoopbackIceAgent {
    fn new() -> Self {
        Self {
            parameters: IceParameters {
                username_fragment: random_string(8),
                password: random_string(24),
            },
            inbound: Arc::new(Queue::new(0)),
            peer: Mutex::new(None),
            state_callback: Mutex::new(None),
            pump: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }
}

impl IceAgent for LoopbackIceAgent {
    fn start(&self, mut handler: IceAgentHandler) -> Result<()> {
        register_wire(&self.parameters.username_fragment, Arc::clone(&self.inbound));

        (handler.on_state_change)(State::Connecting);
        // a single virtual host candidate, then gathering finishes
        (handler.on_candidate)(
            "candidate:1 1 UDP 2122317823 127.0.0.1 9 typ host".to_string(),
        );
        (handler.on_gathering_done)(());

        *self.state_callback.lock().unwrap() = Some(handler.on_state_change);

        let inbound = Arc::clone(&self.inbound);
        let mut on_recv = handler.on_recv;
        let pump = thread::Builder::new()
            .name("loopback-ice-pump".to_string())
            .spawn(move || {
                while let Some(datagram) = inbound.pop() {
                    on_recv(datagram);
                }
            })
            .map_err(|e| Error::Other(e.to_string()))?;
        *self.pump.lock().unwrap() = Some(pump);
        Ok(())
    }

    fn local_parameters(&self) -> IceParameters {
        self.parameters.clone()
    }

    fn set_remote_parameters(&self, parameters: IceParameters, _role: IceRole) -> Result<()> {
        let Some(peer) = lookup_wire(&parameters.username_fragment) else {
            return Err(Error::ErrNotAvailable);
        };
        *self.peer.lock().unwrap() = Some(peer);
        if let Some(callback) = self.state_callback.lock().unwrap().as_mut() {
            callback(State::Connected);
        }
        Ok(())
    }

    fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        trace!("Loopback agent ignores candidate: {candidate}");
        Ok(())
    }

    fn selected_pair(&self) -> Option<SelectedCandidatePair> {
        self.peer.lock().unwrap().as_ref().map(|_| SelectedCandidatePair {
            local: "127.0.0.1:9".to_string(),
            remote: "127.0.0.1:9".to_string(),
            rtt: Some(Duration::ZERO),
        })
    }

    fn send(&self, data: Bytes) -> Result<()> {
        let peer = self.peer.lock().unwrap().clone();
        match peer {
            Some(peer) => {
                peer.push(data);
                Ok(())
            }
            None => Err(Error::ErrNotOpen),
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        unregister_wire(&self.parameters.username_fragment);
        self.inbound.stop();
        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.join();
        }
    }
}

// ---- DTLS ----

const RECORD_HANDSHAKE: u8 = 22;
const RECORD_DATA: u8 = 23;

struct LoopbackDtlsEndpoint {
    config: DtlsConfig,
    on_output: Mutex<Option<Callback<Bytes>>>,
    on_data: Mutex<Option<Callback<Bytes>>>,
    on_connected: Mutex<Option<Callback<DtlsConnected>>>,
    connected: AtomicBool,
}

impl LoopbackDtlsEndpoint {
    fn new(config: DtlsConfig) -> Self {
        Self {
            config,
            on_output: Mutex::new(None),
            on_data: Mutex::new(None),
            on_connected: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn hello(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.config.certificate_der.len());
        buf.put_u8(RECORD_HANDSHAKE);
        buf.put_u16(self.config.certificate_der.len() as u16);
        buf.extend_from_slice(&self.config.certificate_der);
        buf.freeze()
    }

    fn output(&self, record: Bytes) {
        if let Some(callback) = self.on_output.lock().unwrap().as_mut() {
            callback(record);
        }
    }

    fn complete(&self, peer_certificate_der: Bytes) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        let srtp_keying_material = self.config.export_srtp.then(|| {
            // both sides derive the same exporter output from the
            // certificate pair, ordered by role
            let (client, server) = if self.config.is_client {
                (&self.config.certificate_der, &peer_certificate_der)
            } else {
                (&peer_certificate_der, &self.config.certificate_der)
            };
            let mut hasher = Sha256::new();
            hasher.update(client);
            hasher.update(server);
            SrtpKeyingMaterial {
                profile: SrtpProfile::default(),
                material: Bytes::from(hasher.finalize().to_vec()),
            }
        });
        if let Some(callback) = self.on_connected.lock().unwrap().as_mut() {
            callback(DtlsConnected {
                peer_certificate_der,
                srtp_keying_material,
            });
        }
    }
}

impl DtlsEndpoint for LoopbackDtlsEndpoint {
    fn start(&self, handler: DtlsHandler) -> Result<()> {
        *self.on_output.lock().unwrap() = Some(handler.on_output);
        *self.on_data.lock().unwrap() = Some(handler.on_data);
        *self.on_connected.lock().unwrap() = Some(handler.on_connected);
        if self.config.is_client {
            self.output(self.hello());
        }
        Ok(())
    }

    fn handle_input(&self, datagram: Bytes) -> Result<()> {
        let mut buf = datagram.clone();
        if buf.remaining() < 1 {
            return Err(Error::ErrProtocol("empty record".to_string()));
        }
        match buf.get_u8() {
            RECORD_HANDSHAKE => {
                if buf.remaining() < 2 {
                    return Err(Error::ErrProtocol("short handshake record".to_string()));
                }
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    return Err(Error::ErrProtocol("truncated certificate".to_string()));
                }
                let peer_certificate_der = buf.copy_to_bytes(len);
                if !self.config.is_client && !self.connected.load(Ordering::SeqCst) {
                    // the server answers with its own flight
                    self.output(self.hello());
                }
                self.complete(peer_certificate_der);
                Ok(())
            }
            RECORD_DATA => {
                let payload = buf.copy_to_bytes(buf.remaining());
                if let Some(callback) = self.on_data.lock().unwrap().as_mut() {
                    callback(payload);
                }
                Ok(())
            }
            other => Err(Error::ErrProtocol(format!("unknown record type {other}"))),
        }
    }

    fn send(&self, payload: Bytes) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ErrNotOpen);
        }
        let mut record = BytesMut::with_capacity(1 + payload.len());
        record.put_u8(RECORD_DATA);
        record.extend_from_slice(&payload);
        self.output(record.freeze());
        Ok(())
    }

    fn stop(&self) {
        self.on_output.lock().unwrap().take();
        self.on_data.lock().unwrap().take();
        self.on_connected.lock().unwrap().take();
    }
}

// ---- SCTP ----

const CHUNK_INIT: u8 = 1;
const CHUNK_INIT_ACK: u8 = 2;
const CHUNK_DATA: u8 = 3;
const CHUNK_RESET: u8 = 4;
const CHUNK_SHUTDOWN: u8 = 5;
const CHUNK_SHUTDOWN_ACK: u8 = 6;
const CHUNK_ABORT: u8 = 7;

struct LoopbackSctpAssociation {
    loss_rate: f64,
    on_output: Mutex<Option<Callback<Bytes>>>,
    on_message: Mutex<Option<Callback<SctpIncomingMessage>>>,
    on_notification: Mutex<Option<Callback<SctpNotification>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackSctpAssociation {
    fn new(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            on_output: Mutex::new(None),
            on_message: Mutex::new(None),
            on_notification: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn output(&self, packet: Bytes) {
        if let Some(callback) = self.on_output.lock().unwrap().as_mut() {
            callback(packet);
        }
    }

    fn notify(&self, notification: SctpNotification) {
        if let Some(callback) = self.on_notification.lock().unwrap().as_mut() {
            callback(notification);
        }
    }

    fn chunk(kind: u8, stream: u16, ppid: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(7 + payload.len());
        buf.put_u8(kind);
        buf.put_u16(stream);
        buf.put_u32(ppid);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    fn establish(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.notify(SctpNotification::Connected);
        }
    }

    fn wind_down(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            self.notify(SctpNotification::Disconnected);
        }
    }
}

impl SctpAssociation for LoopbackSctpAssociation {
    fn start(
        &self,
        handler: SctpHandler,
        _local_port: u16,
        _remote_port: u16,
        is_client: bool,
    ) -> Result<()> {
        *self.on_output.lock().unwrap() = Some(handler.on_output);
        *self.on_message.lock().unwrap() = Some(handler.on_message);
        *self.on_notification.lock().unwrap() = Some(handler.on_notification);
        if is_client {
            // only the DTLS client side opens the association
            self.output(Self::chunk(CHUNK_INIT, 0, 0, &[]));
        }
        Ok(())
    }

    fn handle_input(&self, packet: Bytes) -> Result<()> {
        let mut buf = packet.clone();
        if buf.remaining() < 7 {
            return Err(Error::ErrProtocol("short SCTP chunk".to_string()));
        }
        let kind = buf.get_u8();
        let stream = buf.get_u16();
        let ppid = buf.get_u32();
        match kind {
            CHUNK_INIT => {
                self.output(Self::chunk(CHUNK_INIT_ACK, 0, 0, &[]));
                self.establish();
            }
            CHUNK_INIT_ACK => self.establish(),
            CHUNK_DATA => {
                let data = buf.copy_to_bytes(buf.remaining());
                if let Some(callback) = self.on_message.lock().unwrap().as_mut() {
                    callback(SctpIncomingMessage { stream, ppid, data });
                }
            }
            CHUNK_RESET => self.notify(SctpNotification::StreamReset { stream }),
            CHUNK_SHUTDOWN => {
                self.output(Self::chunk(CHUNK_SHUTDOWN_ACK, 0, 0, &[]));
                self.wind_down();
            }
            CHUNK_SHUTDOWN_ACK | CHUNK_ABORT => self.wind_down(),
            other => warn!("Unknown loopback SCTP chunk {other}"),
        }
        Ok(())
    }

    fn send(&self, options: &SctpSendOptions, data: Bytes) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ErrNotOpen);
        }
        let partial_reliability =
            options.max_retransmits.is_some() || options.max_packet_life_time.is_some();
        let dropped = partial_reliability && rand::random::<f64>() < self.loss_rate;
        if dropped {
            trace!(
                "Loopback association abandons message on stream {}",
                options.stream
            );
        } else {
            self.output(Self::chunk(CHUNK_DATA, options.stream, options.ppid, &data));
        }
        // transmitted or abandoned, the bytes left the send buffer
        self.notify(SctpNotification::WriteSpace {
            stream: options.stream,
            amount: data.len(),
        });
        Ok(())
    }

    fn reset_stream(&self, stream: u16) -> Result<()> {
        self.output(Self::chunk(CHUNK_RESET, stream, 0, &[]));
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        65536
    }

    fn rtt(&self) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    fn shutdown(&self) -> Result<()> {
        self.output(Self::chunk(CHUNK_SHUTDOWN, 0, 0, &[]));
        Ok(())
    }

    fn abort(&self) {
        self.output(Self::chunk(CHUNK_ABORT, 0, 0, &[]));
        self.wind_down();
    }
}

// ---- SRTP ----

/// Identity "cipher": the loopback session neither encrypts nor
/// authenticates.
struct LoopbackSrtpSession {
    _profile: SrtpProfile,
}

impl SrtpSession for LoopbackSrtpSession {
    fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_agents_link_by_ufrag() {
        let a = LoopbackIceAgent::new();
        let b = LoopbackIceAgent::new();

        let received = Arc::new(Mutex::new(Vec::<Bytes>::new()));
        let r = Arc::clone(&received);
        a.start(IceAgentHandler {
            on_candidate: Box::new(|_| {}),
            on_gathering_done: Box::new(|_| {}),
            on_state_change: Box::new(|_| {}),
            on_recv: Box::new(|_| {}),
        })
        .unwrap();
        b.start(IceAgentHandler {
            on_candidate: Box::new(|_| {}),
            on_gathering_done: Box::new(|_| {}),
            on_state_change: Box::new(|_| {}),
            on_recv: Box::new(move |data| r.lock().unwrap().push(data)),
        })
        .unwrap();

        a.set_remote_parameters(b.local_parameters(), IceRole::Controlling)
            .unwrap();
        b.set_remote_parameters(a.local_parameters(), IceRole::Controlled)
            .unwrap();

        a.send(Bytes::from_static(b"ping")).unwrap();
        for _ in 0..100 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&received.lock().unwrap()[0][..], b"ping");

        a.stop();
        b.stop();
    }

    #[test]
    fn test_dtls_endpoints_exchange_certificates() {
        let client = Arc::new(LoopbackDtlsEndpoint::new(DtlsConfig {
            is_client: true,
            certificate_der: Bytes::from_static(b"client-cert"),
            private_key_der: Bytes::new(),
            mtu: 1280,
            export_srtp: true,
        }));
        let server = Arc::new(LoopbackDtlsEndpoint::new(DtlsConfig {
            is_client: false,
            certificate_der: Bytes::from_static(b"server-cert"),
            private_key_der: Bytes::new(),
            mtu: 1280,
            export_srtp: true,
        }));

        let client_out = Arc::new(Mutex::new(Vec::<Bytes>::new()));
        let server_out = Arc::new(Mutex::new(Vec::<Bytes>::new()));
        let client_peer = Arc::new(Mutex::new(None::<DtlsConnected>));
        let server_peer = Arc::new(Mutex::new(None::<DtlsConnected>));

        let co = Arc::clone(&client_out);
        let cp = Arc::clone(&client_peer);
        client
            .start(DtlsHandler {
                on_output: Box::new(move |r| co.lock().unwrap().push(r)),
                on_data: Box::new(|_| {}),
                on_connected: Box::new(move |c| *cp.lock().unwrap() = Some(c)),
                on_error: Box::new(|_| {}),
            })
            .unwrap();
        let so = Arc::clone(&server_out);
        let sp = Arc::clone(&server_peer);
        server
            .start(DtlsHandler {
                on_output: Box::new(move |r| so.lock().unwrap().push(r)),
                on_data: Box::new(|_| {}),
                on_connected: Box::new(move |c| *sp.lock().unwrap() = Some(c)),
                on_error: Box::new(|_| {}),
            })
            .unwrap();

        // shuttle the handshake flights
        let flight = client_out.lock().unwrap().remove(0);
        server.handle_input(flight).unwrap();
        let flight = server_out.lock().unwrap().remove(0);
        client.handle_input(flight).unwrap();

        let client_peer = client_peer.lock().unwrap();
        let server_peer = server_peer.lock().unwrap();
        assert_eq!(
            &client_peer.as_ref().unwrap().peer_certificate_der[..],
            b"server-cert"
        );
        assert_eq!(
            &server_peer.as_ref().unwrap().peer_certificate_der[..],
            b"client-cert"
        );
        // exporter output matches on both sides
        assert_eq!(
            &client_peer
                .as_ref()
                .unwrap()
                .srtp_keying_material
                .as_ref()
                .unwrap()
                .material[..],
            &server_peer
                .as_ref()
                .unwrap()
                .srtp_keying_material
                .as_ref()
                .unwrap()
                .material[..],
        );
    }
}
