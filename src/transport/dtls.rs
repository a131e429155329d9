use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, trace, warn};

use crate::backend::{DtlsConnected, DtlsEndpoint, DtlsHandler, SrtpKeyingMaterial};
use crate::callback::{Callback, CallbackSlot};
use crate::certificate::{fingerprint_matches, make_fingerprint};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::demux::{classify, PacketClass};
use crate::transport::{State, Transport, TransportCore};

/// Datagram TLS over ICE.
///
/// Starts the handshake when the lower transport connects, verifies the
/// peer certificate fingerprint against the remote description, and
/// afterwards moves application data through the DTLS endpoint. Datagrams
/// from the wire are demultiplexed here by their first byte; RTP-class
/// packets go to the hook installed by the SRTP specialization.
pub(crate) struct DtlsTransport {
    core: TransportCore,
    endpoint: Box<dyn DtlsEndpoint>,
    is_client: bool,
    remote_fingerprint: String,
    handshake_started: AtomicBool,
    rtp_hook: CallbackSlot<Message>,
    keying_callback: CallbackSlot<SrtpKeyingMaterial>,
    error_callback: CallbackSlot<Error>,
    dropped_packets: AtomicUsize,
}

impl DtlsTransport {
    pub(crate) fn new(
        lower: Arc<dyn Transport>,
        endpoint: Box<dyn DtlsEndpoint>,
        is_client: bool,
        remote_fingerprint: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: TransportCore::new(Some(lower)),
            endpoint,
            is_client,
            remote_fingerprint,
            handshake_started: AtomicBool::new(false),
            rtp_hook: CallbackSlot::default(),
            keying_callback: CallbackSlot::default(),
            error_callback: CallbackSlot::default(),
            dropped_packets: AtomicUsize::new(0),
        })
    }

    pub(crate) fn is_client(&self) -> bool {
        self.is_client
    }

    pub(crate) fn on_error(&self, callback: Option<Callback<Error>>) {
        self.error_callback.set(callback);
    }

    /// Installed by the SRTP specialization to take over RTP-class
    /// datagrams.
    pub(crate) fn set_rtp_hook(&self, callback: Option<Callback<Message>>) {
        self.rtp_hook.set(callback);
    }

    pub(crate) fn on_keying_material(&self, callback: Option<Callback<SrtpKeyingMaterial>>) {
        self.keying_callback.set(callback);
    }

    /// Number of datagrams dropped by the demultiplexer.
    pub(crate) fn dropped_packets(&self) -> usize {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    /// Sends raw bytes below the record layer, for protected SRTP packets.
    pub(crate) fn send_down(&self, message: Message) -> bool {
        self.core.send_down(message)
    }

    fn begin_handshake(self: &Arc<Self>) {
        if self.handshake_started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "Starting DTLS handshake as {}",
            if self.is_client { "client" } else { "server" }
        );

        let weak = Arc::downgrade(self);
        let handler = DtlsHandler {
            on_output: output_upcall(weak.clone()),
            on_data: data_upcall(weak.clone()),
            on_connected: connected_upcall(weak.clone()),
            on_error: error_upcall(weak),
        };
        if let Err(err) = self.endpoint.start(handler) {
            error!("DTLS handshake could not start: {err}");
            self.fail(err);
        }
    }

    fn handshake_complete(&self, connected: DtlsConnected) {
        let actual = make_fingerprint(&connected.peer_certificate_der);
        if !fingerprint_matches(&actual, &self.remote_fingerprint) {
            error!(
                "DTLS certificate fingerprint mismatch: expected {}, got {actual}",
                self.remote_fingerprint
            );
            self.fail(Error::ErrFingerprintMismatch);
            return;
        }
        debug!("DTLS handshake finished, fingerprint verified");
        if let Some(keying_material) = connected.srtp_keying_material {
            self.keying_callback.call(keying_material);
        }
        self.core.change_state(State::Connected);
    }

    fn fail(&self, err: Error) {
        self.error_callback.call(err);
        self.core.change_state(State::Failed);
    }

    fn incoming(self: &Arc<Self>, message: Message) {
        match classify(&message.payload) {
            PacketClass::Dtls => {
                if let Err(err) = self.endpoint.handle_input(message.payload) {
                    warn!("DTLS record processing failed: {err}");
                }
            }
            PacketClass::Rtp => {
                if !self.rtp_hook.call(message) {
                    self.count_drop("RTP packet without media transport");
                }
            }
            PacketClass::Stun => {
                // STUN is consumed by the ICE agent; anything surfacing here
                // is late or stray.
                self.count_drop("stray STUN datagram");
            }
            PacketClass::TurnChannel => {
                self.count_drop("unhandled TURN channel data");
            }
            PacketClass::Unknown => {
                self.count_drop("datagram with unknown first byte");
            }
        }
    }

    fn count_drop(&self, what: &str) {
        let count = self.dropped_packets.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("Dropping {what} (total dropped: {count})");
    }

    fn lower_state_changed(self: &Arc<Self>, state: State) {
        match state {
            State::Connected | State::Completed => self.begin_handshake(),
            State::Failed => {
                self.core.change_state(State::Failed);
            }
            State::Disconnected => {
                self.core.change_state(State::Disconnected);
            }
            _ => {}
        }
    }
}

impl Transport for DtlsTransport {
    fn start(self: Arc<Self>) -> Result<()> {
        self.core.change_state(State::Connecting);

        if let Some(lower) = self.core.lower() {
            let weak = Arc::downgrade(&self);
            lower.on_state_change(Some(Box::new(move |state| {
                if let Some(transport) = weak.upgrade() {
                    transport.lower_state_changed(state);
                }
            })));

            // start the endpoint before datagrams buffered below flush in
            let lower_state = lower.state();
            if lower_state == State::Connected || lower_state == State::Completed {
                self.begin_handshake();
            }

            let weak = Arc::downgrade(&self);
            lower.on_recv(Some(Box::new(move |message| {
                if let Some(transport) = weak.upgrade() {
                    transport.incoming(message);
                }
            })));
        }
        Ok(())
    }

    fn stop(&self) {
        debug!("Stopping DTLS transport");
        if let Some(lower) = self.core.lower() {
            lower.on_recv(None);
            lower.on_state_change(None);
        }
        self.endpoint.stop();
        self.core.take_lower();
        self.core.change_state(State::Disconnected);
    }

    fn send(&self, message: Message) -> bool {
        if self.core.state() != State::Connected {
            debug!("DTLS transport is not connected, dropping outgoing payload");
            return true;
        }
        if let Err(err) = self.endpoint.send(message.payload) {
            warn!("DTLS send failed: {err}");
            return false;
        }
        true
    }

    fn state(&self) -> State {
        self.core.state()
    }

    fn on_recv(&self, callback: Option<Callback<Message>>) {
        self.core.set_recv_callback(callback);
    }

    fn on_state_change(&self, callback: Option<Callback<State>>) {
        self.core.set_state_callback(callback);
    }
}

fn output_upcall(weak: Weak<DtlsTransport>) -> Callback<bytes::Bytes> {
    Box::new(move |datagram| {
        if let Some(transport) = weak.upgrade() {
            transport.core.send_down(Message::binary(datagram));
        }
    })
}

fn data_upcall(weak: Weak<DtlsTransport>) -> Callback<bytes::Bytes> {
    Box::new(move |payload| {
        if let Some(transport) = weak.upgrade() {
            transport.core.recv(Message::binary(payload));
        }
    })
}

fn connected_upcall(weak: Weak<DtlsTransport>) -> Callback<DtlsConnected> {
    Box::new(move |connected| {
        if let Some(transport) = weak.upgrade() {
            transport.handshake_complete(connected);
        }
    })
}

fn error_upcall(weak: Weak<DtlsTransport>) -> Callback<Error> {
    Box::new(move |err| {
        if let Some(transport) = weak.upgrade() {
            error!("DTLS transport error: {err}");
            transport.fail(err);
        }
    })
}
