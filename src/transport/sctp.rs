use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::backend::{
    SctpAssociation, SctpHandler, SctpIncomingMessage, SctpNotification, SctpSendOptions,
};
use crate::callback::{Callback, CallbackSlot};
use crate::error::{Error, Result};
use crate::internal::{DEFAULT_SCTP_PORT, MAX_SCTP_STREAMS_COUNT, SEND_QUEUE_LIMIT};
use crate::message::{message_size_func, Message, MessageType};
use crate::queue::Queue;
use crate::transport::{State, Transport, TransportCore};

// Order seems wrong but these are the actual values
// See https://datatracker.ietf.org/doc/html/draft-ietf-rtcweb-data-channel-13#section-8
pub(crate) const PPID_CONTROL: u32 = 50;
pub(crate) const PPID_STRING: u32 = 51;
pub(crate) const PPID_BINARY_PARTIAL: u32 = 52;
pub(crate) const PPID_BINARY: u32 = 53;
pub(crate) const PPID_STRING_PARTIAL: u32 = 54;
pub(crate) const PPID_STRING_EMPTY: u32 = 56;
pub(crate) const PPID_BINARY_EMPTY: u32 = 57;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Ports {
    pub(crate) local: u16,
    pub(crate) remote: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            local: DEFAULT_SCTP_PORT,
            remote: DEFAULT_SCTP_PORT,
        }
    }
}

struct Reassembly {
    string_data: BytesMut,
    binary_data: BytesMut,
}

/// SCTP association over the DTLS transport.
///
/// Owns the bounded outbound queue and its write pump, applies per-stream
/// reliability at send time, accounts buffered bytes per stream, and
/// reassembles partial payloads on the receive path.
pub(crate) struct SctpTransport {
    core: TransportCore,
    association: Box<dyn SctpAssociation>,
    ports: Ports,
    is_client: bool,
    remote_max_message_size: usize,
    send_queue: Arc<Queue<Message>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    writable: Arc<(Mutex<bool>, Condvar)>,
    buffered_amount: Mutex<HashMap<u16, usize>>,
    amount_callback: CallbackSlot<(u16, usize)>,
    reassembly: Mutex<Reassembly>,
    bytes_sent: AtomicUsize,
    bytes_received: AtomicUsize,
}

impl SctpTransport {
    pub(crate) fn new(
        lower: Arc<dyn Transport>,
        association: Box<dyn SctpAssociation>,
        ports: Ports,
        is_client: bool,
        remote_max_message_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: TransportCore::new(Some(lower)),
            association,
            ports,
            is_client,
            remote_max_message_size,
            send_queue: Arc::new(Queue::with_amount_function(
                SEND_QUEUE_LIMIT,
                Box::new(message_size_func),
            )),
            pump: Mutex::new(None),
            writable: Arc::new((Mutex::new(true), Condvar::new())),
            buffered_amount: Mutex::new(HashMap::new()),
            amount_callback: CallbackSlot::default(),
            reassembly: Mutex::new(Reassembly {
                string_data: BytesMut::new(),
                binary_data: BytesMut::new(),
            }),
            bytes_sent: AtomicUsize::new(0),
            bytes_received: AtomicUsize::new(0),
        })
    }

    /// Callback receiving `(stream, bytes)` whenever the stack reports
    /// previously accepted bytes as transmitted or abandoned. Deltas
    /// commute, so delivery order across threads cannot corrupt the
    /// per-channel mirror.
    pub(crate) fn on_bytes_transmitted(&self, callback: Option<Callback<(u16, usize)>>) {
        self.amount_callback.set(callback);
    }

    pub(crate) fn max_streams(&self) -> u16 {
        MAX_SCTP_STREAMS_COUNT
    }

    pub(crate) fn is_client(&self) -> bool {
        self.is_client
    }

    pub(crate) fn buffered_amount(&self, stream: u16) -> usize {
        *self.buffered_amount.lock().unwrap().get(&stream).unwrap_or(&0)
    }

    pub(crate) fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn rtt(&self) -> Option<Duration> {
        self.association.rtt()
    }

    /// Enqueues a stream reset behind any pending data for the stream.
    pub(crate) fn close_stream(&self, stream: u16) {
        self.send_queue.push(Message::reset(stream));
        self.signal_writable();
    }

    fn update_buffered_amount(&self, stream: u16, delta: isize) {
        let mut buffered = self.buffered_amount.lock().unwrap();
        let entry = buffered.entry(stream).or_insert(0);
        *entry = entry.saturating_add_signed(delta);
        if *entry == 0 {
            buffered.remove(&stream);
        }
    }

    fn signal_writable(&self) {
        let (lock, condvar) = &*self.writable;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
    }

    fn wait_writable(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.writable;
        let mut writable = lock.lock().unwrap();
        if !*writable {
            let (guard, _result) = condvar.wait_timeout(writable, timeout).unwrap();
            writable = guard;
        }
        std::mem::replace(&mut *writable, false)
    }

    /// Write pump: pops the queue, splits messages by the peer's advertised
    /// maximum message size and hands the records to the association.
    fn pump_loop(self: Arc<Self>) {
        while let Some(message) = self.send_queue.pop() {
            if message.message_type == MessageType::Reset {
                if let Some(stream) = message.stream {
                    trace!("Resetting stream {stream}");
                    if let Err(err) = self.association.reset_stream(stream) {
                        warn!("Stream reset failed: {err}");
                    }
                }
                continue;
            }
            if let Err(err) = self.transmit_message(message) {
                if err == Error::ErrClosed {
                    break;
                }
                warn!("SCTP transmit failed: {err}");
            }
        }
        trace!("SCTP write pump finished");
    }

    fn transmit_message(&self, message: Message) -> Result<()> {
        let stream = message.stream.unwrap_or(0);
        let reliability = message.reliability.clone().unwrap_or_default();
        let total = message.payload.len();

        let (final_ppid, partial_ppid, empty_ppid) = match message.message_type {
            MessageType::String => (PPID_STRING, PPID_STRING_PARTIAL, PPID_STRING_EMPTY),
            MessageType::Control => (PPID_CONTROL, PPID_CONTROL, PPID_CONTROL),
            _ => (PPID_BINARY, PPID_BINARY_PARTIAL, PPID_BINARY_EMPTY),
        };

        let mut options = SctpSendOptions {
            stream,
            ppid: final_ppid,
            unordered: reliability.unordered,
            max_retransmits: reliability.max_retransmits,
            max_packet_life_time: reliability.max_packet_life_time,
        };
        // Control messages stay ordered and reliable regardless of the
        // stream policy.
        if message.message_type == MessageType::Control {
            options.unordered = false;
            options.max_retransmits = None;
            options.max_packet_life_time = None;
        }

        if total == 0 {
            options.ppid = empty_ppid;
            return self.blocking_send(&options, Bytes::new());
        }

        let limit = if self.remote_max_message_size == 0 {
            usize::MAX
        } else {
            self.remote_max_message_size
        };
        let mut offset = 0;
        while offset < total {
            let end = usize::min(offset + limit, total);
            options.ppid = if end < total { partial_ppid } else { final_ppid };
            self.blocking_send(&options, message.payload.slice(offset..end))?;
            offset = end;
        }
        Ok(())
    }

    /// Retries a would-block send until the association takes the record or
    /// the transport stops.
    fn blocking_send(&self, options: &SctpSendOptions, data: Bytes) -> Result<()> {
        let len = data.len();
        loop {
            match self.association.send(options, data.clone()) {
                Ok(()) => {
                    self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                    return Ok(());
                }
                Err(Error::ErrBufferFull) => {
                    if !self.send_queue.running() {
                        return Err(Error::ErrClosed);
                    }
                    self.wait_writable(Duration::from_millis(100));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn incoming(self: &Arc<Self>, message: Message) {
        if let Err(err) = self.association.handle_input(message.payload) {
            warn!("SCTP input processing failed: {err}");
        }
    }

    fn process_message(&self, incoming: SctpIncomingMessage) {
        self.bytes_received
            .fetch_add(incoming.data.len(), Ordering::Relaxed);

        let mut reassembly = self.reassembly.lock().unwrap();
        let message = match incoming.ppid {
            PPID_CONTROL => Message {
                message_type: MessageType::Control,
                stream: Some(incoming.stream),
                payload: incoming.data,
                ..Default::default()
            },
            PPID_STRING_PARTIAL => {
                reassembly.string_data.extend_from_slice(&incoming.data);
                return;
            }
            PPID_STRING => {
                let payload = if reassembly.string_data.is_empty() {
                    incoming.data
                } else {
                    reassembly.string_data.extend_from_slice(&incoming.data);
                    reassembly.string_data.split().freeze()
                };
                Message {
                    message_type: MessageType::String,
                    stream: Some(incoming.stream),
                    payload,
                    ..Default::default()
                }
            }
            PPID_STRING_EMPTY => Message {
                message_type: MessageType::String,
                stream: Some(incoming.stream),
                payload: Bytes::new(),
                ..Default::default()
            },
            PPID_BINARY_PARTIAL => {
                reassembly.binary_data.extend_from_slice(&incoming.data);
                return;
            }
            PPID_BINARY => {
                let payload = if reassembly.binary_data.is_empty() {
                    incoming.data
                } else {
                    reassembly.binary_data.extend_from_slice(&incoming.data);
                    reassembly.binary_data.split().freeze()
                };
                Message {
                    message_type: MessageType::Binary,
                    stream: Some(incoming.stream),
                    payload,
                    ..Default::default()
                }
            }
            PPID_BINARY_EMPTY => Message {
                message_type: MessageType::Binary,
                stream: Some(incoming.stream),
                payload: Bytes::new(),
                ..Default::default()
            },
            other => {
                warn!("Unknown PPID {other} on stream {}", incoming.stream);
                return;
            }
        };
        drop(reassembly);
        self.core.recv(message);
    }

    fn process_notification(&self, notification: SctpNotification) {
        match notification {
            SctpNotification::Connected => {
                debug!("SCTP association established");
                self.core.change_state(State::Connected);
            }
            SctpNotification::Disconnected => {
                debug!("SCTP association ended");
                self.discard_queued();
                self.core.change_state(State::Disconnected);
            }
            SctpNotification::Failed(cause) => {
                warn!("SCTP association failed: {cause}");
                self.discard_queued();
                self.core.change_state(State::Failed);
            }
            SctpNotification::WriteSpace { stream, amount } => {
                self.update_buffered_amount(stream, -(amount as isize));
                self.amount_callback.call((stream, amount));
                self.signal_writable();
            }
            SctpNotification::StreamReset { stream } => {
                trace!("Peer reset stream {stream}");
                self.core.recv(Message::reset(stream));
            }
        }
    }

    fn discard_queued(&self) {
        while let Some(message) = self.send_queue.try_pop() {
            if let Some(stream) = message.stream {
                self.update_buffered_amount(stream, -(message.payload.len() as isize));
            }
        }
    }

    fn lower_state_changed(self: &Arc<Self>, state: State) {
        match state {
            State::Failed => {
                self.discard_queued();
                self.core.change_state(State::Failed);
            }
            // The SCTP layer survives a DTLS disconnect: queued messages are
            // discarded and the association winds down.
            State::Disconnected => {
                self.discard_queued();
                self.core.change_state(State::Disconnected);
            }
            _ => {}
        }
    }

    /// Graceful shutdown with a bounded wait, then abort.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        if self.core.state() != State::Connected {
            return;
        }
        debug!("Shutting down SCTP association");
        if self.association.shutdown().is_err() {
            return;
        }
        let deadline = Instant::now() + timeout;
        while self.core.state() == State::Connected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.core.state() == State::Connected {
            warn!("SCTP shutdown timed out, aborting association");
            self.association.abort();
            self.core.change_state(State::Disconnected);
        }
    }
}

impl Transport for SctpTransport {
    fn start(self: Arc<Self>) -> Result<()> {
        debug!(
            "Starting SCTP transport, local port {}, remote port {}",
            self.ports.local, self.ports.remote
        );
        self.core.change_state(State::Connecting);

        if let Some(lower) = self.core.lower() {
            let weak = Arc::downgrade(&self);
            lower.on_state_change(Some(Box::new(move |state| {
                if let Some(transport) = weak.upgrade() {
                    transport.lower_state_changed(state);
                }
            })));
        }

        let weak = Arc::downgrade(&self);
        let handler = SctpHandler {
            on_output: output_upcall(weak.clone()),
            on_message: message_upcall(weak.clone()),
            on_notification: notification_upcall(weak),
        };
        self.association
            .start(handler, self.ports.local, self.ports.remote, self.is_client)?;

        let pump_self = Arc::clone(&self);
        let handle = thread::Builder::new()
            .name("rtcdc-sctp-pump".to_string())
            .spawn(move || pump_self.pump_loop())
            .map_err(|e| Error::Other(format!("failed to spawn write pump: {e}")))?;
        *self.pump.lock().unwrap() = Some(handle);

        // register last: packets buffered below flush into a live
        // association
        if let Some(lower) = self.core.lower() {
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
        debug!("Stopping SCTP transport");
        self.send_queue.stop();
        self.signal_writable();
        if let Some(handle) = self.pump.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(lower) = self.core.lower() {
            lower.on_recv(None);
            lower.on_state_change(None);
        }
        self.core.take_lower();
        self.core.change_state(State::Disconnected);
    }

    /// Enqueues the message for the write pump; blocks briefly when the
    /// outbound queue is at its limit. Returns false when the message was
    /// buffered behind others.
    fn send(&self, message: Message) -> bool {
        if let Some(stream) = message.stream {
            self.update_buffered_amount(stream, message.payload.len() as isize);
        }
        let immediate = self.send_queue.is_empty() && self.core.state() == State::Connected;
        self.send_queue.push(message);
        immediate
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

fn output_upcall(weak: Weak<SctpTransport>) -> Callback<Bytes> {
    Box::new(move |packet| {
        if let Some(transport) = weak.upgrade() {
            transport.core.send_down(Message::binary(packet));
        }
    })
}

fn message_upcall(weak: Weak<SctpTransport>) -> Callback<SctpIncomingMessage> {
    Box::new(move |incoming| {
        if let Some(transport) = weak.upgrade() {
            transport.process_message(incoming);
        }
    })
}

fn notification_upcall(weak: Weak<SctpTransport>) -> Callback<SctpNotification> {
    Box::new(move |notification| {
        if let Some(transport) = weak.upgrade() {
            transport.process_notification(notification);
        }
    })
}
