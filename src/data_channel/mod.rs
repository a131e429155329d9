use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::callback::{Callback, CallbackSlot, EventSlot};
use crate::data_channel::dcep::{DcepMessage, DcepOpen};
use crate::error::{Error, Result};
use crate::internal::RECV_QUEUE_LIMIT;
use crate::message::{message_size_func, Message, MessageType, Reliability};
use crate::queue::Queue;
use crate::transport::sctp::SctpTransport;
use crate::transport::Transport;

pub(crate) mod dcep;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum DataChannelState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

impl From<u8> for DataChannelState {
    fn from(v: u8) -> Self {
        match v {
            0 => DataChannelState::Connecting,
            1 => DataChannelState::Open,
            2 => DataChannelState::Closing,
            _ => DataChannelState::Closed,
        }
    }
}

/// Options for creating a data channel.
#[derive(Debug, Default, Clone)]
pub struct DataChannelInit {
    pub reliability: Reliability,
    pub protocol: String,
    /// The channel is negotiated out-of-band: no DCEP handshake runs and
    /// `stream` names the stream both sides agreed on.
    pub negotiated: bool,
    pub stream: Option<u16>,
}

pub(crate) struct DataChannelImpl {
    label: Mutex<String>,
    protocol: Mutex<String>,
    reliability: Mutex<Reliability>,
    negotiated: bool,
    /// Initiator side sends the DCEP OPEN.
    initiator: bool,
    stream: Mutex<Option<u16>>,
    state: AtomicU8,
    transport: Mutex<Option<Weak<SctpTransport>>>,
    recv_queue: Queue<Message>,
    pre_open_queue: Mutex<VecDeque<Message>>,
    buffered_amount: AtomicUsize,
    buffered_amount_low_threshold: AtomicUsize,
    open_event: EventSlot,
    available_event: EventSlot,
    message_callback: CallbackSlot<Message>,
    closed_callback: CallbackSlot<()>,
    error_callback: CallbackSlot<Error>,
    buffered_amount_low_callback: CallbackSlot<()>,
}

impl DataChannelImpl {
    pub(crate) fn new(label: String, init: DataChannelInit, initiator: bool) -> Arc<Self> {
        Arc::new(Self {
            label: Mutex::new(label),
            protocol: Mutex::new(init.protocol),
            reliability: Mutex::new(init.reliability),
            negotiated: init.negotiated,
            initiator,
            stream: Mutex::new(init.stream),
            state: AtomicU8::new(DataChannelState::Connecting as u8),
            transport: Mutex::new(None),
            recv_queue: Queue::with_amount_function(RECV_QUEUE_LIMIT, Box::new(message_size_func)),
            pre_open_queue: Mutex::new(VecDeque::new()),
            buffered_amount: AtomicUsize::new(0),
            buffered_amount_low_threshold: AtomicUsize::new(0),
            open_event: EventSlot::default(),
            available_event: EventSlot::default(),
            message_callback: CallbackSlot::default(),
            closed_callback: CallbackSlot::default(),
            error_callback: CallbackSlot::default(),
            buffered_amount_low_callback: CallbackSlot::default(),
        })
    }

    pub(crate) fn label(&self) -> String {
        self.label.lock().unwrap().clone()
    }

    pub(crate) fn protocol(&self) -> String {
        self.protocol.lock().unwrap().clone()
    }

    pub(crate) fn reliability(&self) -> Reliability {
        self.reliability.lock().unwrap().clone()
    }

    pub(crate) fn negotiated(&self) -> bool {
        self.negotiated
    }

    pub(crate) fn stream(&self) -> Option<u16> {
        *self.stream.lock().unwrap()
    }

    pub(crate) fn set_stream(&self, stream: u16) {
        *self.stream.lock().unwrap() = Some(stream);
    }

    pub(crate) fn state(&self) -> DataChannelState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: DataChannelState) -> DataChannelState {
        self.state.swap(state as u8, Ordering::SeqCst).into()
    }

    pub(crate) fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    pub(crate) fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffered_amount_low_threshold
            .store(threshold, Ordering::SeqCst);
    }

    /// Bytes reported transmitted by the transport; fires the
    /// low-watermark callback exactly once per downward crossing.
    pub(crate) fn reduce_buffered_amount(&self, amount: usize) {
        let previous = self
            .buffered_amount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                Some(value.saturating_sub(amount))
            })
            .unwrap_or_default();
        let new = previous.saturating_sub(amount);
        let threshold = self.buffered_amount_low_threshold.load(Ordering::SeqCst);
        if previous > threshold && new <= threshold {
            self.buffered_amount_low_callback.call(());
        }
    }

    /// Binds the channel to its transport. Initiators with an assigned
    /// stream send the DCEP OPEN; negotiated channels open right away.
    pub(crate) fn open(self: &Arc<Self>, transport: &Arc<SctpTransport>) -> Result<()> {
        *self.transport.lock().unwrap() = Some(Arc::downgrade(transport));

        if self.negotiated {
            self.mark_open();
            return Ok(());
        }
        if !self.initiator {
            return Ok(());
        }

        let stream = self.stream().ok_or(Error::ErrNotAvailable)?;
        let open = DcepOpen {
            reliability: self.reliability(),
            priority: 0,
            label: self.label(),
            protocol: self.protocol(),
        };
        debug!("Sending DCEP OPEN on stream {stream}");
        self.hand_to_transport(
            transport,
            Message {
                message_type: MessageType::Control,
                stream: Some(stream),
                payload: DcepMessage::Open(open).marshal(),
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Every byte handed to the transport counts into the buffered amount
    /// until the stack reports it transmitted.
    fn hand_to_transport(&self, transport: &Arc<SctpTransport>, message: Message) {
        self.buffered_amount
            .fetch_add(message.payload.len(), Ordering::SeqCst);
        transport.send(message);
    }

    /// Handles a DCEP control payload arriving on this channel's stream.
    pub(crate) fn process_control(&self, payload: &Bytes) {
        match DcepMessage::unmarshal(payload) {
            Ok(DcepMessage::Open(open)) => {
                if self.initiator {
                    warn!("Unexpected DCEP OPEN on locally initiated stream");
                    return;
                }
                *self.label.lock().unwrap() = open.label;
                *self.protocol.lock().unwrap() = open.protocol;
                *self.reliability.lock().unwrap() = open.reliability;
                let stream = self.stream().unwrap_or_default();
                debug!("Answering DCEP OPEN on stream {stream} with ACK");
                if let Some(transport) = self.transport() {
                    self.hand_to_transport(
                        &transport,
                        Message {
                            message_type: MessageType::Control,
                            stream: Some(stream),
                            payload: DcepMessage::Ack.marshal(),
                            ..Default::default()
                        },
                    );
                }
                self.mark_open();
            }
            Ok(DcepMessage::Ack) => {
                if self.state() == DataChannelState::Connecting {
                    trace!("DCEP ACK received");
                    self.mark_open();
                }
            }
            Err(err) => {
                warn!("Invalid DCEP message: {err}");
                self.error_callback.call(err);
            }
        }
    }

    fn transport(&self) -> Option<Arc<SctpTransport>> {
        self.transport.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn mark_open(&self) {
        // only a connecting channel can open; a closing one stays closing
        if self
            .state
            .compare_exchange(
                DataChannelState::Connecting as u8,
                DataChannelState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        self.flush_pre_open();
        self.open_event.trigger();
    }

    fn flush_pre_open(&self) {
        let pending: Vec<Message> = {
            let mut queue = self.pre_open_queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }
        trace!("Flushing {} buffered pre-open messages", pending.len());
        for message in pending {
            if let Err(err) = self.transport_send(message) {
                warn!("Pre-open flush failed: {err}");
                break;
            }
        }
    }

    /// Accepts data before the channel is open and buffers it; rejects it
    /// after close.
    pub(crate) fn send(&self, message_type: MessageType, payload: Bytes) -> Result<()> {
        let message = Message {
            message_type,
            stream: self.stream(),
            reliability: Some(Arc::new(self.reliability())),
            payload,
            ..Default::default()
        };
        match self.state() {
            DataChannelState::Closing | DataChannelState::Closed => Err(Error::ErrClosed),
            DataChannelState::Connecting => {
                self.pre_open_queue.lock().unwrap().push_back(message);
                Ok(())
            }
            DataChannelState::Open => self.transport_send(message),
        }
    }

    fn transport_send(&self, mut message: Message) -> Result<()> {
        let transport = self.transport().ok_or(Error::ErrNotOpen)?;
        if message.stream.is_none() {
            message.stream = self.stream();
        }
        self.hand_to_transport(&transport, message);
        Ok(())
    }

    /// A data message arriving on this channel's stream.
    pub(crate) fn incoming(&self, message: Message) {
        if self.state() == DataChannelState::Closed {
            return;
        }
        if self.message_callback.is_set() {
            self.message_callback.call(message);
        } else {
            self.recv_queue.push(message);
            self.available_event.trigger();
        }
    }

    /// Local close: queues a stream reset behind pending data and finishes.
    pub(crate) fn close(&self) {
        loop {
            let current = self.state();
            if current == DataChannelState::Closed || current == DataChannelState::Closing {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current as u8,
                    DataChannelState::Closing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }
        debug!("Closing data channel \"{}\"", self.label());
        if let (Some(transport), Some(stream)) = (self.transport(), self.stream()) {
            transport.close_stream(stream);
        }
        self.finish_close();
    }

    /// The peer reset the stream or the transport went away.
    pub(crate) fn remote_close(&self) {
        if self.state() == DataChannelState::Closed {
            return;
        }
        debug!("Data channel \"{}\" closed by remote", self.label());
        self.finish_close();
    }

    fn finish_close(&self) {
        if self.set_state(DataChannelState::Closed) == DataChannelState::Closed {
            return;
        }
        self.recv_queue.stop();
        self.transport.lock().unwrap().take();
        // onClosed is the last callback for the channel.
        self.closed_callback.call(());
        self.message_callback.set(None);
        self.open_event.set(None);
        self.available_event.set(None);
        self.error_callback.set(None);
        self.buffered_amount_low_callback.set(None);
        self.closed_callback.set(None);
    }

    pub(crate) fn fail(&self, err: Error) {
        self.error_callback.call(err);
        self.remote_close();
    }

    fn try_receive(&self) -> Option<Message> {
        self.recv_queue.try_pop()
    }
}

/// User endpoint on one SCTP stream.
///
/// Handles are cheap clones; the peer connection owns the underlying
/// channel and tears it down before reaching its own `Closed` state.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<DataChannelImpl>,
}

impl DataChannel {
    pub(crate) fn new(inner: Arc<DataChannelImpl>) -> Self {
        Self { inner }
    }

    pub fn label(&self) -> String {
        self.inner.label()
    }

    pub fn protocol(&self) -> String {
        self.inner.protocol()
    }

    pub fn reliability(&self) -> Reliability {
        self.inner.reliability()
    }

    pub fn negotiated(&self) -> bool {
        self.inner.negotiated()
    }

    /// The SCTP stream id, once negotiated.
    pub fn stream(&self) -> Option<u16> {
        self.inner.stream()
    }

    pub fn ready_state(&self) -> DataChannelState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() == DataChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state() == DataChannelState::Closed
    }

    /// Sends a binary message. Messages sent before the channel opens are
    /// buffered and flushed in order on open.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.inner
            .send(MessageType::Binary, Bytes::copy_from_slice(data))
    }

    /// Sends a UTF-8 string message.
    pub fn send_string(&self, data: impl Into<String>) -> Result<()> {
        self.inner
            .send(MessageType::String, Bytes::from(data.into()))
    }

    /// Polls one received message without blocking.
    pub fn receive(&self) -> Option<Message> {
        self.inner.try_receive()
    }

    /// Bytes handed to the transport but not yet acknowledged as
    /// transmitted.
    pub fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount()
    }

    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.inner
            .buffered_amount_low_threshold
            .load(Ordering::SeqCst)
    }

    /// Arms `on_buffered_amount_low`, fired each time the buffered amount
    /// crosses from above the threshold to at-or-below it. A threshold of
    /// zero fires when the outstanding amount reaches zero.
    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.inner.set_buffered_amount_low_threshold(threshold);
    }

    pub fn on_open(&self, callback: Option<Callback<()>>) {
        self.inner.open_event.set(callback);
    }

    /// A message became available for [`receive`](Self::receive) while no
    /// `on_message` callback was installed.
    pub fn on_available(&self, callback: Option<Callback<()>>) {
        self.inner.available_event.set(callback);
    }

    pub fn on_message(&self, callback: Option<Callback<Message>>) {
        self.inner.message_callback.set(callback);
        // deliver anything that queued up before the callback existed
        while let Some(message) = self.inner.try_receive() {
            self.inner.message_callback.call(message);
        }
    }

    pub fn on_closed(&self, callback: Option<Callback<()>>) {
        self.inner.closed_callback.set(callback);
    }

    pub fn on_error(&self, callback: Option<Callback<Error>>) {
        self.inner.error_callback.set(callback);
    }

    pub fn on_buffered_amount_low(&self, callback: Option<Callback<()>>) {
        self.inner.buffered_amount_low_callback.set(callback);
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pre_open_sends_are_buffered_and_closed_rejects() {
        let inner = DataChannelImpl::new("test".to_string(), DataChannelInit::default(), true);
        let channel = DataChannel::new(Arc::clone(&inner));

        assert_eq!(channel.ready_state(), DataChannelState::Connecting);
        channel.send(b"early").unwrap();
        assert_eq!(inner.pre_open_queue.lock().unwrap().len(), 1);

        inner.remote_close();
        assert!(channel.is_closed());
        assert_eq!(channel.send(b"late"), Err(Error::ErrClosed));
    }

    #[test]
    fn test_buffered_amount_low_crossing_fires_once() {
        use std::sync::atomic::AtomicUsize;

        let inner = DataChannelImpl::new("test".to_string(), DataChannelInit::default(), true);
        let channel = DataChannel::new(Arc::clone(&inner));
        channel.set_buffered_amount_low_threshold(10);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        channel.on_buffered_amount_low(Some(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })));

        inner.buffered_amount.store(50, Ordering::SeqCst);
        inner.reduce_buffered_amount(40); // 50 -> 10, crossing
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        inner.reduce_buffered_amount(5); // still below, no new crossing
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        inner.buffered_amount.store(40, Ordering::SeqCst); // back above
        inner.reduce_buffered_amount(40); // crossing again
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(channel.buffered_amount(), 0);
    }

    #[test]
    fn test_zero_threshold_fires_at_zero() {
        use std::sync::atomic::AtomicUsize;

        let inner = DataChannelImpl::new("test".to_string(), DataChannelInit::default(), true);
        let channel = DataChannel::new(Arc::clone(&inner));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        channel.on_buffered_amount_low(Some(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })));

        inner.buffered_amount.store(100, Ordering::SeqCst);
        inner.reduce_buffered_amount(50);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        inner.reduce_buffered_amount(50);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_message_queue_and_replay() {
        let inner = DataChannelImpl::new("test".to_string(), DataChannelInit::default(), false);
        let channel = DataChannel::new(Arc::clone(&inner));

        inner.incoming(Message::string(Bytes::from_static(b"queued")));
        assert_eq!(channel.receive().unwrap().payload, &b"queued"[..]);

        inner.incoming(Message::string(Bytes::from_static(b"replayed")));
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        channel.on_message(Some(Box::new(move |message| {
            r.lock().unwrap().push(message.payload.clone());
        })));
        assert_eq!(received.lock().unwrap().len(), 1);

        inner.incoming(Message::string(Bytes::from_static(b"direct")));
        assert_eq!(received.lock().unwrap().len(), 2);
    }
}
