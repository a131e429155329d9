use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, trace};

use crate::callback::{Callback, CallbackSlot, EventSlot};
use crate::error::{Error, Result};
use crate::internal::RECV_QUEUE_LIMIT;
use crate::media::{chain_incoming, chain_outgoing, MediaHandler};
use crate::message::{message_size_func, FrameInfo, Message, MessageType};
use crate::queue::Queue;
use crate::sdp::{Direction, MediaSection};
use crate::transport::dtls_srtp::DtlsSrtpTransport;

pub(crate) struct TrackImpl {
    mid: String,
    description: Mutex<MediaSection>,
    handlers: Mutex<Vec<Box<dyn MediaHandler>>>,
    transport: Mutex<Option<Weak<DtlsSrtpTransport>>>,
    closed: AtomicBool,
    recv_queue: Queue<Message>,
    open_event: EventSlot,
    available_event: EventSlot,
    message_callback: CallbackSlot<Message>,
    closed_callback: CallbackSlot<()>,
}

impl TrackImpl {
    pub(crate) fn new(description: MediaSection) -> Arc<Self> {
        Arc::new(Self {
            mid: description.mid.clone(),
            description: Mutex::new(description),
            handlers: Mutex::new(Vec::new()),
            transport: Mutex::new(None),
            closed: AtomicBool::new(false),
            recv_queue: Queue::with_amount_function(RECV_QUEUE_LIMIT, Box::new(message_size_func)),
            open_event: EventSlot::default(),
            available_event: EventSlot::default(),
            message_callback: CallbackSlot::default(),
            closed_callback: CallbackSlot::default(),
        })
    }

    pub(crate) fn mid(&self) -> &str {
        &self.mid
    }

    pub(crate) fn description(&self) -> MediaSection {
        self.description.lock().unwrap().clone()
    }

    pub(crate) fn set_description(&self, description: MediaSection) {
        *self.description.lock().unwrap() = description;
    }

    pub(crate) fn direction(&self) -> Direction {
        self.description.lock().unwrap().direction
    }

    /// SSRCs this track sends or receives, for inbound routing.
    pub(crate) fn ssrcs(&self) -> Vec<u32> {
        self.description
            .lock()
            .unwrap()
            .ssrcs
            .iter()
            .map(|s| s.ssrc)
            .collect()
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport().is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Binds the track to the connected media transport.
    pub(crate) fn open(&self, transport: &Arc<DtlsSrtpTransport>) {
        debug!("Opening track {}", self.mid);
        *self.transport.lock().unwrap() = Some(Arc::downgrade(transport));
        self.open_event.trigger();
    }

    fn transport(&self) -> Option<Arc<DtlsSrtpTransport>> {
        self.transport.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn transport_send(&self, message: Message) -> bool {
        match self.transport() {
            Some(transport) => transport.send_media(message),
            None => {
                trace!("Track {} is not open, dropping outgoing media", self.mid);
                false
            }
        }
    }

    /// Runs one outbound sample through the handler chain and transmits the
    /// resulting packets.
    pub(crate) fn outgoing(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrClosed);
        }
        let mut messages = vec![message];
        {
            let mut handlers = self.handlers.lock().unwrap();
            let transport = self.transport();
            let mut send = |m: Message| {
                if let Some(transport) = &transport {
                    transport.send_media(m);
                }
            };
            chain_outgoing(&mut handlers, &mut messages, &mut send);
        }
        for message in messages {
            self.transport_send(message);
        }
        Ok(())
    }

    /// Runs inbound media through the handler chain tail-to-head; replies
    /// (e.g. NACK retransmissions) go straight back out.
    pub(crate) fn incoming(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        let mut messages = vec![message];
        {
            let mut handlers = self.handlers.lock().unwrap();
            let transport = self.transport();
            let mut send = |m: Message| {
                if let Some(transport) = &transport {
                    transport.send_media(m);
                }
            };
            chain_incoming(&mut handlers, &mut messages, &mut send);
        }
        for message in messages {
            if self.message_callback.is_set() {
                self.message_callback.call(message);
            } else {
                self.recv_queue.push(message);
                self.available_event.trigger();
            }
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing track {}", self.mid);
        self.recv_queue.stop();
        self.transport.lock().unwrap().take();
        self.closed_callback.call(());
        self.message_callback.set(None);
        self.open_event.set(None);
        self.available_event.set(None);
        self.closed_callback.set(None);
    }
}

/// User endpoint on one media m-line.
///
/// Owns the media-handler chain; samples pushed with [`send`](Self::send)
/// run through it head to tail and leave as SRTP-protected RTP packets.
#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackImpl>,
}

impl Track {
    pub(crate) fn new(inner: Arc<TrackImpl>) -> Self {
        Self { inner }
    }

    pub fn mid(&self) -> String {
        self.inner.mid().to_string()
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction()
    }

    pub fn description(&self) -> MediaSection {
        self.inner.description()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Appends a handler to the chain.
    pub fn add_media_handler(&self, handler: Box<dyn MediaHandler>) {
        self.inner.handlers.lock().unwrap().push(handler);
    }

    /// Sends one codec sample through the handler chain.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.inner
            .outgoing(Message::binary(Bytes::copy_from_slice(data)))
    }

    /// Sends one codec sample with explicit frame metadata.
    pub fn send_frame(&self, data: &[u8], frame_info: FrameInfo) -> Result<()> {
        self.inner.outgoing(Message {
            message_type: MessageType::Binary,
            frame_info: Some(Arc::new(frame_info)),
            payload: Bytes::copy_from_slice(data),
            ..Default::default()
        })
    }

    /// Polls one received message without blocking.
    pub fn receive(&self) -> Option<Message> {
        self.inner.recv_queue.try_pop()
    }

    pub fn on_open(&self, callback: Option<Callback<()>>) {
        self.inner.open_event.set(callback);
    }

    pub fn on_available(&self, callback: Option<Callback<()>>) {
        self.inner.available_event.set(callback);
    }

    pub fn on_message(&self, callback: Option<Callback<Message>>) {
        self.inner.message_callback.set(callback);
        while let Some(message) = self.inner.recv_queue.try_pop() {
            self.inner.message_callback.call(message);
        }
    }

    pub fn on_closed(&self, callback: Option<Callback<()>>) {
        self.inner.closed_callback.set(callback);
    }

    pub fn close(&self) {
        self.inner.close();
    }
}
