use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{trace, warn};

use crate::backend::{Backend, SrtpKeyingMaterial, SrtpSession};
use crate::callback::{Callback, CallbackSlot};
use crate::message::Message;
use crate::transport::demux::is_rtcp;
use crate::transport::dtls::DtlsTransport;
use crate::transport::{State, Transport};

/// Media specialization of the DTLS transport.
///
/// Takes the RTP-class datagrams the DTLS demultiplexer sets aside, runs
/// them through the SRTP session keyed from the DTLS exporter, and offers
/// the mirror path for outbound media. SCTP keeps using the plain DTLS
/// transport underneath.
pub(crate) struct DtlsSrtpTransport {
    dtls: Arc<DtlsTransport>,
    backend: Arc<dyn Backend>,
    srtp: Mutex<Option<Box<dyn SrtpSession>>>,
    media_callback: CallbackSlot<Message>,
}

impl DtlsSrtpTransport {
    pub(crate) fn new(dtls: Arc<DtlsTransport>, backend: Arc<dyn Backend>) -> Arc<Self> {
        let transport = Arc::new(Self {
            dtls,
            backend,
            srtp: Mutex::new(None),
            media_callback: CallbackSlot::default(),
        });

        let weak = Arc::downgrade(&transport);
        transport.dtls.set_rtp_hook(Some(Box::new(move |message| {
            if let Some(transport) = weak.upgrade() {
                transport.incoming_media(message);
            }
        })));
        let weak = Arc::downgrade(&transport);
        transport
            .dtls
            .on_keying_material(Some(Box::new(move |keying_material| {
                if let Some(transport) = weak.upgrade() {
                    transport.init_srtp(keying_material);
                }
            })));

        transport
    }

    pub(crate) fn on_media(&self, callback: Option<Callback<Message>>) {
        self.media_callback.set(callback);
    }

    pub(crate) fn state(&self) -> State {
        self.dtls.state()
    }

    pub(crate) fn dtls(&self) -> &Arc<DtlsTransport> {
        &self.dtls
    }

    fn init_srtp(self: &Arc<Self>, keying_material: SrtpKeyingMaterial) {
        match self.backend.new_srtp_session(&keying_material) {
            Ok(session) => {
                trace!("SRTP session keyed from DTLS exporter output");
                *self.srtp.lock().unwrap() = Some(session);
            }
            Err(err) => warn!("SRTP session setup failed: {err}"),
        }
    }

    /// Protects and transmits one RTP or RTCP packet.
    pub(crate) fn send_media(&self, message: Message) -> bool {
        let protected = {
            let mut srtp = self.srtp.lock().unwrap();
            let Some(session) = srtp.as_mut() else {
                trace!("SRTP session not ready, dropping outgoing media");
                return false;
            };
            let result = if is_rtcp(&message.payload) {
                session.protect_rtcp(&message.payload)
            } else {
                session.protect_rtp(&message.payload)
            };
            match result {
                Ok(protected) => protected,
                Err(err) => {
                    warn!("SRTP protect failed: {err}");
                    return false;
                }
            }
        };
        self.dtls.send_down(Message {
            payload: protected,
            ..message
        })
    }

    fn incoming_media(&self, message: Message) {
        let unprotected: Bytes = {
            let mut srtp = self.srtp.lock().unwrap();
            let Some(session) = srtp.as_mut() else {
                trace!("SRTP session not ready, dropping incoming media");
                return;
            };
            let result = if is_rtcp(&message.payload) {
                session.unprotect_rtcp(&message.payload)
            } else {
                session.unprotect_rtp(&message.payload)
            };
            match result {
                Ok(unprotected) => unprotected,
                Err(err) => {
                    // Per-packet decryption errors do not tear the transport
                    // down.
                    warn!("SRTP unprotect failed: {err}");
                    return;
                }
            }
        };
        self.media_callback.call(Message {
            payload: unprotected,
            ..message
        });
    }
}

impl Drop for DtlsSrtpTransport {
    fn drop(&mut self) {
        self.dtls.set_rtp_hook(None);
        self.dtls.on_keying_material(None);
    }
}
