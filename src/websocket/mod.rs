//! WebSocket client and server, RFC 6455, used for out-of-band signaling.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace, warn};

use crate::callback::{Callback, CallbackSlot, EventSlot};
use crate::error::{Error, Result};
use crate::internal::DEFAULT_WS_MAX_MESSAGE_SIZE;
use crate::message::{message_size_func, Message, MessageType};
use crate::queue::Queue;
use crate::utils::url_decode;
use crate::websocket::frame::{parse_frame, write_frame, Frame, Opcode};

pub(crate) mod frame;
pub(crate) mod handshake;
pub mod server;

pub use server::{WebSocketServer, WebSocketServerConfiguration};

const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone)]
pub struct WebSocketConfiguration {
    /// Sub-protocols offered in the handshake.
    pub protocols: Vec<String>,
    /// Upper bound for one message; larger outbound sends are rejected and
    /// larger inbound messages fail the connection. 0 means the default.
    pub max_message_size: usize,
    /// Skip TLS certificate verification (wss only).
    #[cfg(feature = "tls")]
    pub disable_tls_verification: bool,
}

impl WebSocketConfiguration {
    fn effective_max_message_size(&self) -> usize {
        if self.max_message_size == 0 {
            DEFAULT_WS_MAX_MESSAGE_SIZE
        } else {
            self.max_message_size
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum WebSocketState {
    #[default]
    Closed,
    Connecting,
    Open,
    Closing,
}

impl From<u8> for WebSocketState {
    fn from(v: u8) -> Self {
        match v {
            1 => WebSocketState::Connecting,
            2 => WebSocketState::Open,
            3 => WebSocketState::Closing,
            _ => WebSocketState::Closed,
        }
    }
}

pub(crate) enum WsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    TlsClient(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    #[cfg(feature = "tls")]
    TlsServer(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl WsStream {
    fn socket(&self) -> &TcpStream {
        match self {
            WsStream::Plain(stream) => stream,
            #[cfg(feature = "tls")]
            WsStream::TlsClient(stream) => &stream.sock,
            #[cfg(feature = "tls")]
            WsStream::TlsServer(stream) => &stream.sock,
        }
    }
}

impl Read for WsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            WsStream::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsClient(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsServer(stream) => stream.read(buf),
        }
    }
}

impl Write for WsStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            WsStream::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsClient(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsServer(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WsStream::Plain(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            WsStream::TlsClient(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            WsStream::TlsServer(stream) => stream.flush(),
        }
    }
}

pub(crate) struct WebSocketImpl {
    config: WebSocketConfiguration,
    /// Clients mask outbound frames, servers do not.
    is_client: bool,
    state: AtomicU8,
    stream: Mutex<Option<WsStream>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    protocol: Mutex<Option<String>>,
    path: Mutex<Option<String>>,
    recv_queue: Queue<Message>,
    open_event: EventSlot,
    available_event: EventSlot,
    message_callback: CallbackSlot<Message>,
    closed_callback: CallbackSlot<()>,
    error_callback: CallbackSlot<Error>,
}

impl WebSocketImpl {
    fn new(config: WebSocketConfiguration, is_client: bool) -> Arc<Self> {
        let max = config.effective_max_message_size();
        Arc::new(Self {
            config,
            is_client,
            state: AtomicU8::new(WebSocketState::Closed as u8),
            stream: Mutex::new(None),
            reader: Mutex::new(None),
            protocol: Mutex::new(None),
            path: Mutex::new(None),
            recv_queue: Queue::with_amount_function(4 * max, Box::new(message_size_func)),
            open_event: EventSlot::default(),
            available_event: EventSlot::default(),
            message_callback: CallbackSlot::default(),
            closed_callback: CallbackSlot::default(),
            error_callback: CallbackSlot::default(),
        })
    }

    fn state(&self) -> WebSocketState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: WebSocketState) -> WebSocketState {
        self.state.swap(state as u8, Ordering::SeqCst).into()
    }

    fn write(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock().unwrap();
        let stream = guard.as_mut().ok_or(Error::ErrNotOpen)?;
        write_frame(stream, opcode, payload, true, self.is_client)
    }

    pub(crate) fn send_message(&self, message_type: MessageType, payload: &[u8]) -> Result<()> {
        if self.state() != WebSocketState::Open {
            return Err(Error::ErrClosed);
        }
        let limit = self.config.effective_max_message_size();
        if payload.len() > limit {
            return Err(Error::ErrMessageTooLarge {
                size: payload.len(),
                limit,
            });
        }
        let opcode = if message_type == MessageType::String {
            Opcode::Text
        } else {
            Opcode::Binary
        };
        self.write(opcode, payload)
    }

    fn deliver(&self, message: Message) {
        if self.message_callback.is_set() {
            self.message_callback.call(message);
        } else {
            self.recv_queue.push(message);
            self.available_event.trigger();
        }
    }

    /// Marks the connection open and starts the reader.
    fn attach(self: &Arc<Self>, stream: WsStream, protocol: Option<String>, path: Option<String>) {
        let _ = stream
            .socket()
            .set_read_timeout(Some(READ_POLL_INTERVAL));
        *self.protocol.lock().unwrap() = protocol;
        *self.path.lock().unwrap() = path;
        *self.stream.lock().unwrap() = Some(stream);
        self.set_state(WebSocketState::Open);
        self.open_event.trigger();

        let ws = Arc::downgrade(self);
        let reader = thread::Builder::new()
            .name("rtcdc-ws-reader".to_string())
            .spawn(move || reader_loop(ws))
            .ok();
        *self.reader.lock().unwrap() = reader;
    }

    pub(crate) fn close(&self) {
        match self.state() {
            WebSocketState::Open | WebSocketState::Connecting => {
                debug!("Closing WebSocket");
                self.set_state(WebSocketState::Closing);
                if self.write(Opcode::Close, &[]).is_err() {
                    self.finish();
                }
            }
            _ => {}
        }
    }

    fn finish(&self) {
        if self.set_state(WebSocketState::Closed) == WebSocketState::Closed {
            return;
        }
        self.recv_queue.stop();
        if let Some(stream) = self.stream.lock().unwrap().take() {
            let _ = stream.socket().shutdown(std::net::Shutdown::Both);
        }
        self.closed_callback.call(());
    }

    fn fail(&self, err: Error) {
        warn!("WebSocket failed: {err}");
        self.error_callback.call(err);
        self.finish();
    }
}

/// One `read()` per lock hold, so writers interleave; complete frames are
/// parsed out of the local accumulator.
fn reader_loop(ws: Weak<WebSocketImpl>) {
    let mut accumulator = BytesMut::new();
    let mut fragments: Option<(Opcode, BytesMut)> = None;

    loop {
        let Some(socket) = ws.upgrade() else { return };
        if socket.state() == WebSocketState::Closed {
            return;
        }
        let max = socket.config.effective_max_message_size();

        // drain complete frames
        loop {
            match parse_frame(&mut accumulator, max + 14) {
                Ok(Some(frame)) => {
                    if !handle_frame(&socket, frame, &mut fragments, max) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    socket.fail(err);
                    return;
                }
            }
        }

        // refill from the stream
        let mut scratch = [0u8; 4096];
        let read = {
            let mut guard = socket.stream.lock().unwrap();
            match guard.as_mut() {
                Some(stream) => stream.read(&mut scratch),
                None => return,
            }
        };
        drop(socket);
        match read {
            Ok(0) => {
                if let Some(socket) = ws.upgrade() {
                    trace!("WebSocket connection closed by remote");
                    socket.finish();
                }
                return;
            }
            Ok(n) => accumulator.extend_from_slice(&scratch[..n]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                if let Some(socket) = ws.upgrade() {
                    if socket.state() == WebSocketState::Closing {
                        socket.finish();
                    } else {
                        socket.fail(err.into());
                    }
                }
                return;
            }
        }
    }
}

/// Returns false when the reader should stop.
fn handle_frame(
    socket: &Arc<WebSocketImpl>,
    frame: Frame,
    fragments: &mut Option<(Opcode, BytesMut)>,
    max: usize,
) -> bool {
    match frame.opcode {
        Opcode::Ping => {
            trace!("Answering WebSocket ping");
            let _ = socket.write(Opcode::Pong, &frame.payload);
            true
        }
        Opcode::Pong => true,
        Opcode::Close => {
            if socket.state() != WebSocketState::Closing {
                let _ = socket.write(Opcode::Close, &frame.payload);
            }
            socket.finish();
            false
        }
        Opcode::Text | Opcode::Binary => {
            if frame.fin {
                let message_type = if frame.opcode == Opcode::Text {
                    MessageType::String
                } else {
                    MessageType::Binary
                };
                socket.deliver(Message {
                    message_type,
                    payload: frame.payload,
                    ..Default::default()
                });
            } else {
                *fragments = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
            }
            true
        }
        Opcode::Continuation => {
            let Some((opcode, mut data)) = fragments.take() else {
                socket.fail(Error::ErrProtocol("continuation without start".to_string()));
                return false;
            };
            if data.len() + frame.payload.len() > max {
                socket.fail(Error::ErrMessageTooLarge {
                    size: data.len() + frame.payload.len(),
                    limit: max,
                });
                return false;
            }
            data.extend_from_slice(&frame.payload);
            if frame.fin {
                let message_type = if opcode == Opcode::Text {
                    MessageType::String
                } else {
                    MessageType::Binary
                };
                socket.deliver(Message {
                    message_type,
                    payload: data.freeze(),
                    ..Default::default()
                });
            } else {
                *fragments = Some((opcode, data));
            }
            true
        }
    }
}

/// WebSocket endpoint, client or server side.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<WebSocketImpl>,
}

impl WebSocket {
    /// Creates a closed client socket; call [`open`](Self::open) to
    /// connect.
    pub fn new(config: Option<WebSocketConfiguration>) -> Self {
        Self {
            inner: WebSocketImpl::new(config.unwrap_or_default(), true),
        }
    }

    pub(crate) fn from_impl(inner: Arc<WebSocketImpl>) -> Self {
        Self { inner }
    }

    /// Connects to a `ws://` or `wss://` URL and performs the opening
    /// handshake.
    pub fn open(&self, url: &str) -> Result<()> {
        if self.inner.state() != WebSocketState::Closed {
            return Err(Error::ErrInvalidArgument(
                "WebSocket must be closed before opening".to_string(),
            ));
        }
        debug!("Opening WebSocket to {url}");
        self.inner.set_state(WebSocketState::Connecting);

        let result = self.connect(url);
        if let Err(err) = &result {
            self.inner.set_state(WebSocketState::Closed);
            self.inner.error_callback.call(err.clone());
        }
        result
    }

    fn connect(&self, url: &str) -> Result<()> {
        let location = parse_url(url)?;

        let address = (location.hostname.as_str(), location.port);
        let mut addrs = address
            .to_socket_addrs()
            .map_err(|e| Error::ErrInvalidArgument(format!("cannot resolve {url}: {e}")))?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::ErrInvalidArgument(format!("no address for {url}")))?;
        let tcp = TcpStream::connect(addr)?;
        tcp.set_nodelay(true).ok();

        let mut stream = if location.is_secure {
            self.wrap_tls(tcp, &location.hostname)?
        } else {
            WsStream::Plain(tcp)
        };

        let protocol = handshake::client_handshake(
            &mut stream,
            &location.host,
            &location.path,
            &self.inner.config.protocols,
        )?;
        debug!(
            "WebSocket open, negotiated protocol: {}",
            protocol.as_deref().unwrap_or("none")
        );
        self.inner
            .attach(stream, protocol, Some(location.path.clone()));
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn wrap_tls(&self, tcp: TcpStream, hostname: &str) -> Result<WsStream> {
        use rustls::pki_types::ServerName;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        if self.inner.config.disable_tls_verification {
            warn!("TLS certificate verification is disabled");
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(tls::NoVerification::new()));
        }
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| Error::ErrInvalidArgument(format!("invalid SNI hostname: {hostname}")))?;
        let connection = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| Error::Other(format!("TLS setup failed: {e}")))?;
        Ok(WsStream::TlsClient(Box::new(rustls::StreamOwned::new(
            connection, tcp,
        ))))
    }

    #[cfg(not(feature = "tls"))]
    fn wrap_tls(&self, _tcp: TcpStream, _hostname: &str) -> Result<WsStream> {
        Err(Error::ErrInvalidArgument(
            "wss:// requires the tls feature".to_string(),
        ))
    }

    pub fn ready_state(&self) -> WebSocketState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() == WebSocketState::Open
    }

    /// The sub-protocol agreed on during the handshake.
    pub fn protocol(&self) -> Option<String> {
        self.inner.protocol.lock().unwrap().clone()
    }

    /// Request path, for server-accepted sockets.
    pub fn path(&self) -> Option<String> {
        self.inner.path.lock().unwrap().clone()
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.send_message(MessageType::Binary, data)
    }

    pub fn send_text(&self, data: impl AsRef<str>) -> Result<()> {
        self.inner
            .send_message(MessageType::String, data.as_ref().as_bytes())
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

    pub fn on_error(&self, callback: Option<Callback<Error>>) {
        self.inner.error_callback.set(callback);
    }

    /// Starts the closing handshake.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(feature = "tls")]
mod tls {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any certificate; only for explicitly disabled verification.
    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }
}

struct Location {
    is_secure: bool,
    /// Host header value, including a non-default port.
    host: String,
    hostname: String,
    port: u16,
    path: String,
}

/// Parses `ws[s]://host[:port]/path?query`.
fn parse_url(url: &str) -> Result<Location> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::ErrInvalidArgument(format!("invalid WebSocket URL: {url}")))?;
    let is_secure = match scheme {
        "ws" => false,
        "wss" => true,
        other => {
            return Err(Error::ErrInvalidArgument(format!(
                "invalid WebSocket scheme: {other}"
            )))
        }
    };

    let (authority, path) = match rest.find(|c| c == '/' || c == '?') {
        Some(index) if rest.as_bytes()[index] == b'?' => {
            (&rest[..index], format!("/{}", &rest[index..]))
        }
        Some(index) => (&rest[..index], rest[index..].to_string()),
        None => (rest, "/".to_string()),
    };
    // drop RFC 3986 userinfo if present
    let authority = authority.rsplit_once('@').map(|(_, a)| a).unwrap_or(authority);
    if authority.is_empty() {
        return Err(Error::ErrInvalidArgument(format!(
            "invalid WebSocket URL: {url}"
        )));
    }

    let (hostname, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (host, rest) = v6
            .split_once(']')
            .ok_or_else(|| Error::ErrInvalidArgument(format!("invalid IPv6 host in {url}")))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| Error::ErrInvalidArgument(format!("invalid port in {url}")))?,
            None => default_port(is_secure),
        };
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .map_err(|_| Error::ErrInvalidArgument(format!("invalid port in {url}")))?,
            ),
            None => (authority.to_string(), default_port(is_secure)),
        }
    };
    // registered names may be percent-encoded (RFC 3986); decode before
    // resolution, SNI and the Host header
    let hostname = url_decode(&hostname);

    let host = if port == default_port(is_secure) {
        hostname.clone()
    } else {
        format!("{hostname}:{port}")
    };

    Ok(Location {
        is_secure,
        host,
        hostname,
        port,
        path,
    })
}

fn default_port(is_secure: bool) -> u16 {
    if is_secure {
        443
    } else {
        80
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_url_basic() {
        let location = parse_url("ws://example.com/path?query=1").unwrap();
        assert!(!location.is_secure);
        assert_eq!(location.hostname, "example.com");
        assert_eq!(location.port, 80);
        assert_eq!(location.host, "example.com");
        assert_eq!(location.path, "/path?query=1");
    }

    #[test]
    fn test_parse_url_port_and_default_path() {
        let location = parse_url("wss://example.com:8443").unwrap();
        assert!(location.is_secure);
        assert_eq!(location.port, 8443);
        assert_eq!(location.host, "example.com:8443");
        assert_eq!(location.path, "/");
    }

    #[test]
    fn test_parse_url_ipv6_and_userinfo() {
        let location = parse_url("ws://user:pass@[::1]:9000/x").unwrap();
        assert_eq!(location.hostname, "::1");
        assert_eq!(location.port, 9000);
        assert_eq!(location.path, "/x");
    }

    #[test]
    fn test_parse_url_decodes_host() {
        let location = parse_url("ws://my%2Dhost:9000/x").unwrap();
        assert_eq!(location.hostname, "my-host");
        assert_eq!(location.host, "my-host:9000");
    }

    #[test]
    fn test_parse_url_rejects_bad_scheme() {
        assert!(parse_url("http://example.com").is_err());
        assert!(parse_url("example.com").is_err());
    }

    #[test]
    fn test_parse_url_query_without_path() {
        let location = parse_url("ws://h?x=1").unwrap();
        assert_eq!(location.path, "/?x=1");
        assert_eq!(location.hostname, "h");
    }
}
