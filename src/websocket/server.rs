//! WebSocket server accepting signaling clients over TCP, optionally TLS.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::callback::{Callback, CallbackSlot};
use crate::error::{Error, Result};
use crate::websocket::handshake::server_handshake;
use crate::websocket::{WebSocket, WebSocketConfiguration, WebSocketImpl, WsStream};

#[derive(Debug, Default, Clone)]
pub struct WebSocketServerConfiguration {
    /// TCP port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    pub bind_address: Option<String>,
    /// Settings applied to every accepted client.
    pub client: WebSocketConfiguration,
    /// PEM certificate chain file enabling TLS.
    #[cfg(feature = "tls")]
    pub certificate_pem_file: Option<String>,
    /// PEM private key file, required with the certificate.
    #[cfg(feature = "tls")]
    pub key_pem_file: Option<String>,
}

struct WebSocketServerImpl {
    config: WebSocketServerConfiguration,
    listener: TcpListener,
    port: u16,
    stopped: AtomicBool,
    client_callback: CallbackSlot<WebSocket>,
    #[cfg(feature = "tls")]
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

/// Listens for WebSocket clients and hands each accepted, handshaken
/// connection to `on_client`.
pub struct WebSocketServer {
    inner: Arc<WebSocketServerImpl>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketServer {
    pub fn new(config: WebSocketServerConfiguration) -> Result<Self> {
        let bind_address = config.bind_address.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let listener = TcpListener::bind((bind_address.as_str(), config.port))?;
        let port = listener.local_addr()?.port();
        debug!("WebSocket server listening on port {port}");

        #[cfg(feature = "tls")]
        let tls_config = Self::load_tls_config(&config)?;

        let inner = Arc::new(WebSocketServerImpl {
            config,
            listener,
            port,
            stopped: AtomicBool::new(false),
            client_callback: CallbackSlot::default(),
            #[cfg(feature = "tls")]
            tls_config,
        });

        let weak = Arc::downgrade(&inner);
        let acceptor = thread::Builder::new()
            .name("rtcdc-ws-server".to_string())
            .spawn(move || accept_loop(weak))
            .map_err(|e| Error::Other(e.to_string()))?;

        Ok(Self {
            inner,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    #[cfg(feature = "tls")]
    fn load_tls_config(
        config: &WebSocketServerConfiguration,
    ) -> Result<Option<Arc<rustls::ServerConfig>>> {
        use std::fs::File;
        use std::io::BufReader;

        let (certificate_file, key_file) = match (&config.certificate_pem_file, &config.key_pem_file)
        {
            (Some(certificate_file), Some(key_file)) => (certificate_file, key_file),
            (None, None) => return Ok(None),
            _ => {
                return Err(Error::ErrInvalidArgument(
                    "either none or both certificate and key files must be set".to_string(),
                ))
            }
        };

        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(certificate_file)?))
            .collect::<std::io::Result<Vec<_>>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
            .ok_or_else(|| Error::ErrInvalidArgument("no private key in PEM file".to_string()))?;
        let tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::ErrInvalidArgument(format!("invalid certificate: {e}")))?;
        Ok(Some(Arc::new(tls)))
    }

    /// The bound TCP port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Invoked with every client that completed the opening handshake.
    pub fn on_client(&self, callback: Option<Callback<WebSocket>>) {
        self.inner.client_callback.set(callback);
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping WebSocket server");
        // unblock accept() by poking the listener
        let _ = TcpStream::connect(("127.0.0.1", self.inner.port));
        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            let _ = acceptor.join();
        }
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(server: Weak<WebSocketServerImpl>) {
    loop {
        let Some(inner) = server.upgrade() else { return };
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let accepted = inner.listener.accept();
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        match accepted {
            Ok((tcp, address)) => {
                trace!("Accepted TCP connection from {address}");
                let server = Weak::clone(&server);
                let result = thread::Builder::new()
                    .name("rtcdc-ws-accept".to_string())
                    .spawn(move || {
                        if let Some(inner) = server.upgrade() {
                            if let Err(err) = accept_client(&inner, tcp) {
                                warn!("WebSocket handshake with {address} failed: {err}");
                            }
                        }
                    });
                if let Err(err) = result {
                    warn!("Failed to spawn handshake thread: {err}");
                }
            }
            Err(err) => {
                warn!("Accept failed: {err}");
                return;
            }
        }
    }
}

fn accept_client(server: &WebSocketServerImpl, tcp: TcpStream) -> Result<()> {
    tcp.set_nodelay(true).ok();

    #[cfg(feature = "tls")]
    let mut stream = match &server.tls_config {
        Some(tls_config) => {
            let connection = rustls::ServerConnection::new(Arc::clone(tls_config))
                .map_err(|e| Error::Other(format!("TLS setup failed: {e}")))?;
            WsStream::TlsServer(Box::new(rustls::StreamOwned::new(connection, tcp)))
        }
        None => WsStream::Plain(tcp),
    };
    #[cfg(not(feature = "tls"))]
    let mut stream = WsStream::Plain(tcp);

    let (path, protocol) =
        server_handshake(&mut stream, &server.config.client.protocols)?;

    let client = WebSocketImpl::new(server.config.client.clone(), false);
    client.attach(stream, protocol, Some(path));
    server.client_callback.call(WebSocket::from_impl(client));
    Ok(())
}
