mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common::{init_logging, wait_until};
use rtcdc::{
    Error, MessageType, WebSocket, WebSocketConfiguration, WebSocketServer,
    WebSocketServerConfiguration, WebSocketState,
};

fn echo_server(config: WebSocketServerConfiguration) -> (WebSocketServer, Arc<Mutex<Vec<WebSocket>>>) {
    let server = WebSocketServer::new(config).expect("server");
    let clients = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&clients);
    server.on_client(Some(Box::new(move |ws| {
        let echo = ws.clone();
        ws.on_message(Some(Box::new(move |message| {
            let result = match message.message_type {
                MessageType::String => {
                    echo.send_text(String::from_utf8(message.payload.to_vec()).unwrap())
                }
                _ => echo.send(&message.payload),
            };
            result.expect("echo send");
        })));
        c.lock().unwrap().push(ws);
    })));
    (server, clients)
}

#[test]
fn test_client_server_echo() {
    init_logging();
    let (server, clients) = echo_server(WebSocketServerConfiguration::default());

    let client = WebSocket::new(Some(WebSocketConfiguration {
        protocols: vec!["signaling".to_string()],
        ..Default::default()
    }));

    let opened = Arc::new(AtomicBool::new(false));
    let o = Arc::clone(&opened);
    client.on_open(Some(Box::new(move |_| {
        o.store(true, Ordering::SeqCst);
    })));
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    client.on_message(Some(Box::new(move |message| {
        r.lock().unwrap().push(message);
    })));

    client
        .open(&format!("ws://127.0.0.1:{}/room?id=42", server.port()))
        .expect("connect");

    wait_until("client open", || client.is_open());
    assert!(opened.load(Ordering::SeqCst), "on_open fired");
    assert_eq!(client.protocol().as_deref(), Some("signaling"));
    wait_until("server saw the client", || !clients.lock().unwrap().is_empty());
    let server_side = clients.lock().unwrap()[0].clone();
    assert_eq!(server_side.path().as_deref(), Some("/room?id=42"));

    client.send(b"binary blob").expect("send binary");
    client.send_text("text message").expect("send text");

    wait_until("echo round trip", || received.lock().unwrap().len() == 2);
    let received = received.lock().unwrap();
    assert_eq!(received[0].message_type, MessageType::Binary);
    assert_eq!(&received[0].payload[..], b"binary blob");
    assert_eq!(received[1].message_type, MessageType::String);
    assert_eq!(&received[1].payload[..], b"text message");
    drop(received);

    let closed = Arc::new(AtomicBool::new(false));
    let c = Arc::clone(&closed);
    client.on_closed(Some(Box::new(move |_| {
        c.store(true, Ordering::SeqCst);
    })));
    client.close();
    wait_until("client closed", || {
        client.ready_state() == WebSocketState::Closed
    });
    assert!(closed.load(Ordering::SeqCst), "on_closed fired");

    server.stop();
}

#[test]
fn test_large_message_and_limit() {
    init_logging();
    let (server, _clients) = echo_server(WebSocketServerConfiguration::default());

    let client = WebSocket::new(Some(WebSocketConfiguration {
        max_message_size: 1024,
        ..Default::default()
    }));
    client
        .open(&format!("ws://127.0.0.1:{}/", server.port()))
        .expect("connect");
    wait_until("client open", || client.is_open());

    // within the limit: echoed back fine (extended 16-bit length on the wire)
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    client.on_message(Some(Box::new(move |message| {
        r.lock().unwrap().push(message);
    })));
    let payload = vec![0xABu8; 600];
    client.send(&payload).expect("send");
    wait_until("echo", || !received.lock().unwrap().is_empty());
    assert_eq!(&received.lock().unwrap()[0].payload[..], &payload[..]);

    // over the limit: rejected locally
    let oversized = vec![0u8; 2048];
    assert!(matches!(
        client.send(&oversized),
        Err(Error::ErrMessageTooLarge { .. })
    ));

    client.close();
    server.stop();
}

#[test]
fn test_server_close_reaches_client() {
    init_logging();
    let (server, clients) = echo_server(WebSocketServerConfiguration::default());

    let client = WebSocket::new(None);
    client
        .open(&format!("ws://127.0.0.1:{}/", server.port()))
        .expect("connect");
    wait_until("client open", || client.is_open());
    wait_until("server side present", || !clients.lock().unwrap().is_empty());

    clients.lock().unwrap()[0].close();
    wait_until("client saw the close", || {
        client.ready_state() == WebSocketState::Closed
    });

    server.stop();
}

#[test]
fn test_open_rejects_bad_urls() {
    init_logging();
    let client = WebSocket::new(None);
    assert!(client.open("http://example.com/").is_err());
    assert!(client.open("ws://").is_err());
}
