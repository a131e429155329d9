mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{description_channel, init_logging, peer, signal, wait_until};
use rtcdc::backend::loopback::LoopbackBackend;
use rtcdc::sdp::SdpType;
use rtcdc::{
    DataChannel, DataChannelInit, Error, MessageType, PeerConnectionState, Reliability,
};

/// Loopback data channel, reliable and ordered: the answerer echoes every
/// message, and byte streams survive the round trip unchanged and in
/// order.
#[test]
fn test_loopback_reliable_echo() {
    init_logging();
    let backend = LoopbackBackend::new();
    let offerer = peer(&backend);
    let answerer = peer(&backend);
    let offerer_rx = description_channel(&offerer);
    let answerer_rx = description_channel(&answerer);

    // the answerer echoes whatever arrives on any channel
    let remote_channel: Arc<Mutex<Option<DataChannel>>> = Arc::new(Mutex::new(None));
    let rc = Arc::clone(&remote_channel);
    answerer.on_data_channel(Some(Box::new(move |channel| {
        let echo = channel.clone();
        channel.on_message(Some(Box::new(move |message| {
            match message.message_type {
                MessageType::String => {
                    let text = String::from_utf8(message.payload.to_vec()).unwrap();
                    echo.send_string(text).unwrap();
                }
                _ => echo.send(&message.payload).unwrap(),
            }
        })));
        *rc.lock().unwrap() = Some(channel);
    })));

    let channel = offerer.create_data_channel("echo", None).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    channel.on_message(Some(Box::new(move |message| {
        r.lock().unwrap().push(message);
    })));

    signal(&offerer, &offerer_rx, &answerer, &answerer_rx);

    wait_until("both peers connected", || {
        offerer.state() == PeerConnectionState::Connected
            && answerer.state() == PeerConnectionState::Connected
    });
    wait_until("channel open", || channel.is_open());
    assert_eq!(channel.label(), "echo");

    let bytes: Vec<u8> = (0u8..=255).collect();
    channel.send(&bytes).unwrap();
    channel.send_string("hello").unwrap();

    wait_until("echo round trip", || received.lock().unwrap().len() == 2);
    let received = received.lock().unwrap();
    assert_eq!(received[0].message_type, MessageType::Binary);
    assert_eq!(&received[0].payload[..], &bytes[..]);
    assert_eq!(received[1].message_type, MessageType::String);
    assert_eq!(&received[1].payload[..], b"hello");
    drop(received);

    wait_until("buffered amount drains", || channel.buffered_amount() == 0);

    offerer.close();
    answerer.close();
    assert_eq!(offerer.state(), PeerConnectionState::Closed);
    assert_eq!(answerer.state(), PeerConnectionState::Closed);
}

/// Replacing the fingerprint in the answer must fail the offerer's DTLS
/// verification: the connection goes to Failed, an error surfaces, and no
/// channel opens.
#[test]
fn test_fingerprint_mismatch_fails_connection() {
    init_logging();
    let backend = LoopbackBackend::new();
    let offerer = peer(&backend);
    let answerer = peer(&backend);
    let offerer_rx = description_channel(&offerer);
    let answerer_rx = description_channel(&answerer);

    let channel = offerer.create_data_channel("doomed", None).unwrap();

    let (offer, _) = offerer_rx.recv_timeout(common::TEST_TIMEOUT).unwrap();
    answerer.set_remote_description(&offer, "offer").unwrap();
    let (answer, _) = answerer_rx.recv_timeout(common::TEST_TIMEOUT).unwrap();

    // forge the fingerprint line
    let forged: String = answer
        .lines()
        .map(|line| {
            if line.starts_with("a=fingerprint:sha-256") {
                format!(
                    "a=fingerprint:sha-256 {}\r",
                    (0..32).map(|_| "aa").collect::<Vec<_>>().join(":")
                )
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let failed = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&failed);
    offerer.on_error(Some(Box::new(move |err| {
        assert_eq!(err, Error::ErrFingerprintMismatch);
        f.store(true, Ordering::SeqCst);
    })));

    offerer.set_remote_description(&forged, "answer").unwrap();

    wait_until("offerer failed", || {
        offerer.state() == PeerConnectionState::Failed
    });
    wait_until("verification error reported", || failed.load(Ordering::SeqCst));
    assert!(!channel.is_open());

    offerer.close();
    answerer.close();
}

/// Partial-reliable timed channel under 50% loss: some messages are
/// dropped, the association stays connected and the buffered amount still
/// drains.
#[test]
fn test_partial_reliable_timed_under_loss() {
    init_logging();
    let backend = LoopbackBackend::with_loss(0.5);
    let offerer = peer(&backend);
    let answerer = peer(&backend);
    let offerer_rx = description_channel(&offerer);
    let answerer_rx = description_channel(&answerer);

    let delivered = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&delivered);
    answerer.on_data_channel(Some(Box::new(move |channel| {
        let d = Arc::clone(&d);
        channel.on_message(Some(Box::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        })));
    })));

    let channel = offerer
        .create_data_channel(
            "lossy",
            Some(DataChannelInit {
                reliability: Reliability {
                    unordered: false,
                    max_packet_life_time: Some(Duration::from_millis(0)),
                    max_retransmits: None,
                },
                ..Default::default()
            }),
        )
        .unwrap();

    signal(&offerer, &offerer_rx, &answerer, &answerer_rx);
    wait_until("channel open", || channel.is_open());

    const TOTAL: usize = 1000;
    for index in 0..TOTAL {
        channel.send(format!("message-{index}").as_bytes()).unwrap();
    }

    wait_until("buffered amount drains", || channel.buffered_amount() == 0);
    // drops are overwhelmingly likely at 50% loss over 1000 messages
    wait_until("some messages delivered", || {
        delivered.load(Ordering::SeqCst) > 0
    });
    std::thread::sleep(Duration::from_millis(100));
    let count = delivered.load(Ordering::SeqCst);
    assert!(count < TOTAL, "expected losses, got all {count}");
    assert_eq!(offerer.state(), PeerConnectionState::Connected);
    assert_eq!(answerer.state(), PeerConnectionState::Connected);

    offerer.close();
    answerer.close();
}

/// Messages sent before the channel opens are buffered and flushed in
/// order on open.
#[test]
fn test_pre_open_sends_flush_in_order() {
    init_logging();
    let backend = LoopbackBackend::new();
    let offerer = peer(&backend);
    let answerer = peer(&backend);
    let offerer_rx = description_channel(&offerer);
    let answerer_rx = description_channel(&answerer);

    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    answerer.on_data_channel(Some(Box::new(move |channel| {
        let r = Arc::clone(&r);
        channel.on_message(Some(Box::new(move |message| {
            r.lock().unwrap().push(message.payload.clone());
        })));
    })));

    let channel = offerer.create_data_channel("early", None).unwrap();
    for index in 0..5u8 {
        channel.send(&[index]).unwrap();
    }

    signal(&offerer, &offerer_rx, &answerer, &answerer_rx);
    wait_until("flushed messages arrive", || received.lock().unwrap().len() == 5);
    let received = received.lock().unwrap();
    for (index, payload) in received.iter().enumerate() {
        assert_eq!(&payload[..], &[index as u8]);
    }
}

/// Graceful close under backpressure: the channel reaches Closed, sends
/// after close fail, and no callback runs after on_closed.
#[test]
fn test_close_under_backpressure() {
    init_logging();
    let backend = LoopbackBackend::new();
    let offerer = peer(&backend);
    let answerer = peer(&backend);
    let offerer_rx = description_channel(&offerer);
    let answerer_rx = description_channel(&answerer);

    let channel = offerer.create_data_channel("pressure", None).unwrap();
    channel.set_buffered_amount_low_threshold(1024);

    signal(&offerer, &offerer_rx, &answerer, &answerer_rx);
    wait_until("channel open", || channel.is_open());

    let closed = Arc::new(AtomicBool::new(false));
    let after_close_callbacks = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&closed);
    channel.on_closed(Some(Box::new(move |_| {
        c.store(true, Ordering::SeqCst);
    })));
    let a = Arc::clone(&after_close_callbacks);
    let c = Arc::clone(&closed);
    channel.on_message(Some(Box::new(move |_| {
        if c.load(Ordering::SeqCst) {
            a.fetch_add(1, Ordering::SeqCst);
        }
    })));

    // fill well past the low threshold, then close immediately
    let chunk = vec![0u8; 512];
    for _ in 0..8 {
        channel.send(&chunk).unwrap();
    }
    channel.close();

    wait_until("channel closed", || channel.is_closed());
    assert!(closed.load(Ordering::SeqCst), "on_closed fired");
    assert_eq!(channel.send(b"too late"), Err(Error::ErrClosed));
    assert_eq!(channel.send_string("too late"), Err(Error::ErrClosed));

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(after_close_callbacks.load(Ordering::SeqCst), 0);

    offerer.close();
    answerer.close();
}

/// The low-watermark callback fires exactly once per crossing while a
/// channel drains.
#[test]
fn test_buffered_amount_low_after_send_burst() {
    init_logging();
    let backend = LoopbackBackend::new();
    let offerer = peer(&backend);
    let answerer = peer(&backend);
    let offerer_rx = description_channel(&offerer);
    let answerer_rx = description_channel(&answerer);

    let channel = offerer.create_data_channel("watermark", None).unwrap();

    signal(&offerer, &offerer_rx, &answerer, &answerer_rx);
    wait_until("channel open", || channel.is_open());

    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    channel.set_buffered_amount_low_threshold(0);
    channel.on_buffered_amount_low(Some(Box::new(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    })));

    channel.send(&vec![1u8; 4096]).unwrap();
    wait_until("drains to zero", || channel.buffered_amount() == 0);
    wait_until("low watermark reported", || hits.load(Ordering::SeqCst) >= 1);

    offerer.close();
    answerer.close();
}

/// A negotiated channel with a fixed stream id opens without DCEP on both
/// sides. The answerer negotiates by hand to avoid offer glare.
#[test]
fn test_negotiated_channel() {
    use rtcdc::backend::Backend;
    use rtcdc::{Configuration, PeerConnection};

    init_logging();
    let backend = LoopbackBackend::new();
    let offerer = peer(&backend);
    let answerer = PeerConnection::new(Configuration {
        backend: Some(Arc::clone(&backend) as Arc<dyn Backend>),
        disable_auto_negotiation: true,
        ..Default::default()
    })
    .unwrap();
    let offerer_rx = description_channel(&offerer);
    let answerer_rx = description_channel(&answerer);

    let init = DataChannelInit {
        negotiated: true,
        stream: Some(4),
        ..Default::default()
    };
    let local = offerer
        .create_data_channel("negotiated", Some(init.clone()))
        .unwrap();
    let remote = answerer.create_data_channel("negotiated", Some(init)).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    remote.on_message(Some(Box::new(move |message| {
        r.lock().unwrap().push(message.payload.clone());
    })));

    let (offer, _) = offerer_rx.recv_timeout(common::TEST_TIMEOUT).unwrap();
    answerer.set_remote_description(&offer, "offer").unwrap();
    answerer.set_local_description(None).unwrap();
    let (answer, _) = answerer_rx.recv_timeout(common::TEST_TIMEOUT).unwrap();
    offerer.set_remote_description(&answer, "answer").unwrap();

    wait_until("both negotiated channels open", || {
        local.is_open() && remote.is_open()
    });
    assert_eq!(local.stream(), Some(4));
    assert_eq!(remote.stream(), Some(4));

    local.send(b"direct").unwrap();
    wait_until("message over negotiated channel", || {
        !received.lock().unwrap().is_empty()
    });
    assert_eq!(&received.lock().unwrap()[0][..], b"direct");

    offerer.close();
    answerer.close();
}

/// The local description carries the offer or answer type matching the
/// signaling flow, and manual renegotiation is rejected in the wrong
/// state.
#[test]
fn test_signaling_type_coherence() {
    init_logging();
    let backend = LoopbackBackend::new();
    let offerer = peer(&backend);
    let answerer = peer(&backend);
    let offerer_rx = description_channel(&offerer);
    let _answerer_rx = description_channel(&answerer);

    let _channel = offerer.create_data_channel("x", None).unwrap();
    let (offer, sdp_type) = offerer_rx.recv_timeout(common::TEST_TIMEOUT).unwrap();
    assert_eq!(sdp_type, SdpType::Offer);

    // an answer without a remote offer is a caller error
    assert!(offerer.set_local_description(Some(SdpType::Answer)).is_err());
    // applying an answer type while stable is a caller error too
    assert!(answerer.set_remote_description(&offer, "answer").is_err());
    // bogus type strings are rejected outright
    assert!(answerer.set_remote_description(&offer, "bogus").is_err());

    offerer.close();
    answerer.close();
}
