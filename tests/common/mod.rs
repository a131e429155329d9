#![allow(dead_code)] // not every test binary uses every helper

use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

use rtcdc::backend::loopback::LoopbackBackend;
use rtcdc::backend::Backend;
use rtcdc::sdp::SdpType;
use rtcdc::{Configuration, PeerConnection};
use std::sync::Arc;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();
}

/// Polls a condition until it holds or the timeout elapses.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn peer(backend: &Arc<LoopbackBackend>) -> PeerConnection {
    PeerConnection::new(Configuration {
        backend: Some(Arc::clone(backend) as Arc<dyn Backend>),
        ..Default::default()
    })
    .expect("peer connection")
}

/// Hooks a peer's local descriptions into an mpsc channel so the test can
/// relay them like a signaling server would.
pub fn description_channel(pc: &PeerConnection) -> Receiver<(String, SdpType)> {
    let (tx, rx) = channel();
    pc.on_local_description(Some(Box::new(move |description| {
        let _ = tx.send((description.to_string(), description.sdp_type));
    })));
    rx
}

/// Relays one offer/answer round between the two peers.
pub fn signal(
    offerer: &PeerConnection,
    offerer_rx: &Receiver<(String, SdpType)>,
    answerer: &PeerConnection,
    answerer_rx: &Receiver<(String, SdpType)>,
) {
    let (offer, sdp_type) = offerer_rx
        .recv_timeout(TEST_TIMEOUT)
        .expect("offer from offerer");
    assert_eq!(sdp_type, SdpType::Offer);
    answerer
        .set_remote_description(&offer, sdp_type.as_str())
        .expect("apply offer");

    let (answer, sdp_type) = answerer_rx
        .recv_timeout(TEST_TIMEOUT)
        .expect("answer from answerer");
    assert_eq!(sdp_type, SdpType::Answer);
    offerer
        .set_remote_description(&answer, sdp_type.as_str())
        .expect("apply answer");
}
