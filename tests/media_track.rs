mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{description_channel, init_logging, peer, signal, wait_until};
use rtcdc::backend::loopback::LoopbackBackend;
use rtcdc::sdp::{Direction, MediaSection, RtpMap, SectionKind};
use rtcdc::{
    H264PacketizationHandler, Nack, NalUnitSeparator, PeerConnectionState, RtcpNackResponder,
    RtcpSrReporter, RtpHeader, RtpPacketizationConfig, Track,
};

const PAYLOAD_TYPE: u8 = 102;
const SSRC: u32 = 1;
const CLOCK_RATE: u32 = 90000;
const FPS: u64 = 30;

fn video_section() -> MediaSection {
    let mut section = MediaSection::media("video", SectionKind::Video, Direction::SendOnly);
    section
        .add_rtp_map(RtpMap {
            payload_type: PAYLOAD_TYPE,
            format: "H264".to_string(),
            clock_rate: CLOCK_RATE,
            encoding_params: None,
        })
        .unwrap();
    section.add_ssrc(SSRC, Some("sender".to_string()));
    section
}

/// An Annex B frame: one small IDR-ish NAL unit with a recognizable body.
fn frame_payload(index: usize) -> Vec<u8> {
    let mut nalu = vec![0, 0, 0, 1, 0x65];
    nalu.extend_from_slice(format!("frame-{index:03}").as_bytes());
    nalu
}

struct ReceivedPacket {
    header: RtpHeader,
    payload: Vec<u8>,
}

/// H264 track round trip: 30 frames at 30 fps yield monotonically
/// increasing sequence numbers, a timestamp delta of 3000 per frame, a
/// marker on the last packet of each frame, and at least one sender
/// report.
#[test]
fn test_h264_track_round_trip() {
    init_logging();
    let backend = LoopbackBackend::new();
    let sender = peer(&backend);
    let receiver = peer(&backend);
    let sender_rx = description_channel(&sender);
    let receiver_rx = description_channel(&receiver);

    let rtp_packets = Arc::new(Mutex::new(Vec::<ReceivedPacket>::new()));
    let sr_count = Arc::new(AtomicUsize::new(0));
    let remote_track: Arc<Mutex<Option<Track>>> = Arc::new(Mutex::new(None));
    {
        let rtp_packets = Arc::clone(&rtp_packets);
        let sr_count = Arc::clone(&sr_count);
        let remote_track = Arc::clone(&remote_track);
        receiver.on_track(Some(Box::new(move |track| {
            let rtp_packets = Arc::clone(&rtp_packets);
            let sr_count = Arc::clone(&sr_count);
            track.on_message(Some(Box::new(move |message| {
                if message.payload.len() >= 2 && message.payload[1] == 200 {
                    sr_count.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                if let Ok((header, offset)) = RtpHeader::unmarshal(&message.payload) {
                    rtp_packets.lock().unwrap().push(ReceivedPacket {
                        header,
                        payload: message.payload[offset..].to_vec(),
                    });
                }
            })));
            *remote_track.lock().unwrap() = Some(track);
        })));
    }

    let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(
        SSRC,
        "sender",
        PAYLOAD_TYPE,
        CLOCK_RATE,
    )));
    let track = sender.add_track(video_section()).unwrap();
    track.add_media_handler(Box::new(H264PacketizationHandler::new(
        Arc::clone(&config),
        NalUnitSeparator::StartSequence,
    )));
    let reporter = RtcpSrReporter::new(Arc::clone(&config));
    // ask for an immediate report; the media clock covers less than the
    // one-second reporting interval in this test
    reporter.set_needs_to_report();
    track.add_media_handler(Box::new(reporter));
    track.add_media_handler(Box::new(RtcpNackResponder::default()));

    signal(&sender, &sender_rx, &receiver, &receiver_rx);
    wait_until("peers connected", || {
        sender.state() == PeerConnectionState::Connected
            && receiver.state() == PeerConnectionState::Connected
    });
    wait_until("track open", || track.is_open());

    for index in 0..FPS {
        config
            .lock()
            .unwrap()
            .advance_timestamp(Duration::from_nanos(index * 1_000_000_000 / FPS));
        track.send(&frame_payload(index as usize)).unwrap();
    }

    wait_until("all frames received", || {
        rtp_packets
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.header.marker)
            .count()
            == FPS as usize
    });

    let packets = rtp_packets.lock().unwrap();

    // strictly increasing sequence numbers modulo 2^16
    for pair in packets.windows(2) {
        assert_eq!(
            pair[1].header.sequence_number,
            pair[0].header.sequence_number.wrapping_add(1)
        );
    }

    // one marker per frame, timestamp stepping by clock_rate / fps
    let marked: Vec<&ReceivedPacket> = packets.iter().filter(|p| p.header.marker).collect();
    assert_eq!(marked.len(), FPS as usize);
    for pair in marked.windows(2) {
        let delta = pair[1].header.timestamp.wrapping_sub(pair[0].header.timestamp);
        assert_eq!(delta, CLOCK_RATE / FPS as u32, "3000 ticks per frame");
    }

    assert!(sr_count.load(Ordering::SeqCst) >= 1, "at least one SR seen");

    sender.close();
    receiver.close();
}

/// NACK recovery: the receiver asks for one sequence number and gets the
/// identical packet again.
#[test]
fn test_nack_retransmission() {
    init_logging();
    let backend = LoopbackBackend::new();
    let sender = peer(&backend);
    let receiver = peer(&backend);
    let sender_rx = description_channel(&sender);
    let receiver_rx = description_channel(&receiver);

    let rtp_packets = Arc::new(Mutex::new(Vec::<(u16, Vec<u8>)>::new()));
    let remote_track: Arc<Mutex<Option<Track>>> = Arc::new(Mutex::new(None));
    {
        let rtp_packets = Arc::clone(&rtp_packets);
        let remote_track = Arc::clone(&remote_track);
        receiver.on_track(Some(Box::new(move |track| {
            let rtp_packets = Arc::clone(&rtp_packets);
            track.on_message(Some(Box::new(move |message| {
                if let Ok((header, _)) = RtpHeader::unmarshal(&message.payload) {
                    if header.payload_type == PAYLOAD_TYPE {
                        rtp_packets
                            .lock()
                            .unwrap()
                            .push((header.sequence_number, message.payload.to_vec()));
                    }
                }
            })));
            *remote_track.lock().unwrap() = Some(track);
        })));
    }

    let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(
        SSRC,
        "sender",
        PAYLOAD_TYPE,
        CLOCK_RATE,
    )));
    let track = sender.add_track(video_section()).unwrap();
    track.add_media_handler(Box::new(H264PacketizationHandler::new(
        Arc::clone(&config),
        NalUnitSeparator::StartSequence,
    )));
    track.add_media_handler(Box::new(RtcpNackResponder::default()));

    signal(&sender, &sender_rx, &receiver, &receiver_rx);
    wait_until("track open", || track.is_open());

    for index in 0..5 {
        config
            .lock()
            .unwrap()
            .advance_timestamp(Duration::from_millis(index * 33));
        track.send(&frame_payload(index as usize)).unwrap();
    }
    wait_until("packets received", || rtp_packets.lock().unwrap().len() == 5);

    // pretend the middle packet was lost and NACK it
    let (lost_seq, lost_payload) = rtp_packets.lock().unwrap()[2].clone();
    let nack = Nack::from_sequence_numbers(2, SSRC, &[lost_seq]);
    let remote = remote_track.lock().unwrap().clone().unwrap();
    remote.send(&nack.marshal()).unwrap();

    wait_until("retransmission arrives", || rtp_packets.lock().unwrap().len() == 6);
    let packets = rtp_packets.lock().unwrap();
    let retransmitted = &packets[5];
    assert_eq!(retransmitted.0, lost_seq, "same sequence number");
    assert_eq!(retransmitted.1, lost_payload, "identical payload");

    sender.close();
    receiver.close();
}
