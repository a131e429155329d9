use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::media::rtcp::{SenderReport, NTP_UNIX_OFFSET};
use crate::media::rtp::RtpPacketizationConfig;
use crate::media::MediaHandler;
use crate::message::Message;

/// Emits an RTCP Sender Report at least every second of media clock, or on
/// demand.
///
/// Counts the RTP packets flowing out of the packetizer and appends the
/// report to the outbound batch when due.
pub struct RtcpSrReporter {
    pub config: Arc<Mutex<RtpPacketizationConfig>>,
    previous_reported_timestamp: u32,
    needs_to_report: AtomicBool,
    packet_count: u32,
    octet_count: u32,
    started: bool,
}

impl RtcpSrReporter {
    pub fn new(config: Arc<Mutex<RtpPacketizationConfig>>) -> Self {
        Self {
            config,
            previous_reported_timestamp: 0,
            needs_to_report: AtomicBool::new(false),
            packet_count: 0,
            octet_count: 0,
            started: false,
        }
    }

    /// Forces a report on the next outbound batch.
    pub fn set_needs_to_report(&self) {
        self.needs_to_report.store(true, Ordering::SeqCst);
    }

    pub fn previous_reported_timestamp(&self) -> u32 {
        self.previous_reported_timestamp
    }

    fn make_report(&mut self) -> Message {
        let config = self.config.lock().unwrap();
        let now = SystemTime::now();
        let since_unix = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ntp_seconds = since_unix.as_secs() + NTP_UNIX_OFFSET;
        let ntp_fraction =
            ((u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000) & 0xffff_ffff;
        let report = SenderReport {
            ssrc: config.ssrc,
            ntp_timestamp: (ntp_seconds << 32) | ntp_fraction,
            rtp_timestamp: config.timestamp,
            packet_count: self.packet_count,
            octet_count: self.octet_count,
        };
        self.previous_reported_timestamp = config.timestamp;
        Message::binary(report.marshal())
    }
}

impl MediaHandler for RtcpSrReporter {
    fn outgoing(&mut self, messages: &mut Vec<Message>, _send: &mut dyn FnMut(Message)) {
        let (timestamp, clock_rate) = {
            let config = self.config.lock().unwrap();
            (config.timestamp, config.clock_rate)
        };
        if !self.started {
            self.previous_reported_timestamp = timestamp;
            self.started = true;
        }

        for message in messages.iter() {
            self.packet_count += 1;
            self.octet_count += message.payload.len() as u32;
        }

        let elapsed = timestamp.wrapping_sub(self.previous_reported_timestamp);
        let due = clock_rate > 0 && elapsed >= clock_rate;
        if due || self.needs_to_report.swap(false, Ordering::SeqCst) {
            let report = self.make_report();
            messages.push(report);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::rtcp::{for_each_packet, RTCP_PT_SENDER_REPORT};
    use bytes::Bytes;
    use std::time::Duration;

    fn has_sr(messages: &[Message]) -> bool {
        messages.iter().any(|m| {
            let mut found = false;
            for_each_packet(&m.payload, |header, _| {
                found |= header.payload_type == RTCP_PT_SENDER_REPORT;
            });
            found
        })
    }

    #[test]
    fn test_report_every_second_of_media_clock() {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(1, "c", 102, 90000)));
        let mut reporter = RtcpSrReporter::new(Arc::clone(&config));

        let mut messages = vec![Message::binary(Bytes::from_static(b"p"))];
        reporter.outgoing(&mut messages, &mut |_| {});
        assert!(!has_sr(&messages), "no report before a second elapsed");

        config
            .lock()
            .unwrap()
            .advance_timestamp(Duration::from_millis(1100));
        let mut messages = vec![Message::binary(Bytes::from_static(b"p"))];
        reporter.outgoing(&mut messages, &mut |_| {});
        assert!(has_sr(&messages), "report due after a second of media clock");
    }

    #[test]
    fn test_on_demand_report() {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(1, "c", 102, 90000)));
        let mut reporter = RtcpSrReporter::new(config);
        reporter.set_needs_to_report();
        let mut messages = vec![Message::binary(Bytes::from_static(b"p"))];
        reporter.outgoing(&mut messages, &mut |_| {});
        assert!(has_sr(&messages));
    }

    #[test]
    fn test_sr_pairs_ntp_and_rtp_timestamps() {
        let config = Arc::new(Mutex::new(RtpPacketizationConfig::new(1, "c", 102, 90000)));
        {
            let mut c = config.lock().unwrap();
            c.advance_timestamp(Duration::from_secs(2));
        }
        let mut reporter = RtcpSrReporter::new(Arc::clone(&config));
        reporter.set_needs_to_report();
        let mut messages = vec![Message::binary(Bytes::from_static(b"p"))];
        reporter.outgoing(&mut messages, &mut |_| {});

        let report = SenderReport::unmarshal(&messages.last().unwrap().payload).unwrap();
        let config = config.lock().unwrap();
        assert_eq!(report.rtp_timestamp, config.timestamp);

        // rtp = startTs + round((ntpSeconds - startSeconds) * clockRate)
        let start_seconds = config
            .epoch_start
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
            + NTP_UNIX_OFFSET as f64;
        let elapsed = report.ntp_seconds() - start_seconds;
        let expected = config
            .start_timestamp
            .wrapping_add((elapsed * f64::from(config.clock_rate)).round() as u32);
        let delta = report.rtp_timestamp.wrapping_sub(expected) as i32;
        // the report is stamped moments after the sample clock was advanced
        assert!(delta.unsigned_abs() < 90000 / 10, "delta {delta} ticks");
    }
}
