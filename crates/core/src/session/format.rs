//! Per-format (payload type) state of a record-mode media.
//!
//! Each negotiated [`Format`] of a media owns an RTCP receiver that learns
//! the sender's SSRC, tracks sequence numbers and keeps the last Sender
//! Report so RTP timestamps can be mapped to wall-clock time.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rtcp_types::SenderReport;
use rtp_types::RtpPacket;

use crate::error::DecodeError;
use crate::media::Format;
use crate::session::OnDecodeError;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Callback receiving every accepted RTP packet of a format.
pub type OnPacketRtp = Arc<dyn Fn(&Format, &RtpPacket<'_>) + Send + Sync>;

/// RTCP receiver side of a format.
pub trait RtcpReceiver: Send + Sync {
    /// SSRC of the remote sender, once known.
    fn sender_ssrc(&self) -> Option<u32>;

    /// Store a Sender Report for clock correlation.
    fn process_sender_report(&self, report: &SenderReport<'_>, now: SystemTime);
}

/// State attached to one payload type of a record-mode media.
pub trait SessionFormat: Send + Sync {
    fn payload_type(&self) -> u8;

    /// Prepare statistics. Called before any packet can be routed here.
    fn start(&self);

    fn stop(&self);

    /// RTP packet received over UDP at `now`.
    fn read_rtp_udp(&self, packet: &RtpPacket<'_>, now: SystemTime);

    /// RTP packet received interleaved on the RTSP connection.
    fn read_rtp_tcp(&self, packet: &RtpPacket<'_>);

    fn rtcp_receiver(&self) -> &dyn RtcpReceiver;
}

/// Timing information carried by the last Sender Report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReportInfo {
    /// 64-bit NTP timestamp (32.32 fixed point since 1900).
    pub ntp_time: u64,
    pub rtp_timestamp: u32,
    pub received_at: SystemTime,
}

#[derive(Debug, Default)]
struct ReceiverState {
    sender_ssrc: Option<u32>,
    last_sequence: Option<u16>,
    packets_received: u64,
    packets_lost: u64,
    last_packet_at: Option<SystemTime>,
    last_sender_report: Option<SenderReportInfo>,
}

/// [`RtcpReceiver`] keeping reception statistics for one format.
///
/// Inactive until [`start`](Self::start); inputs received while inactive
/// are ignored.
pub struct RtcpReceiverStats {
    clock_rate: u32,
    state: Mutex<Option<ReceiverState>>,
}

impl RtcpReceiverStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            state: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        *self.state.lock() = Some(ReceiverState::default());
    }

    pub fn stop(&self) {
        self.state.lock().take();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Account for an RTP packet. Returns the number of packets lost since
    /// the previous one.
    pub fn process_packet(&self, packet: &RtpPacket<'_>, now: Option<SystemTime>) -> u64 {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return 0;
        };

        let ssrc = packet.ssrc();
        let sequence = packet.sequence_number();

        if now.is_some() {
            state.last_packet_at = now;
        }

        if state.sender_ssrc != Some(ssrc) {
            if let Some(previous) = state.sender_ssrc {
                tracing::debug!(
                    previous = format_args!("{:#010X}", previous),
                    ssrc = format_args!("{:#010X}", ssrc),
                    "sender SSRC changed"
                );
            }
            state.sender_ssrc = Some(ssrc);
            state.last_sequence = Some(sequence);
            state.packets_received += 1;
            return 0;
        }

        state.packets_received += 1;

        let Some(last) = state.last_sequence else {
            state.last_sequence = Some(sequence);
            return 0;
        };

        let diff = sequence.wrapping_sub(last);
        if diff == 0 || diff >= 0x8000 {
            // duplicate or reordered
            return 0;
        }

        state.last_sequence = Some(sequence);
        let lost = u64::from(diff - 1);
        state.packets_lost += lost;
        lost
    }

    pub fn packets_received(&self) -> u64 {
        self.state.lock().as_ref().map_or(0, |s| s.packets_received)
    }

    pub fn packets_lost(&self) -> u64 {
        self.state.lock().as_ref().map_or(0, |s| s.packets_lost)
    }

    /// Arrival time of the last packet received over UDP.
    pub fn last_packet_at(&self) -> Option<SystemTime> {
        self.state.lock().as_ref().and_then(|s| s.last_packet_at)
    }

    pub fn last_sender_report(&self) -> Option<SenderReportInfo> {
        self.state.lock().as_ref().and_then(|s| s.last_sender_report)
    }

    /// Wall-clock time of an RTP timestamp, based on the last Sender Report.
    pub fn packet_ntp(&self, rtp_timestamp: u32) -> Option<SystemTime> {
        let report = self.last_sender_report()?;
        if self.clock_rate == 0 {
            return None;
        }

        let base = ntp_to_system_time(report.ntp_time)?;
        let diff = i64::from(rtp_timestamp.wrapping_sub(report.rtp_timestamp) as i32);
        let offset_nanos = diff.unsigned_abs() * 1_000_000_000 / u64::from(self.clock_rate);
        let offset = Duration::from_nanos(offset_nanos);

        if diff >= 0 {
            base.checked_add(offset)
        } else {
            base.checked_sub(offset)
        }
    }
}

impl RtcpReceiver for RtcpReceiverStats {
    fn sender_ssrc(&self) -> Option<u32> {
        self.state.lock().as_ref().and_then(|s| s.sender_ssrc)
    }

    fn process_sender_report(&self, report: &SenderReport<'_>, now: SystemTime) {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return;
        };

        if state.sender_ssrc.is_none() {
            state.sender_ssrc = Some(report.ssrc());
        }
        state.last_sender_report = Some(SenderReportInfo {
            ntp_time: report.ntp_timestamp(),
            rtp_timestamp: report.rtp_timestamp(),
            received_at: now,
        });
    }
}

/// Convert a 32.32 NTP timestamp to [`SystemTime`].
pub fn ntp_to_system_time(ntp: u64) -> Option<SystemTime> {
    let secs = (ntp >> 32).checked_sub(NTP_UNIX_OFFSET_SECS)?;
    let nanos = ((ntp & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos as u32))
}

/// Default [`SessionFormat`]: statistics plus an RTP callback.
pub struct ServerSessionFormat {
    format: Format,
    receiver: RtcpReceiverStats,
    on_packet_rtp: OnPacketRtp,
    on_decode_error: OnDecodeError,
}

impl ServerSessionFormat {
    pub fn new(format: Format, on_decode_error: OnDecodeError) -> Self {
        let receiver = RtcpReceiverStats::new(format.clock_rate());
        Self {
            format,
            receiver,
            on_packet_rtp: Arc::new(|_, _| {}),
            on_decode_error,
        }
    }

    pub fn with_on_packet_rtp(mut self, on_packet_rtp: OnPacketRtp) -> Self {
        self.on_packet_rtp = on_packet_rtp;
        self
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn stats(&self) -> &RtcpReceiverStats {
        &self.receiver
    }

    fn read_rtp(&self, packet: &RtpPacket<'_>, now: Option<SystemTime>) {
        if !self.receiver.is_running() {
            tracing::trace!(payload_type = self.format.payload_type(), "format not started");
            return;
        }

        let lost = self.receiver.process_packet(packet, now);
        if lost > 0 {
            (self.on_decode_error)(DecodeError::PacketsLost { count: lost });
        }

        (self.on_packet_rtp)(&self.format, packet);
    }
}

impl SessionFormat for ServerSessionFormat {
    fn payload_type(&self) -> u8 {
        self.format.payload_type()
    }

    fn start(&self) {
        self.receiver.start();
    }

    fn stop(&self) {
        self.receiver.stop();
    }

    fn read_rtp_udp(&self, packet: &RtpPacket<'_>, now: SystemTime) {
        self.read_rtp(packet, Some(now));
    }

    fn read_rtp_tcp(&self, packet: &RtpPacket<'_>) {
        self.read_rtp(packet, None);
    }

    fn rtcp_receiver(&self) -> &dyn RtcpReceiver {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{testing, unmarshal_rtcp, unmarshal_rtp};

    fn feed(stats: &RtcpReceiverStats, ssrc: u32, sequence: u16) -> u64 {
        let buf = testing::rtp_packet(96, ssrc, sequence);
        let packet = unmarshal_rtp(&buf).unwrap();
        stats.process_packet(&packet, None)
    }

    fn feed_sender_report(stats: &RtcpReceiverStats, ssrc: u32, ntp: u64, rtp_ts: u32) {
        let buf = testing::sender_report(ssrc, ntp, rtp_ts);
        let packets = unmarshal_rtcp(&buf).unwrap();
        match &packets[0] {
            rtcp_types::Packet::Sr(sr) => stats.process_sender_report(sr, SystemTime::UNIX_EPOCH),
            _ => panic!("expected sender report"),
        }
    }

    #[test]
    fn inactive_until_started() {
        let stats = RtcpReceiverStats::new(90000);
        assert_eq!(feed(&stats, 0xABCD, 1), 0);
        assert_eq!(stats.sender_ssrc(), None);
        assert_eq!(stats.packets_received(), 0);

        stats.start();
        feed(&stats, 0xABCD, 1);
        assert_eq!(stats.sender_ssrc(), Some(0xABCD));

        stats.stop();
        assert_eq!(stats.sender_ssrc(), None);
    }

    #[test]
    fn detects_sequence_gaps() {
        let stats = RtcpReceiverStats::new(90000);
        stats.start();
        assert_eq!(feed(&stats, 1, 10), 0);
        assert_eq!(feed(&stats, 1, 11), 0);
        assert_eq!(feed(&stats, 1, 15), 3);
        assert_eq!(stats.packets_lost(), 3);
        assert_eq!(stats.packets_received(), 3);
    }

    #[test]
    fn sequence_gap_across_wrap() {
        let stats = RtcpReceiverStats::new(90000);
        stats.start();
        feed(&stats, 1, u16::MAX - 1);
        assert_eq!(feed(&stats, 1, 1), 2);
    }

    #[test]
    fn reordered_and_duplicate_packets_are_not_losses() {
        let stats = RtcpReceiverStats::new(90000);
        stats.start();
        feed(&stats, 1, 100);
        assert_eq!(feed(&stats, 1, 100), 0);
        assert_eq!(feed(&stats, 1, 99), 0);
        assert_eq!(feed(&stats, 1, 101), 0);
        assert_eq!(stats.packets_lost(), 0);
    }

    #[test]
    fn ssrc_change_resets_tracking() {
        let stats = RtcpReceiverStats::new(90000);
        stats.start();
        feed(&stats, 1, 100);
        assert_eq!(feed(&stats, 2, 5000), 0);
        assert_eq!(stats.sender_ssrc(), Some(2));
        assert_eq!(feed(&stats, 2, 5001), 0);
    }

    #[test]
    fn ntp_conversion() {
        let ntp = (NTP_UNIX_OFFSET_SECS + 10) << 32 | 0x8000_0000;
        assert_eq!(
            ntp_to_system_time(ntp),
            Some(SystemTime::UNIX_EPOCH + Duration::from_millis(10_500))
        );
        assert_eq!(ntp_to_system_time(5 << 32), None);
    }

    #[test]
    fn rtp_timestamp_correlation() {
        let stats = RtcpReceiverStats::new(90000);
        stats.start();
        assert_eq!(stats.packet_ntp(0), None);

        let ntp = (NTP_UNIX_OFFSET_SECS + 100) << 32;
        feed_sender_report(&stats, 7, ntp, 90000);

        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(stats.packet_ntp(90000), Some(base));
        assert_eq!(stats.packet_ntp(180000), Some(base + Duration::from_secs(1)));
        assert_eq!(stats.packet_ntp(45000), Some(base - Duration::from_millis(500)));
        assert_eq!(
            stats.last_sender_report().map(|sr| sr.rtp_timestamp),
            Some(90000)
        );
    }

    #[test]
    fn format_reports_losses_and_forwards_packets() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let seen = forwarded.clone();

        let format = ServerSessionFormat::new(
            Format::new(96, "H264", 90000),
            Arc::new(move |e| sink.lock().push(e.to_string())),
        )
        .with_on_packet_rtp(Arc::new(move |format: &Format, packet: &RtpPacket<'_>| {
            seen.lock()
                .push((format.payload_type(), packet.sequence_number()));
        }));

        let first = testing::rtp_packet(96, 9, 1);
        let third = testing::rtp_packet(96, 9, 3);

        // ignored before start
        format.read_rtp_tcp(&unmarshal_rtp(&first).unwrap());
        assert!(forwarded.lock().is_empty());

        format.start();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        format.read_rtp_udp(&unmarshal_rtp(&first).unwrap(), now);
        format.read_rtp_tcp(&unmarshal_rtp(&third).unwrap());

        assert_eq!(*forwarded.lock(), vec![(96, 1), (96, 3)]);
        assert_eq!(*errors.lock(), vec!["1 RTP packets lost".to_string()]);
        assert_eq!(format.stats().last_packet_at(), Some(now));
        assert_eq!(format.rtcp_receiver().sender_ssrc(), Some(9));
    }
}
