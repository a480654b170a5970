//! RTP/RTCP (de)serialization glue.
//!
//! Parsing is delegated to [`rtp_types`] and [`rtcp_types`]; this module maps
//! their errors onto [`DecodeError`] and builds the two packets sent to open
//! a NAT/firewall return path in record mode.

use rtcp_types::*;
use rtp_types::{RtpPacket, RtpPacketBuilder};

use crate::error::{DecodeError, RtspError};

/// Size of the RTP fixed header (RFC 3550 §5.1) without CSRCs.
pub const RTP_HEADER_SIZE: usize = 12;

/// Parse a single RTP packet.
pub fn unmarshal_rtp(payload: &[u8]) -> std::result::Result<RtpPacket<'_>, DecodeError> {
    RtpPacket::parse(payload).map_err(DecodeError::InvalidRtp)
}

/// Parse a compound RTCP packet into its individual packets.
///
/// Fails as a whole if any packet of the compound is malformed.
pub fn unmarshal_rtcp(payload: &[u8]) -> std::result::Result<Vec<Packet<'_>>, DecodeError> {
    let compound = Compound::parse(payload).map_err(DecodeError::InvalidRtcp)?;
    compound
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DecodeError::InvalidRtcp)
}

/// Short name of an RTCP packet, for logging.
pub fn rtcp_packet_kind(packet: &Packet<'_>) -> &'static str {
    match packet {
        Packet::Sr(_) => "SR",
        Packet::Rr(_) => "RR",
        Packet::Sdes(_) => "SDES",
        Packet::Bye(_) => "BYE",
        Packet::App(_) => "APP",
        Packet::TransportFeedback(_) => "RTPFB",
        Packet::PayloadFeedback(_) => "PSFB",
        _ => "unknown",
    }
}

/// RTP packet with a bare version 2 header and no payload.
pub fn empty_rtp_packet() -> std::result::Result<Vec<u8>, RtspError> {
    let mut buf = [0u8; RTP_HEADER_SIZE];
    let len = RtpPacketBuilder::<&[u8], &[u8]>::new()
        .payload_type(0)
        .write_into(&mut buf)
        .map_err(RtspError::RtpWrite)?;
    Ok(buf[..len].to_vec())
}

/// RTCP receiver report without report blocks.
pub fn empty_receiver_report() -> std::result::Result<Vec<u8>, RtspError> {
    let rtcp = Compound::builder().add_packet(ReceiverReport::builder(0));
    let mut buf = vec![0; rtcp.calculate_size().map_err(RtspError::RtcpWrite)?];
    let len = rtcp.write_into(&mut buf).map_err(RtspError::RtcpWrite)?;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
pub(crate) mod testing {
    use rtcp_types::*;
    use rtp_types::RtpPacketBuilder;

    pub fn rtp_packet(payload_type: u8, ssrc: u32, sequence_number: u16) -> Vec<u8> {
        let payload = [0xAA; 16];
        let mut data = [0u8; 128];
        let len = RtpPacketBuilder::new()
            .payload_type(payload_type)
            .ssrc(ssrc)
            .sequence_number(sequence_number)
            .timestamp(u32::from(sequence_number) * 3000)
            .payload(payload.as_slice())
            .write_into(data.as_mut_slice())
            .unwrap();
        data[..len].to_vec()
    }

    pub fn sender_report(ssrc: u32, ntp_timestamp: u64, rtp_timestamp: u32) -> Vec<u8> {
        let mut data = vec![0; 128];
        let len = Compound::builder()
            .add_packet(
                SenderReport::builder(ssrc)
                    .ntp_timestamp(ntp_timestamp)
                    .rtp_timestamp(rtp_timestamp)
                    .packet_count(1)
                    .octet_count(16),
            )
            .write_into(&mut data)
            .unwrap();
        data.truncate(len);
        data
    }

    pub fn sender_and_receiver_report(ssrc: u32) -> Vec<u8> {
        let mut data = vec![0; 128];
        let len = Compound::builder()
            .add_packet(
                SenderReport::builder(ssrc)
                    .ntp_timestamp(1 << 32)
                    .rtp_timestamp(0),
            )
            .add_packet(ReceiverReport::builder(0x0101_0101))
            .write_into(&mut data)
            .unwrap();
        data.truncate(len);
        data
    }

    /// `count` back-to-back receiver reports without report blocks (8 bytes each).
    pub fn receiver_reports(count: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(count * 8);
        for _ in 0..count {
            data.extend_from_slice(&[0x80, 0xC9, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        }
        data
    }
}
