//! Per-media transport of server-side RTSP sessions.
//!
//! Wires each negotiated media to UDP unicast, UDP multicast or TCP
//! interleaved delivery, serializes outbound RTP/RTCP through the session's
//! write queue and validates inbound packets before routing them to the
//! per-format receivers.

pub mod error;
pub mod media;
pub mod packet;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{DecodeError, Result, RtspError};
pub use media::{Format, Media, MediaKind};
pub use server::{Server, ServerConfig, UDP_MAX_PAYLOAD_SIZE};
pub use session::format::{OnPacketRtp, RtcpReceiverStats};
pub use session::media::OnPacketRtcp;
pub use session::{
    Direction, MediaSetup, RtcpReceiver, ServerSession, ServerSessionFormat, SessionFormat,
    SessionMedia, SessionStats, Transport,
};
pub use transport::{ChannelDispatcher, InterleavedConnection, SharedUdpListener};
