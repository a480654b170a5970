//! Network plumbing beneath a session's media.
//!
//! RTP/RTCP reach a media over one of two physical paths:
//!
//! - **UDP** ([`udp`]): two process-wide sockets (RTP and RTCP) shared by
//!   every session. Inbound datagrams are routed by source `ip:port` to the
//!   callback a media registered for that client.
//!
//! - **TCP** ([`tcp`]): RTP/RTCP interleaved on the RTSP connection with
//!   `$` framing (RFC 2326 §10.12). Frames are routed by channel number
//!   through a per-session [`tcp::ChannelDispatcher`].

use std::sync::Arc;

pub mod tcp;
pub mod udp;

pub use tcp::{ChannelDispatcher, InterleavedConnection, InterleavedFrame, TcpConnection};
pub use udp::{SharedUdpListener, UdpListener};

/// Callback receiving the raw bytes of one datagram or interleaved frame.
pub type ReadFunc = Arc<dyn Fn(&[u8]) + Send + Sync>;
