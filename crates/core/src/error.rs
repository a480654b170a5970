//! Error types for the session media transport.

/// Errors returned by media transport operations.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Write path**: [`WriteQueueFull`](Self::WriteQueueFull) is back-pressure,
///   [`WriteQueueClosed`](Self::WriteQueueClosed) means nothing will be sent
///   anymore. [`WriteTimeout`](Self::WriteTimeout), [`Io`](Self::Io) and
///   [`UdpSend`](Self::UdpSend) come out of the write queue's error path.
/// - **Lifecycle**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyStarted`](Self::AlreadyStarted).
/// - **Setup**: [`InvalidChannel`](Self::InvalidChannel),
///   [`InvalidConfig`](Self::InvalidConfig).
///
/// Inbound packet problems are never returned from here; they are reported
/// through the session's decode-error callback as [`DecodeError`].
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session's write queue is saturated; the packet was dropped.
    #[error("write queue is full")]
    WriteQueueFull,

    /// The write queue was stopped, or its worker exited after a failure.
    #[error("write queue is closed")]
    WriteQueueClosed,

    /// A datagram could not be sent. Later datagrams may still succeed.
    #[error("UDP send to {addr} failed: {source}")]
    UdpSend {
        addr: std::net::SocketAddr,
        #[source]
        source: Box<RtspError>,
    },

    /// A TCP write did not complete before its deadline.
    #[error("write deadline exceeded")]
    WriteTimeout,

    /// The media (or the server) has not been started yet.
    #[error("not started")]
    NotStarted,

    /// `start()` was called twice.
    #[error("already started")]
    AlreadyStarted,

    /// Interleaved RTP channel has no room for its RTCP channel (`c + 1`).
    #[error("invalid interleaved channel: {0}")]
    InvalidChannel(u8),

    /// Rejected server configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Outbound frame does not fit into the TCP write buffer.
    #[error("packet is too big ({len} bytes, max {max})")]
    PacketTooBig { len: usize, max: usize },

    #[error("failed to write RTP packet: {0:?}")]
    RtpWrite(rtp_types::RtpWriteError),

    #[error("failed to write RTCP packet: {0:?}")]
    RtcpWrite(rtcp_types::RtcpWriteError),
}

impl RtspError {
    /// Whether a queued write failing with this error ends the write queue.
    ///
    /// Lost datagrams are tolerated; a broken or stalled TCP connection is not.
    pub fn stops_writer(&self) -> bool {
        !matches!(self, Self::UdpSend { .. })
    }
}

/// Problems with a single inbound packet.
///
/// Reported exactly once to the owning session; the packet is dropped and
/// processing of subsequent packets continues.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// UDP datagram hit the listener's sentinel length and was truncated.
    #[error("RTP packet is too big to be read with UDP")]
    RtpPacketTooBigUdp,

    #[error("RTCP packet is too big to be read with UDP")]
    RtcpPacketTooBigUdp,

    /// Interleaved RTCP frame larger than the UDP payload ceiling.
    #[error("RTCP packet size ({len}) is greater than maximum allowed ({max})")]
    RtcpPacketTooBig { len: usize, max: usize },

    #[error("invalid RTP packet: {0:?}")]
    InvalidRtp(rtp_types::RtpParseError),

    #[error("invalid RTCP packet: {0:?}")]
    InvalidRtcp(rtcp_types::RtcpParseError),

    /// RTP payload type that no negotiated format carries.
    #[error("received RTP packet with unknown payload type: {payload_type}")]
    UnknownPayloadType { payload_type: u8 },

    /// Sequence gap detected by a per-format receiver.
    #[error("{count} RTP packets lost")]
    PacketsLost { count: u64 },
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
