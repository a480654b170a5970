//! Transport of a single media within a session.
//!
//! A [`SessionMedia`] binds one negotiated [`Media`] to the session's
//! transport. On [`start`](SessionMedia::start) it selects a [`WritePath`]
//! and registers its read callbacks:
//!
//! | Transport | Direction | Registration |
//! |-----------|-----------|--------------|
//! | UDP unicast | Play | RTCP listener only |
//! | UDP unicast | Record | firewall packets queued, then RTP + RTCP listeners |
//! | UDP multicast | any | none (write path only) |
//! | TCP | any | dispatcher channels `c` and `c + 1` |
//!
//! Inbound packets are validated here and routed by payload type (RTP) or
//! sender SSRC (RTCP Sender Reports) to the media's [`SessionFormat`]s.
//! Outbound packets are queued on the session's [`WriteQueue`](super::WriteQueue).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use rtcp_types::Packet;
use rtp_types::RtpPacket;

use crate::error::{DecodeError, Result, RtspError};
use crate::media::{Format, Media};
use crate::packet::{self, unmarshal_rtcp, unmarshal_rtp};
use crate::server::{UDP_MAX_PAYLOAD_SIZE, UdpListeners};
use crate::session::format::{OnPacketRtp, ServerSessionFormat, SessionFormat};
use crate::session::transport::{Direction, MediaSetup, Transport};
use crate::session::{OnDecodeError, SessionContext, TcpBinding};
use crate::transport::tcp::{INTERLEAVED_HEADER_SIZE, InterleavedFrame};
use crate::transport::{ReadFunc, TcpConnection};

/// Callback receiving every decoded inbound RTCP packet.
pub type OnPacketRtcp = Arc<dyn Fn(&Packet<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Rtp,
    Rtcp,
}

/// Outbound path selected once by [`SessionMedia::start`].
enum WritePath {
    Udp {
        listeners: UdpListeners,
        rtp_addr: SocketAddr,
        rtcp_addr: SocketAddr,
    },
    Tcp {
        connection: Arc<dyn TcpConnection>,
        rtp_channel: u8,
        write_timeout: Duration,
        /// Reused frame buffer; only the queue worker writes, one at a time.
        buffer: Mutex<Vec<u8>>,
    },
}

impl WritePath {
    fn write(&self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        match self {
            Self::Udp {
                listeners,
                rtp_addr,
                rtcp_addr,
            } => {
                let (listener, addr) = match kind {
                    PacketKind::Rtp => (&listeners.rtp, *rtp_addr),
                    PacketKind::Rtcp => (&listeners.rtcp, *rtcp_addr),
                };
                listener
                    .write(payload, addr)
                    .map_err(|e| RtspError::UdpSend {
                        addr,
                        source: Box::new(e),
                    })
            }
            Self::Tcp {
                connection,
                rtp_channel,
                write_timeout,
                buffer,
            } => {
                let channel = match kind {
                    PacketKind::Rtp => *rtp_channel,
                    PacketKind::Rtcp => *rtp_channel + 1,
                };
                connection.set_write_deadline(Instant::now() + *write_timeout)?;
                let mut buffer = buffer.lock();
                connection.write_interleaved_frame(&InterleavedFrame { channel, payload }, &mut buffer)
            }
        }
    }
}

type ReadHandler = fn(&SessionMedia, &[u8]);

/// One media of a session, bound to the session's transport.
pub struct SessionMedia {
    session: Arc<SessionContext>,
    media: Arc<Media>,
    setup: MediaSetup,
    /// Record only; ascending payload type.
    formats: BTreeMap<u8, Arc<dyn SessionFormat>>,
    on_packet_rtcp: OnPacketRtcp,
    write_path: OnceLock<WritePath>,
}

impl SessionMedia {
    /// Create the transport of `media` with the parameters agreed in SETUP.
    ///
    /// In record sessions every format of the media gets a
    /// [`ServerSessionFormat`]; play sessions route no RTP per format.
    pub fn new(session: &Arc<SessionContext>, media: Arc<Media>, setup: MediaSetup) -> Result<Self> {
        if !setup.matches(session.transport()) {
            return Err(RtspError::InvalidConfig(format!(
                "media setup does not match {} transport",
                session.transport()
            )));
        }

        let mut this = Self {
            session: session.clone(),
            media,
            setup,
            formats: BTreeMap::new(),
            on_packet_rtcp: Arc::new(|_: &Packet<'_>| {}),
            write_path: OnceLock::new(),
        };
        this.formats = this.default_formats(Arc::new(|_: &Format, _: &RtpPacket<'_>| {}));
        Ok(this)
    }

    /// Receive RTP of the default formats through `callback`.
    pub fn on_packet_rtp<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Format, &RtpPacket<'_>) + Send + Sync + 'static,
    {
        self.formats = self.default_formats(Arc::new(callback));
        self
    }

    /// Replace the per-format components. Ignored in play sessions.
    pub fn with_formats<I>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn SessionFormat>>,
    {
        if self.session.direction() == Direction::Play {
            tracing::debug!(session_id = %self.session.id(), "formats ignored while playing");
            return self;
        }
        self.formats = formats
            .into_iter()
            .map(|format| (format.payload_type(), format))
            .collect();
        self
    }

    /// Receive every decoded inbound RTCP packet. Must be set before start.
    pub fn on_packet_rtcp<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Packet<'_>) + Send + Sync + 'static,
    {
        self.on_packet_rtcp = Arc::new(callback);
        self
    }

    fn default_formats(&self, on_packet_rtp: OnPacketRtp) -> BTreeMap<u8, Arc<dyn SessionFormat>> {
        if self.session.direction() == Direction::Play {
            return BTreeMap::new();
        }

        let session = Arc::downgrade(&self.session);
        let on_decode_error: OnDecodeError = Arc::new(move |e| {
            if let Some(session) = session.upgrade() {
                session.on_decode_error(e);
            }
        });

        self.media
            .formats()
            .iter()
            .map(|format| {
                let component: Arc<dyn SessionFormat> = Arc::new(
                    ServerSessionFormat::new(format.clone(), on_decode_error.clone())
                        .with_on_packet_rtp(on_packet_rtp.clone()),
                );
                (format.payload_type(), component)
            })
            .collect()
    }

    pub fn media(&self) -> &Arc<Media> {
        &self.media
    }

    pub fn setup(&self) -> &MediaSetup {
        &self.setup
    }

    pub fn transport(&self) -> Transport {
        self.session.transport()
    }

    pub fn is_started(&self) -> bool {
        self.write_path.get().is_some()
    }

    /// Per-format component of `payload_type` (record only).
    pub fn format(&self, payload_type: u8) -> Option<&Arc<dyn SessionFormat>> {
        self.formats.get(&payload_type)
    }

    /// First format whose RTCP receiver knows `ssrc` as its sender.
    pub fn find_format_with_ssrc(&self, ssrc: u32) -> Option<&Arc<dyn SessionFormat>> {
        self.formats
            .values()
            .find(|format| format.rtcp_receiver().sender_ssrc() == Some(ssrc))
    }

    /// Select the write path and wire read callbacks into the shared
    /// listeners or the session's channel dispatcher.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_started() {
            return Err(RtspError::AlreadyStarted);
        }

        let path = self.select_write_path()?;

        // Receivers must exist before any packet can be routed to them.
        for format in self.formats.values() {
            format.start();
        }

        let path = self.write_path.get_or_init(|| path);
        let direction = self.session.direction();

        match path {
            WritePath::Udp { listeners, .. } => {
                // Multicast receivers join the group through the shared listener.
                if self.session.transport() == Transport::UdpUnicast {
                    let (rtp_port, rtcp_port) = self.read_ports();
                    let ip = self.session.author_ip();

                    match direction {
                        Direction::Play => {
                            // Players only send RTCP; outbound sender reports open their firewall.
                            listeners.rtcp.add_client(
                                ip,
                                rtcp_port,
                                self.read_func(Self::read_rtcp_udp_play),
                            );
                        }
                        Direction::Record => {
                            self.open_firewall();
                            listeners.rtp.add_client(
                                ip,
                                rtp_port,
                                self.read_func(Self::read_rtp_udp_record),
                            );
                            listeners.rtcp.add_client(
                                ip,
                                rtcp_port,
                                self.read_func(Self::read_rtcp_udp_record),
                            );
                        }
                    }
                }
            }
            WritePath::Tcp { rtp_channel, .. } => {
                let dispatcher = &self.tcp_binding()?.dispatcher;
                let (rtp, rtcp): (ReadHandler, ReadHandler) = match direction {
                    Direction::Play => (Self::read_rtp_tcp_play, Self::read_rtcp_tcp_play),
                    Direction::Record => (Self::read_rtp_tcp_record, Self::read_rtcp_tcp_record),
                };
                dispatcher.insert(*rtp_channel, self.read_func(rtp));
                dispatcher.insert(*rtp_channel + 1, self.read_func(rtcp));
            }
        }

        tracing::debug!(
            session_id = %self.session.id(),
            control = %self.media.control(),
            transport = %self.session.transport(),
            direction = ?direction,
            formats = self.formats.len(),
            "media started"
        );
        Ok(())
    }

    /// Undo the registrations of [`start`](Self::start) and stop every format.
    pub fn stop(&self) {
        match self.session.transport() {
            Transport::UdpUnicast => {
                if let Some(WritePath::Udp { listeners, .. }) = self.write_path.get() {
                    let (rtp_port, rtcp_port) = self.read_ports();
                    let ip = self.session.author_ip();
                    listeners.rtp.remove_client(ip, rtp_port);
                    listeners.rtcp.remove_client(ip, rtcp_port);
                }
            }
            Transport::UdpMulticast => {}
            Transport::Tcp => {
                if let (Some(binding), Some(channel)) = (self.session.tcp(), self.setup.rtp_channel()) {
                    binding.dispatcher.remove(channel);
                    binding.dispatcher.remove(channel + 1);
                }
            }
        }

        for format in self.formats.values() {
            format.stop();
        }

        tracing::debug!(
            session_id = %self.session.id(),
            control = %self.media.control(),
            "media stopped"
        );
    }

    /// Queue an RTP packet for sending.
    ///
    /// Returns [`RtspError::WriteQueueFull`] when the session's queue is
    /// saturated; the packet is dropped and the caller decides what next.
    /// [`RtspError::WriteQueueClosed`] means the session stopped sending.
    pub fn write_packet_rtp(self: &Arc<Self>, payload: Vec<u8>) -> Result<()> {
        self.write_packet(PacketKind::Rtp, payload)
    }

    /// Queue an RTCP packet for sending. See [`write_packet_rtp`](Self::write_packet_rtp).
    pub fn write_packet_rtcp(self: &Arc<Self>, payload: Vec<u8>) -> Result<()> {
        self.write_packet(PacketKind::Rtcp, payload)
    }

    fn write_packet(self: &Arc<Self>, kind: PacketKind, payload: Vec<u8>) -> Result<()> {
        if !self.is_started() {
            return Err(RtspError::NotStarted);
        }

        let len = payload.len();
        let media = Arc::downgrade(self);
        let task = move || match media.upgrade() {
            Some(media) => media.write_in_queue(kind, &payload),
            None => Ok(()),
        };
        let stats = self.session.stats();
        self.session
            .writer()
            .push_then(task, || stats.add_bytes_sent(len))
    }

    fn write_in_queue(&self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        self.write_path
            .get()
            .ok_or(RtspError::NotStarted)?
            .write(kind, payload)
    }

    /// Queue an empty RTP packet and an empty receiver report for the
    /// counterpart, so that NATs and firewalls let its packets back in.
    ///
    /// Queued before any listener registration; failures are only logged.
    fn open_firewall(self: &Arc<Self>) {
        let packets = packet::empty_rtp_packet()
            .and_then(|rtp| packet::empty_receiver_report().map(|rtcp| (rtp, rtcp)));

        let (rtp, rtcp) = match packets {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!(session_id = %self.session.id(), error = %e, "failed to build firewall packets");
                return;
            }
        };

        for (kind, payload) in [(PacketKind::Rtp, rtp), (PacketKind::Rtcp, rtcp)] {
            if let Err(e) = self.write_packet(kind, payload) {
                tracing::warn!(
                    session_id = %self.session.id(),
                    kind = ?kind,
                    error = %e,
                    "failed to queue firewall packet"
                );
            }
        }
    }

    fn select_write_path(&self) -> Result<WritePath> {
        let config = self.session.server().config();

        match self.setup {
            MediaSetup::Udp {
                rtp_write_addr,
                rtcp_write_addr,
                ..
            } => {
                let listeners = self
                    .session
                    .server()
                    .udp_listeners()
                    .ok_or(RtspError::NotStarted)?;
                Ok(WritePath::Udp {
                    listeners,
                    rtp_addr: rtp_write_addr,
                    rtcp_addr: rtcp_write_addr,
                })
            }
            MediaSetup::Tcp { channel } => Ok(WritePath::Tcp {
                connection: self.tcp_binding()?.connection.clone(),
                rtp_channel: channel,
                write_timeout: config.write_timeout,
                buffer: Mutex::new(vec![0; config.max_packet_size + INTERLEAVED_HEADER_SIZE]),
            }),
        }
    }

    fn tcp_binding(&self) -> Result<&TcpBinding> {
        self.session.tcp().ok_or(RtspError::NotStarted)
    }

    fn read_ports(&self) -> (u16, u16) {
        match self.setup {
            MediaSetup::Udp {
                rtp_read_port,
                rtcp_read_port,
                ..
            } => (rtp_read_port, rtcp_read_port),
            MediaSetup::Tcp { .. } => (0, 0),
        }
    }

    /// Wrap a read handler into a callback that does not keep the media alive.
    fn read_func(self: &Arc<Self>, handler: ReadHandler) -> ReadFunc {
        let media = Arc::downgrade(self);
        Arc::new(move |payload: &[u8]| {
            if let Some(media) = media.upgrade() {
                handler(&media, payload);
            }
        })
    }

    fn now(&self) -> SystemTime {
        self.session.server().time_now()
    }

    fn read_rtcp_udp_play(&self, payload: &[u8]) {
        if let Some((packets, _)) = self.decode_rtcp_udp(payload) {
            for packet in &packets {
                (self.on_packet_rtcp)(packet);
            }
        }
    }

    fn read_rtp_udp_record(&self, payload: &[u8]) {
        self.session.stats().add_bytes_received(payload.len());

        if payload.len() == UDP_MAX_PAYLOAD_SIZE + 1 {
            self.session.on_decode_error(DecodeError::RtpPacketTooBigUdp);
            return;
        }

        let packet = match unmarshal_rtp(payload) {
            Ok(packet) => packet,
            Err(e) => {
                self.session.on_decode_error(e);
                return;
            }
        };

        let now = self.now();
        self.session.stats().touch_udp(now);

        let Some(format) = self.formats.get(&packet.payload_type()) else {
            self.session.on_decode_error(DecodeError::UnknownPayloadType {
                payload_type: packet.payload_type(),
            });
            return;
        };

        format.read_rtp_udp(&packet, now);
    }

    fn read_rtcp_udp_record(&self, payload: &[u8]) {
        if let Some((packets, now)) = self.decode_rtcp_udp(payload) {
            self.handle_rtcp_record(&packets, now);
        }
    }

    /// Shared front half of the UDP RTCP handlers.
    fn decode_rtcp_udp<'a>(&self, payload: &'a [u8]) -> Option<(Vec<Packet<'a>>, SystemTime)> {
        self.session.stats().add_bytes_received(payload.len());

        if payload.len() == UDP_MAX_PAYLOAD_SIZE + 1 {
            self.session.on_decode_error(DecodeError::RtcpPacketTooBigUdp);
            return None;
        }

        let packets = match unmarshal_rtcp(payload) {
            Ok(packets) => packets,
            Err(e) => {
                self.session.on_decode_error(e);
                return None;
            }
        };

        let now = self.now();
        self.session.stats().touch_udp(now);
        Some((packets, now))
    }

    fn read_rtp_tcp_play(&self, _payload: &[u8]) {}

    fn read_rtcp_tcp_play(&self, payload: &[u8]) {
        if let Some(packets) = self.decode_rtcp_tcp(payload) {
            for packet in &packets {
                (self.on_packet_rtcp)(packet);
            }
        }
    }

    fn read_rtp_tcp_record(&self, payload: &[u8]) {
        let packet = match unmarshal_rtp(payload) {
            Ok(packet) => packet,
            Err(e) => {
                self.session.on_decode_error(e);
                return;
            }
        };

        let Some(format) = self.formats.get(&packet.payload_type()) else {
            self.session.on_decode_error(DecodeError::UnknownPayloadType {
                payload_type: packet.payload_type(),
            });
            return;
        };

        format.read_rtp_tcp(&packet);
    }

    fn read_rtcp_tcp_record(&self, payload: &[u8]) {
        if let Some(packets) = self.decode_rtcp_tcp(payload) {
            let now = self.now();
            self.handle_rtcp_record(&packets, now);
        }
    }

    fn decode_rtcp_tcp<'a>(&self, payload: &'a [u8]) -> Option<Vec<Packet<'a>>> {
        if payload.len() > UDP_MAX_PAYLOAD_SIZE {
            self.session.on_decode_error(DecodeError::RtcpPacketTooBig {
                len: payload.len(),
                max: UDP_MAX_PAYLOAD_SIZE,
            });
            return None;
        }

        match unmarshal_rtcp(payload) {
            Ok(packets) => Some(packets),
            Err(e) => {
                self.session.on_decode_error(e);
                None
            }
        }
    }

    /// Feed Sender Reports to the format that knows their SSRC, then hand
    /// every packet to the RTCP callback.
    fn handle_rtcp_record(&self, packets: &[Packet<'_>], now: SystemTime) {
        for packet in packets {
            if let Packet::Sr(sr) = packet {
                match self.find_format_with_ssrc(sr.ssrc()) {
                    Some(format) => format.rtcp_receiver().process_sender_report(sr, now),
                    None => tracing::trace!(
                        session_id = %self.session.id(),
                        ssrc = sr.ssrc(),
                        "sender report for unknown SSRC"
                    ),
                }
            }

            (self.on_packet_rtcp)(packet);
        }
    }
}
