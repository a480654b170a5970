//! Server-side RTSP sessions and their media transports.
//!
//! A session is created during SETUP and ends with TEARDOWN or when its
//! connection drops. This module holds the part of the session a media
//! transport depends on:
//!
//! - the negotiated [`Transport`] and [`Direction`],
//! - a single [`WriteQueue`] serializing all outbound RTP/RTCP,
//! - shared [`SessionStats`] counters,
//! - the interleaved connection and its [`ChannelDispatcher`] (TCP only),
//! - the decode-error callback.
//!
//! ## Lifecycle
//!
//! ```text
//! SETUP (per media)  -> SessionMedia::new + ServerSession::add_media
//! PLAY / RECORD      -> ServerSession::start
//! TEARDOWN           -> ServerSession::stop
//! ```

pub mod format;
pub mod media;
pub mod transport;
pub mod writer;

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{DecodeError, Result, RtspError};
use crate::server::Server;
use crate::transport::{ChannelDispatcher, TcpConnection};
pub use format::{RtcpReceiver, ServerSessionFormat, SessionFormat};
pub use media::SessionMedia;
pub use transport::{Direction, MediaSetup, Transport};
pub use writer::WriteQueue;

/// Callback receiving inbound packet problems.
pub type OnDecodeError = Arc<dyn Fn(DecodeError) + Send + Sync>;

/// Callback receiving failures of queued writes.
pub type OnWriteError = Arc<dyn Fn(RtspError) + Send + Sync>;

/// Traffic counters shared by every media of a session.
///
/// Only ever incremented. Injected at construction so several sessions (or
/// tests) can observe the same handle.
#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    udp_last_packet_time: AtomicI64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Unix time (seconds) of the last valid UDP packet, 0 if none yet.
    ///
    /// Used by the owner to detect idle UDP sessions.
    pub fn udp_last_packet_time(&self) -> i64 {
        self.udp_last_packet_time.load(Ordering::SeqCst)
    }

    pub(crate) fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::SeqCst);
    }

    pub(crate) fn add_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::SeqCst);
    }

    pub(crate) fn touch_udp(&self, now: SystemTime) {
        let secs = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
        self.udp_last_packet_time.store(secs, Ordering::SeqCst);
    }
}

/// Interleaved connection of a TCP session.
#[derive(Clone)]
pub struct TcpBinding {
    pub connection: Arc<dyn TcpConnection>,
    pub dispatcher: Arc<ChannelDispatcher>,
}

/// The state of a session that its medias share.
pub struct SessionContext {
    id: String,
    author_ip: IpAddr,
    direction: Direction,
    transport: Transport,
    server: Arc<Server>,
    writer: WriteQueue,
    stats: Arc<SessionStats>,
    tcp: Option<TcpBinding>,
    on_decode_error: OnDecodeError,
}

impl SessionContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// IP address of the client that created the session.
    pub fn author_ip(&self) -> IpAddr {
        self.author_ip
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn writer(&self) -> &WriteQueue {
        &self.writer
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn tcp(&self) -> Option<&TcpBinding> {
        self.tcp.as_ref()
    }

    /// Report a problem with one inbound packet. The packet is dropped.
    pub fn on_decode_error(&self, error: DecodeError) {
        tracing::warn!(session_id = %self.id, error = %error, "decode error");
        (self.on_decode_error)(error);
    }
}

/// Builder for [`ServerSession`].
pub struct ServerSessionBuilder {
    server: Arc<Server>,
    author_ip: IpAddr,
    direction: Direction,
    transport: Transport,
    stats: Option<Arc<SessionStats>>,
    tcp: Option<TcpBinding>,
    on_decode_error: Option<OnDecodeError>,
    on_write_error: Option<OnWriteError>,
}

impl ServerSessionBuilder {
    /// Share counters with the caller.
    pub fn stats(mut self, stats: Arc<SessionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Interleaved connection; required for [`Transport::Tcp`].
    pub fn tcp(
        mut self,
        connection: Arc<dyn TcpConnection>,
        dispatcher: Arc<ChannelDispatcher>,
    ) -> Self {
        self.tcp = Some(TcpBinding {
            connection,
            dispatcher,
        });
        self
    }

    pub fn on_decode_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(DecodeError) + Send + Sync + 'static,
    {
        self.on_decode_error = Some(Arc::new(callback));
        self
    }

    pub fn on_write_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(RtspError) + Send + Sync + 'static,
    {
        self.on_write_error = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<ServerSession> {
        if self.transport == Transport::Tcp && self.tcp.is_none() {
            return Err(RtspError::InvalidConfig(
                "TCP transport requires an interleaved connection".to_string(),
            ));
        }

        let id = format!("{:016X}", rand::rng().random::<u64>());
        let context = SessionContext {
            id,
            author_ip: self.author_ip,
            direction: self.direction,
            transport: self.transport,
            writer: WriteQueue::new(self.server.config().write_queue_size),
            server: self.server,
            stats: self.stats.unwrap_or_default(),
            tcp: self.tcp,
            on_decode_error: self.on_decode_error.unwrap_or_else(|| Arc::new(|_: DecodeError| {})),
        };

        tracing::debug!(
            session_id = %context.id,
            transport = %context.transport,
            direction = ?context.direction,
            "session created"
        );

        Ok(ServerSession {
            context: Arc::new(context),
            on_write_error: self.on_write_error.unwrap_or_else(|| Arc::new(|_: RtspError| {})),
            medias: Mutex::new(Vec::new()),
        })
    }
}

/// A server-side session owning one [`SessionMedia`] per set-up media.
pub struct ServerSession {
    context: Arc<SessionContext>,
    on_write_error: OnWriteError,
    /// Also serializes start/stop against each other.
    medias: Mutex<Vec<Arc<SessionMedia>>>,
}

impl ServerSession {
    pub fn builder(
        server: Arc<Server>,
        author_ip: IpAddr,
        direction: Direction,
        transport: Transport,
    ) -> ServerSessionBuilder {
        ServerSessionBuilder {
            server,
            author_ip,
            direction,
            transport,
            stats: None,
            tcp: None,
            on_decode_error: None,
            on_write_error: None,
        }
    }

    pub fn id(&self) -> &str {
        self.context.id()
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        self.context.stats()
    }

    /// Attach a media created with [`SessionMedia::new`].
    pub fn add_media(&self, media: SessionMedia) -> Arc<SessionMedia> {
        let media = Arc::new(media);
        self.medias.lock().push(media.clone());
        media
    }

    pub fn medias(&self) -> Vec<Arc<SessionMedia>> {
        self.medias.lock().clone()
    }

    /// Start the write queue and every media.
    ///
    /// Holds the media lock for the whole registration so that no stop can
    /// interleave with it.
    pub fn start(&self) -> Result<()> {
        let medias = self.medias.lock();

        let on_write_error = self.on_write_error.clone();
        self.context
            .writer
            .start(move |e| on_write_error(e))?;

        for media in medias.iter() {
            media.start()?;
        }

        tracing::info!(
            session_id = %self.context.id,
            medias = medias.len(),
            transport = %self.context.transport,
            "session started"
        );
        Ok(())
    }

    /// Stop every media, then drain and stop the write queue.
    pub fn stop(&self) {
        let medias = self.medias.lock();
        for media in medias.iter() {
            media.stop();
        }
        self.context.writer.stop();

        tracing::info!(
            session_id = %self.context.id,
            bytes_sent = self.stats().bytes_sent(),
            bytes_received = self.stats().bytes_received(),
            "session stopped"
        );
    }
}
