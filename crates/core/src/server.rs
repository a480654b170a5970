use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::error::{Result, RtspError};
use crate::transport::udp::{SharedUdpListener, UdpListener};

/// Largest UDP payload read or accepted by the server.
///
/// Ethernet MTU (1500) minus IPv4 (20) and UDP (8) headers. The shared
/// listeners read into a buffer one byte larger, so a datagram of exactly
/// `UDP_MAX_PAYLOAD_SIZE + 1` bytes means the original was truncated.
pub const UDP_MAX_PAYLOAD_SIZE: usize = 1472;

/// Server-level configuration shared by every session.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address of the shared RTP listener. Enables UDP transports.
    pub udp_rtp_address: Option<SocketAddr>,
    /// Local address of the shared RTCP listener (RTP port + 1).
    pub udp_rtcp_address: Option<SocketAddr>,
    /// Maximum size of an outbound packet; sizes the interleaved write buffer.
    pub max_packet_size: usize,
    /// Deadline applied to every interleaved TCP write.
    pub write_timeout: Duration,
    /// Capacity of each session's write queue.
    pub write_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_rtp_address: None,
            udp_rtcp_address: None,
            max_packet_size: UDP_MAX_PAYLOAD_SIZE,
            write_timeout: Duration::from_secs(10),
            write_queue_size: 256,
        }
    }
}

impl ServerConfig {
    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        if self.write_queue_size == 0 {
            return Err(RtspError::InvalidConfig(
                "write_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(RtspError::InvalidConfig(
                "max_packet_size must be greater than zero".to_string(),
            ));
        }

        match (self.udp_rtp_address, self.udp_rtcp_address) {
            (None, None) => Ok(()),
            (Some(rtp), Some(rtcp)) => {
                // RFC 3550 §11: RTP on an even port, RTCP on the next one.
                if rtp.port() % 2 != 0 {
                    return Err(RtspError::InvalidConfig(
                        "RTP port must be even".to_string(),
                    ));
                }
                if u32::from(rtcp.port()) != u32::from(rtp.port()) + 1 {
                    return Err(RtspError::InvalidConfig(
                        "RTP and RTCP ports must be consecutive".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(RtspError::InvalidConfig(
                "RTP and RTCP addresses must be set together".to_string(),
            )),
        }
    }
}

/// Source of the current wall-clock time.
pub type TimeNow = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// The pair of process-wide UDP listeners.
#[derive(Clone)]
pub struct UdpListeners {
    pub rtp: Arc<dyn UdpListener>,
    pub rtcp: Arc<dyn UdpListener>,
}

/// Server context shared by sessions.
///
/// Owns the configuration, the shared RTP/RTCP listeners and the clock
/// used for packet timestamps.
pub struct Server {
    config: ServerConfig,
    listeners: RwLock<Option<UdpListeners>>,
    time_now: TimeNow,
    running: AtomicBool,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            listeners: RwLock::new(None),
            time_now: Arc::new(SystemTime::now),
            running: AtomicBool::new(false),
        }
    }

    /// Use already bound listeners instead of binding them in [`start`](Self::start).
    pub fn with_udp_listeners(
        self,
        rtp: Arc<dyn UdpListener>,
        rtcp: Arc<dyn UdpListener>,
    ) -> Self {
        *self.listeners.write() = Some(UdpListeners { rtp, rtcp });
        self
    }

    /// Replace the wall clock (tests use a fixed time).
    pub fn with_clock<F>(mut self, time_now: F) -> Self
    where
        F: Fn() -> SystemTime + Send + Sync + 'static,
    {
        self.time_now = Arc::new(time_now);
        self
    }

    /// Validate the configuration and bind the shared UDP listeners.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyStarted);
        }

        self.config.validate()?;

        let mut listeners = self.listeners.write();
        if listeners.is_none() {
            if let (Some(rtp_addr), Some(rtcp_addr)) =
                (self.config.udp_rtp_address, self.config.udp_rtcp_address)
            {
                let rtp = SharedUdpListener::bind(rtp_addr)?;
                let rtcp = SharedUdpListener::bind(rtcp_addr)?;
                tracing::info!(rtp = %rtp_addr, rtcp = %rtcp_addr, "UDP listeners bound");
                *listeners = Some(UdpListeners {
                    rtp: Arc::new(rtp),
                    rtcp: Arc::new(rtcp),
                });
            }
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the shared listeners.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(listeners) = self.listeners.write().take() {
            listeners.rtp.close();
            listeners.rtcp.close();
        }
        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The shared listeners, if UDP is enabled.
    pub fn udp_listeners(&self) -> Option<UdpListeners> {
        self.listeners.read().clone()
    }

    pub fn time_now(&self) -> SystemTime {
        (self.time_now)()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_config(rtp: u16, rtcp: u16) -> ServerConfig {
        ServerConfig {
            udp_rtp_address: Some(SocketAddr::from(([127, 0, 0, 1], rtp))),
            udp_rtcp_address: Some(SocketAddr::from(([127, 0, 0, 1], rtcp))),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn odd_rtp_port_rejected() {
        let err = udp_config(8001, 8002).validate().unwrap_err();
        assert!(matches!(err, RtspError::InvalidConfig(_)));
    }

    #[test]
    fn non_consecutive_ports_rejected() {
        let err = udp_config(8000, 8004).validate().unwrap_err();
        assert!(matches!(err, RtspError::InvalidConfig(_)));
    }

    #[test]
    fn single_address_rejected() {
        let config = ServerConfig {
            udp_rtp_address: Some(SocketAddr::from(([127, 0, 0, 1], 8000))),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_queue_rejected() {
        let config = ServerConfig {
            write_queue_size: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn start_without_udp() {
        let server = Server::new();
        server.start().unwrap();
        assert!(server.is_running());
        assert!(server.udp_listeners().is_none());
        assert!(matches!(server.start(), Err(RtspError::AlreadyStarted)));
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn fixed_clock() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        let server = Server::new().with_clock(move || at);
        assert_eq!(server.time_now(), at);
    }
}
