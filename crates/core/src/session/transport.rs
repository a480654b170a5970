use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, RtspError};

/// Delivery mechanism negotiated for a session during SETUP (RFC 2326 §12.39).
///
/// Fixed for the lifetime of a started media; switching requires tearing
/// the media down and creating a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `RTP/AVP;unicast;client_port=...`
    UdpUnicast,
    /// `RTP/AVP;multicast;...`
    UdpMulticast,
    /// `RTP/AVP/TCP;interleaved=...`
    Tcp,
}

impl Transport {
    pub fn is_udp(self) -> bool {
        matches!(self, Self::UdpUnicast | Self::UdpMulticast)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UdpUnicast => write!(f, "UDP"),
            Self::UdpMulticast => write!(f, "UDP-multicast"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

/// Direction of media in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server → client (PLAY).
    Play,
    /// Client → server (RECORD).
    Record,
}

/// Per-media transport parameters negotiated during SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSetup {
    /// UDP unicast or multicast.
    ///
    /// Read ports identify the counterpart's source ports on the shared
    /// listeners; write addresses are where outbound packets go.
    Udp {
        rtp_read_port: u16,
        rtcp_read_port: u16,
        rtp_write_addr: SocketAddr,
        rtcp_write_addr: SocketAddr,
    },
    /// Interleaved on the RTSP connection. RTCP always uses `channel + 1`.
    Tcp { channel: u8 },
}

impl MediaSetup {
    /// Unicast to a client that sends from and receives on the same ports.
    ///
    /// ```
    /// use rtsp_media::MediaSetup;
    ///
    /// let setup = MediaSetup::udp("10.0.0.5".parse().unwrap(), 5000, 5001);
    /// assert_eq!(setup.rtp_write_addr().unwrap().to_string(), "10.0.0.5:5000");
    /// ```
    pub fn udp(client_ip: IpAddr, client_rtp_port: u16, client_rtcp_port: u16) -> Self {
        Self::Udp {
            rtp_read_port: client_rtp_port,
            rtcp_read_port: client_rtcp_port,
            rtp_write_addr: SocketAddr::new(client_ip, client_rtp_port),
            rtcp_write_addr: SocketAddr::new(client_ip, client_rtcp_port),
        }
    }

    /// Multicast group `group:rtp_port` / `group:rtcp_port`.
    pub fn multicast(group: IpAddr, rtp_port: u16, rtcp_port: u16) -> Self {
        Self::udp(group, rtp_port, rtcp_port)
    }

    /// Interleaved channels `channel` (RTP) and `channel + 1` (RTCP).
    ///
    /// ```
    /// use rtsp_media::MediaSetup;
    ///
    /// assert_eq!(MediaSetup::tcp(4).unwrap().rtcp_channel(), Some(5));
    /// assert!(MediaSetup::tcp(255).is_err());
    /// ```
    pub fn tcp(channel: u8) -> Result<Self> {
        if channel == u8::MAX {
            return Err(RtspError::InvalidChannel(channel));
        }
        Ok(Self::Tcp { channel })
    }

    pub fn rtp_channel(&self) -> Option<u8> {
        match self {
            Self::Tcp { channel } => Some(*channel),
            Self::Udp { .. } => None,
        }
    }

    pub fn rtcp_channel(&self) -> Option<u8> {
        self.rtp_channel().map(|channel| channel + 1)
    }

    pub fn rtp_write_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Udp { rtp_write_addr, .. } => Some(*rtp_write_addr),
            Self::Tcp { .. } => None,
        }
    }

    pub fn rtcp_write_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Udp {
                rtcp_write_addr, ..
            } => Some(*rtcp_write_addr),
            Self::Tcp { .. } => None,
        }
    }

    /// Whether these parameters can be used with `transport`.
    pub fn matches(&self, transport: Transport) -> bool {
        match self {
            Self::Udp { .. } => transport.is_udp(),
            Self::Tcp { .. } => transport == Transport::Tcp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_setup_addresses() {
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        let setup = MediaSetup::udp(ip, 6000, 6001);
        assert_eq!(setup.rtp_write_addr(), Some(SocketAddr::new(ip, 6000)));
        assert_eq!(setup.rtcp_write_addr(), Some(SocketAddr::new(ip, 6001)));
        assert_eq!(setup.rtp_channel(), None);
        assert!(setup.matches(Transport::UdpUnicast));
        assert!(setup.matches(Transport::UdpMulticast));
        assert!(!setup.matches(Transport::Tcp));
    }

    #[test]
    fn rtcp_channel_follows_rtp_channel() {
        let setup = MediaSetup::tcp(0).unwrap();
        assert_eq!(setup.rtp_channel(), Some(0));
        assert_eq!(setup.rtcp_channel(), Some(1));
        assert!(setup.matches(Transport::Tcp));
        assert!(!setup.matches(Transport::UdpUnicast));
    }

    #[test]
    fn last_channel_has_no_rtcp_pair() {
        assert!(matches!(
            MediaSetup::tcp(255),
            Err(RtspError::InvalidChannel(255))
        ));
        assert!(MediaSetup::tcp(254).is_ok());
    }
}
