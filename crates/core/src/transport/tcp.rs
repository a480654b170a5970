use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::transport::ReadFunc;

/// First byte of every interleaved frame.
pub const INTERLEAVED_FRAME_MAGIC: u8 = b'$';

/// `$`, channel, 16-bit length.
pub const INTERLEAVED_HEADER_SIZE: usize = 4;

/// One RTP/RTCP packet multiplexed on the RTSP connection (RFC 2326 §10.12).
///
/// ```text
/// +------+---------+----------------+--------------------+
/// | '$'  | channel | length (BE16)  | payload (length)   |
/// +------+---------+----------------+--------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedFrame<'a> {
    pub channel: u8,
    pub payload: &'a [u8],
}

impl InterleavedFrame<'_> {
    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        INTERLEAVED_HEADER_SIZE + self.payload.len()
    }

    /// Serialize into `buf`, returning the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if self.payload.len() > usize::from(u16::MAX) || len > buf.len() {
            return Err(RtspError::PacketTooBig {
                len: self.payload.len(),
                max: buf
                    .len()
                    .saturating_sub(INTERLEAVED_HEADER_SIZE)
                    .min(usize::from(u16::MAX)),
            });
        }

        buf[0] = INTERLEAVED_FRAME_MAGIC;
        buf[1] = self.channel;
        buf[2..4].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[INTERLEAVED_HEADER_SIZE..len].copy_from_slice(self.payload);
        Ok(len)
    }
}

/// Read one interleaved frame into `payload`, returning its channel.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub fn read_interleaved_frame<R: Read>(
    reader: &mut R,
    payload: &mut Vec<u8>,
) -> io::Result<Option<u8>> {
    let mut header = [0u8; INTERLEAVED_HEADER_SIZE];
    if reader.read(&mut header[..1])? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..])?;

    if header[0] != INTERLEAVED_FRAME_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected interleaved frame, got byte {:#04x}", header[0]),
        ));
    }

    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    payload.resize(len, 0);
    reader.read_exact(payload)?;
    Ok(Some(header[1]))
}

/// The session's RTSP connection as seen by the media write path.
pub trait TcpConnection: Send + Sync {
    /// Deadline for the next write.
    fn set_write_deadline(&self, deadline: Instant) -> Result<()>;

    /// Encode `frame` into `buf` and send it.
    fn write_interleaved_frame(&self, frame: &InterleavedFrame<'_>, buf: &mut [u8]) -> Result<()>;
}

/// [`TcpConnection`] over a [`TcpStream`].
pub struct InterleavedConnection {
    stream: Mutex<TcpStream>,
    deadline: Mutex<Option<Instant>>,
}

impl InterleavedConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            deadline: Mutex::new(None),
        }
    }

    /// Independent handle for the reading side.
    pub fn reader(&self) -> Result<TcpStream> {
        Ok(self.stream.lock().try_clone()?)
    }
}

impl TcpConnection for InterleavedConnection {
    fn set_write_deadline(&self, deadline: Instant) -> Result<()> {
        *self.deadline.lock() = Some(deadline);
        Ok(())
    }

    fn write_interleaved_frame(&self, frame: &InterleavedFrame<'_>, buf: &mut [u8]) -> Result<()> {
        let len = frame.encode_into(buf)?;

        let timeout = match *self.deadline.lock() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(RtspError::WriteTimeout);
                }
                Some(remaining)
            }
            None => None,
        };

        let mut stream = self.stream.lock();
        stream.set_write_timeout(timeout)?;
        stream.write_all(&buf[..len]).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RtspError::WriteTimeout,
            _ => RtspError::Io(e),
        })
    }
}

/// Channel number → callback table of one RTSP connection.
///
/// Like the UDP listeners, callbacks run without the table locked, so a
/// callback may [`remove`](Self::remove) channels, its own included.
#[derive(Default)]
pub struct ChannelDispatcher {
    callbacks: RwLock<HashMap<u8, ReadFunc>>,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: u8, callback: ReadFunc) {
        self.callbacks.write().insert(channel, callback);
        tracing::debug!(channel, "interleaved channel registered");
    }

    pub fn remove(&self, channel: u8) {
        if self.callbacks.write().remove(&channel).is_some() {
            tracing::debug!(channel, "interleaved channel removed");
        }
    }

    pub fn contains(&self, channel: u8) -> bool {
        self.callbacks.read().contains_key(&channel)
    }

    /// Hand `payload` to the callback of `channel`. Returns `false` if none.
    pub fn dispatch(&self, channel: u8, payload: &[u8]) -> bool {
        let callback = self.callbacks.read().get(&channel).cloned();
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => {
                tracing::trace!(channel, len = payload.len(), "frame for unknown channel");
                false
            }
        }
    }

    /// Read frames from `reader` and dispatch them until end of stream.
    pub fn run<R: Read>(&self, reader: &mut R) -> io::Result<()> {
        let mut payload = Vec::new();
        while let Some(channel) = read_interleaved_frame(reader, &mut payload)? {
            self.dispatch(channel, &payload);
        }
        Ok(())
    }
}
