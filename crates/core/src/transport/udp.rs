use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::server::UDP_MAX_PAYLOAD_SIZE;
use crate::transport::ReadFunc;

/// How often the reader thread re-checks its `running` flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A process-wide UDP socket shared by many sessions.
///
/// Inbound datagrams are routed by their source address to the callback
/// registered with [`add_client`](Self::add_client).
pub trait UdpListener: Send + Sync {
    /// Route datagrams coming from `ip:port` to `callback`.
    fn add_client(&self, ip: IpAddr, port: u16, callback: ReadFunc);

    /// Stop routing datagrams from `ip:port`.
    ///
    /// A callback already running may still complete. Callbacks are
    /// allowed to call this method themselves.
    fn remove_client(&self, ip: IpAddr, port: u16);

    /// Send one datagram.
    fn write(&self, payload: &[u8], addr: SocketAddr) -> Result<()>;

    /// Release the socket. Further writes may fail.
    fn close(&self) {}
}

type ClientTable = Arc<RwLock<HashMap<SocketAddr, ReadFunc>>>;

/// [`UdpListener`] backed by a bound [`UdpSocket`] and a reader thread.
///
/// Callbacks run on the reader thread after the client table lock has been
/// released, so they may add or remove clients of the same listener.
pub struct SharedUdpListener {
    socket: Arc<UdpSocket>,
    clients: ClientTable,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SharedUdpListener {
    /// Bind `addr` and start reading.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        let socket = Arc::new(socket);

        let clients: ClientTable = Arc::new(RwLock::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let reader = {
            let socket = socket.clone();
            let clients = clients.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("rtsp-udp-listener".to_string())
                .spawn(move || read_loop(&socket, &clients, &running))?
        };

        Ok(Self {
            socket,
            clients,
            running,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

fn read_loop(socket: &UdpSocket, clients: &ClientTable, running: &AtomicBool) {
    // One extra byte so that truncated datagrams are recognizable.
    let mut buf = vec![0u8; UDP_MAX_PAYLOAD_SIZE + 1];

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, source)) => {
                // Released before the call: callbacks may deregister clients.
                let callback = clients.read().get(&source).cloned();
                match callback {
                    Some(callback) => callback(&buf[..n]),
                    None => tracing::trace!(%source, len = n, "datagram from unknown source"),
                }
            }
            Err(ref e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "UDP read error");
                    thread::sleep(READ_POLL_INTERVAL);
                }
            }
        }
    }
    tracing::debug!("UDP listener exited");
}

impl UdpListener for SharedUdpListener {
    fn add_client(&self, ip: IpAddr, port: u16, callback: ReadFunc) {
        let addr = SocketAddr::new(ip, port);
        self.clients.write().insert(addr, callback);
        tracing::debug!(client = %addr, "UDP client added");
    }

    fn remove_client(&self, ip: IpAddr, port: u16) {
        let addr = SocketAddr::new(ip, port);
        if self.clients.write().remove(&addr).is_some() {
            tracing::debug!(client = %addr, "UDP client removed");
        }
    }

    fn write(&self, payload: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket.send_to(payload, addr)?;
        Ok(())
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
    }
}

impl Drop for SharedUdpListener {
    fn drop(&mut self) {
        self.close();
    }
}
