//! Localhost UDP listener that terminates proxy-side datagrams and tracks
//! where each reply must be sent back to.
//!
//! Grounded on the receive-loop / return-address-table discipline used for
//! the engine's UDP proxy: every inbound datagram gets a fresh monotonic id,
//! is handed to the caller's handler, and only then has its source address
//! recorded — the handler never needs to know the address to process the
//! datagram. Stale return-address entries are purged periodically since a
//! reply that never arrives should not pin memory forever.

use crate::logger::{self, BreadcrumbFlags};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const DATAGRAM_BUFFER_BYTES: usize = 64 * 1024;
const RETURN_ADDRESS_TTL: Duration = Duration::from_secs(120);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub trait UdpProxyHandler: Send + Sync + 'static {
    fn on_datagram(&self, datagram_id: u64, datagram: &[u8]);
}

struct ReturnAddress {
    addr: SocketAddr,
    recorded_at: Instant,
}

struct Registry {
    return_addresses: HashMap<u64, ReturnAddress>,
}

pub struct UdpProxy {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    recv_thread: Option<JoinHandle<()>>,
    sweep_thread: Option<JoinHandle<()>>,
    registry: Arc<Mutex<Registry>>,
}

impl UdpProxy {
    pub fn bind(port: u16, handler: Arc<dyn UdpProxyHandler>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(("127.0.0.1", port))?);
        let local_addr = socket.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(Mutex::new(Registry {
            return_addresses: HashMap::new(),
        }));
        let datagram_ids = Arc::new(AtomicU64::new(0));

        let recv_socket = Arc::clone(&socket);
        let recv_registry = Arc::clone(&registry);
        let recv_shutdown = Arc::clone(&shutdown);
        let recv_thread = thread::Builder::new()
            .name("udp-proxy-recv".into())
            .spawn(move || {
                recv_loop(recv_socket, handler, recv_registry, datagram_ids, recv_shutdown)
            })
            .expect("spawn udp proxy recv thread");

        let sweep_registry = Arc::clone(&registry);
        let sweep_shutdown = Arc::clone(&shutdown);
        let sweep_thread = thread::Builder::new()
            .name("udp-proxy-sweep".into())
            .spawn(move || sweep_loop(sweep_registry, sweep_shutdown))
            .expect("spawn udp proxy sweep thread");

        Ok(Self {
            socket,
            local_addr,
            shutdown,
            recv_thread: Some(recv_thread),
            sweep_thread: Some(sweep_thread),
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends `buf` back to the address that produced `datagram_id`, consuming
    /// the return-address entry. No-op (logged) if the id is unknown or expired.
    pub fn send_reply(&self, datagram_id: u64, buf: &[u8]) {
        let addr = {
            let mut registry = self.registry.lock();
            registry.return_addresses.remove(&datagram_id).map(|entry| entry.addr)
        };
        match addr {
            Some(addr) => {
                if let Err(error) = self.socket.send_to(buf, addr) {
                    logger::error(format!("udp_proxy: send_reply to {addr} failed: {error}"));
                }
            }
            None => {
                logger::debug(format!(
                    "udp_proxy: send_reply for unknown or expired datagram_id={datagram_id}"
                ));
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock recv_from with a zero-length datagram to self.
        let _ = self.socket.send_to(&[], self.local_addr);
        if let Some(thread) = self.recv_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.sweep_thread.take() {
            let _ = thread.join();
        }
        self.registry.lock().return_addresses.clear();
    }
}

impl Drop for UdpProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recv_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn UdpProxyHandler>,
    registry: Arc<Mutex<Registry>>,
    datagram_ids: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER_BYTES];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let datagram_id = datagram_ids.fetch_add(1, Ordering::SeqCst) + 1;
                handler.on_datagram(datagram_id, &buf[..n]);
                registry.lock().return_addresses.insert(
                    datagram_id,
                    ReturnAddress {
                        addr,
                        recorded_at: Instant::now(),
                    },
                );
                logger::breadcrumb(
                    BreadcrumbFlags::PROXY,
                    format!("udp_proxy: datagram id={datagram_id} bytes={n}"),
                );
            }
            Err(error) => {
                if !shutdown.load(Ordering::SeqCst) {
                    logger::error(format!("udp_proxy: recv_from failed: {error}"));
                }
                return;
            }
        }
    }
}

fn sweep_loop(registry: Arc<Mutex<Registry>>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(SWEEP_INTERVAL);
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        purge_stale(&registry, RETURN_ADDRESS_TTL, Instant::now());
    }
}

fn purge_stale(registry: &Mutex<Registry>, ttl: Duration, now: Instant) {
    let mut registry = registry.lock();
    let before = registry.return_addresses.len();
    registry
        .return_addresses
        .retain(|_, entry| now.duration_since(entry.recorded_at) < ttl);
    let purged = before - registry.return_addresses.len();
    drop(registry);
    if purged > 0 {
        logger::debug(format!("udp_proxy: purged {purged} stale return addresses"));
    }
}

#[cfg(test)]
mod tests;
