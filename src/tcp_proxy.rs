//! Localhost TCP listener that terminates proxy-side connections opened by
//! the session manager and surfaces their bytes as `(conn_id, chunk)` events.
//!
//! Grounded on the accept-loop / puller-registry discipline described for the
//! engine's proxies: the registry lock is held only across map operations,
//! never across a socket call, and a connection's `finished` flag is set from
//! inside its own puller thread (which therefore must never try to join
//! itself — joining happens later, from the accept thread, on a disjoint
//! connection).

use crate::logger::{self, BreadcrumbFlags};
use crate::socket_puller::{DataHandler, SocketPuller};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

const LISTEN_BACKLOG: u32 = 16;

/// One piece of data pulled from a proxy connection.
pub struct DataPiece<'a> {
    pub data: Option<&'a [u8]>,
    pub bytes_so_far: usize,
}

pub trait TcpProxyHandler: Send + Sync + 'static {
    /// Called once per accepted socket, before its puller starts reading —
    /// the implementation may write a canned handshake reply here.
    fn on_new_connection(&self, conn_id: u32, stream: &TcpStream);
    /// Called for every chunk read from an accepted connection, and once
    /// more with `data: None` to signal EOS.
    fn on_data(&self, conn_id: u32, piece: DataPiece<'_>);
}

struct PullerEntry {
    puller: SocketPuller,
    finished: Arc<AtomicBool>,
}

struct Registry {
    pullers: HashMap<u32, PullerEntry>,
}

pub struct TcpProxy {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    registry: Arc<Mutex<Registry>>,
}

impl TcpProxy {
    pub fn bind(port: u16, handler: Arc<dyn TcpProxyHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(false)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(Mutex::new(Registry {
            pullers: HashMap::new(),
        }));
        let conn_ids = Arc::new(AtomicU32::new(0));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_registry = Arc::clone(&registry);
        let accept_thread = thread::Builder::new()
            .name("tcp-proxy-accept".into())
            .spawn(move || accept_loop(listener, handler, thread_registry, conn_ids, thread_shutdown))
            .expect("spawn tcp proxy accept thread");

        Ok(Self {
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Writes back to the connection; `buf == None` requests a graceful close.
    pub fn send_response(&self, conn_id: u32, buf: Option<&[u8]>) {
        let registry = self.registry.lock();
        if let Some(entry) = registry.pullers.get(&conn_id) {
            match buf {
                Some(bytes) => entry.puller.send_response(bytes),
                None => entry.puller.close(),
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Connect to unblock `accept()`.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        let mut registry = self.registry.lock();
        for (_, mut entry) in registry.pullers.drain() {
            entry.puller.shutdown();
        }
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn TcpProxyHandler>,
    registry: Arc<Mutex<Registry>>,
    conn_ids: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
) {
    let _ = LISTEN_BACKLOG; // documented intent; std's TcpListener fixes its own backlog.
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let conn_id = conn_ids.fetch_add(1, Ordering::SeqCst) + 1;
                on_new_tcp_client(conn_id, stream, &handler, &registry);
                reap_finished(&registry, false);
            }
            Err(error) => {
                logger::debug(format!("tcp_proxy: accept failed: {error}"));
                break;
            }
        }
    }
    reap_finished(&registry, true);
}

fn on_new_tcp_client(
    conn_id: u32,
    stream: TcpStream,
    handler: &Arc<dyn TcpProxyHandler>,
    registry: &Arc<Mutex<Registry>>,
) {
    struct Forwarding {
        conn_id: u32,
        handler: Arc<dyn TcpProxyHandler>,
        finished: Arc<AtomicBool>,
    }
    impl DataHandler for Forwarding {
        fn on_data(&self, data: Option<&[u8]>, bytes_so_far: usize) {
            let is_terminal = data.is_none() || data.map(<[u8]>::is_empty).unwrap_or(false);
            self.handler.on_data(
                self.conn_id,
                DataPiece {
                    data,
                    bytes_so_far,
                },
            );
            if is_terminal {
                self.finished.store(true, Ordering::SeqCst);
            }
        }
    }

    let finished = Arc::new(AtomicBool::new(false));
    let mut puller = SocketPuller::new(
        stream.try_clone().expect("clone accepted socket"),
        Forwarding {
            conn_id,
            handler: Arc::clone(handler),
            finished: Arc::clone(&finished),
        },
    );

    handler.on_new_connection(conn_id, &stream);
    puller.start();

    let mut registry = registry.lock();
    registry.pullers.insert(conn_id, PullerEntry { puller, finished });
    logger::breadcrumb(BreadcrumbFlags::PROXY, format!("tcp_proxy: new connection id={conn_id}"));
}

fn reap_finished(registry: &Arc<Mutex<Registry>>, force: bool) {
    if force {
        let drained: Vec<(u32, PullerEntry)> = {
            let mut registry = registry.lock();
            registry.pullers.drain().collect()
        };
        for (_, mut entry) in drained {
            entry.puller.shutdown();
        }
        return;
    }

    let finished_ids: Vec<u32> = {
        let registry = registry.lock();
        registry
            .pullers
            .iter()
            .filter(|(_, entry)| entry.finished.load(Ordering::SeqCst))
            .map(|(id, _)| *id)
            .collect()
    };
    for id in finished_ids {
        let entry = {
            let mut registry = registry.lock();
            registry.pullers.remove(&id)
        };
        if let Some(mut entry) = entry {
            entry.puller.shutdown();
        }
    }
}

#[cfg(test)]
mod tests;
