//! The Mobile Bridge Engine: the component that wires the session manager,
//! the two local proxies, and the transport manager together and exposes
//! the crate's lifecycle API to the embedding application.
//!
//! The "engine executor" role — serializing every public mutator and every
//! transport-manager notification — is realized here as a single
//! `parking_lot::Mutex<Option<Running>>`: every public method takes that
//! lock for its whole body, so two calls can never interleave their effects
//! on engine state, and the lock itself is the serialization point rather
//! than a dedicated thread with a task queue. `TransportManager` already
//! does its own reselection under its own "transports" mutex, so nothing
//! here needs to re-synchronize that part.

use crate::config::{Config, ConfigError};
use crate::host::{EngineListener, Host};
use crate::logger::{self, BreadcrumbFlags};
use crate::session::SessionManager;
use crate::tcp_proxy::{DataPiece, TcpProxy, TcpProxyHandler};
use crate::transport_loop::default_backoff;
use crate::transport_manager::TransportManager;
use crate::udp_proxy::{UdpProxy, UdpProxyHandler};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::io::Write;
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind tcp proxy: {0}")]
    TcpProxyBind(#[source] std::io::Error),
    #[error("failed to bind udp proxy: {0}")]
    UdpProxyBind(#[source] std::io::Error),
}

/// Bridges the two local proxies to the transport manager: the upstream
/// data flow where a proxy writes to the transport manager. Constructed
/// before the transport manager exists (the proxies are bound first, since
/// the transport manager needs their `Arc`s), then wired to it via
/// [`ProxyBridge::install`] once it does.
struct ProxyBridge {
    transport_manager: OnceCell<Arc<TransportManager>>,
}

impl ProxyBridge {
    fn new() -> Self {
        Self {
            transport_manager: OnceCell::new(),
        }
    }

    fn install(&self, manager: Arc<TransportManager>) {
        let _ = self.transport_manager.set(manager);
    }
}

impl TcpProxyHandler for ProxyBridge {
    /// Injects the canned CONNECT-proxy handshake reply so the
    /// session manager's proxy-side TCP client — which sent a literal
    /// `CONNECT host:port HTTP/1.0` — sees the `200` it's waiting for.
    fn on_new_connection(&self, _conn_id: u32, stream: &TcpStream) {
        if let Err(error) = (&*stream).write_all(b"HTTP/1.0 200 Connection established\r\n\r\n") {
            logger::warn(format!("engine: failed to write proxy handshake reply: {error}"));
        }
    }

    fn on_data(&self, conn_id: u32, piece: DataPiece<'_>) {
        if let Some(manager) = self.transport_manager.get() {
            manager.send_tcp_data(conn_id, piece);
        }
    }
}

impl UdpProxyHandler for ProxyBridge {
    fn on_datagram(&self, datagram_id: u64, datagram: &[u8]) {
        if let Some(manager) = self.transport_manager.get() {
            manager.send_udp_data(datagram_id, datagram);
        }
    }
}

/// Everything torn down by `on_stop`, grouped so drop order is explicit:
/// transport loops and the transport manager first, then the proxies, then
/// the session reactor.
struct Running {
    transport_manager: Arc<TransportManager>,
    tcp_proxy: Arc<TcpProxy>,
    udp_proxy: Arc<UdpProxy>,
    session: SessionManager,
}

/// The crate's public lifecycle surface. One instance owns one
/// tunnel's worth of state; constructing a second instance over the same
/// ports is the caller's mistake to avoid, not this type's to prevent.
pub struct MobileBridgeEngine {
    config: Config,
    device_type_id: String,
    backoff: Vec<Duration>,
    host: Arc<dyn Host>,
    listener: Arc<dyn EngineListener>,
    running: Mutex<Option<Running>>,
}

impl MobileBridgeEngine {
    /// Validates `config` and builds an idle engine. Nothing is bound or
    /// spawned until [`MobileBridgeEngine::on_start`].
    pub fn new(
        config: Config,
        device_type_id: impl Into<String>,
        host: Arc<dyn Host>,
        listener: Arc<dyn EngineListener>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            device_type_id: device_type_id.into(),
            backoff: default_backoff(),
            host,
            listener,
            running: Mutex::new(None),
        })
    }

    /// Overrides the default transport-loop backoff table. Intended for
    /// test harnesses; production callers can ignore this.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Idempotent: binds both local proxies, registers every transport the
    /// host reports, and starts the session reactor on `tun_fd`. A second
    /// call while already running is a no-op.
    pub fn on_start(&self, tun_fd: RawFd) -> Result<(), EngineError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let bridge = Arc::new(ProxyBridge::new());
        let tcp_proxy = Arc::new(
            TcpProxy::bind(self.config.tcp_proxy_port, Arc::clone(&bridge) as Arc<dyn TcpProxyHandler>)
                .map_err(EngineError::TcpProxyBind)?,
        );
        let udp_proxy = Arc::new(
            UdpProxy::bind(self.config.udp_proxy_port, Arc::clone(&bridge) as Arc<dyn UdpProxyHandler>)
                .map_err(EngineError::UdpProxyBind)?,
        );

        let transport_manager = Arc::new(TransportManager::new(
            Arc::clone(&self.host),
            Arc::clone(&tcp_proxy),
            Arc::clone(&udp_proxy),
            Arc::clone(&self.listener),
            self.device_type_id.clone(),
            self.backoff.clone(),
        ));
        bridge.install(Arc::clone(&transport_manager));

        let session = SessionManager::start(tun_fd, tcp_proxy.local_addr(), udp_proxy.local_addr(), Arc::clone(&self.host));

        logger::breadcrumb(BreadcrumbFlags::ENGINE, "engine: started".to_string());
        *running = Some(Running {
            transport_manager,
            tcp_proxy,
            udp_proxy,
            session,
        });
        Ok(())
    }

    /// Idempotent: tears down the transport loops and manager, then the
    /// proxies, then the session reactor. A no-op if not running.
    pub fn on_stop(&self) {
        let Some(state) = self.running.lock().take() else {
            return;
        };
        state.transport_manager.shutdown();
        drop(state.transport_manager);
        drop(state.tcp_proxy);
        drop(state.udp_proxy);
        drop(state.session);
        logger::breadcrumb(BreadcrumbFlags::ENGINE, "engine: stopped".to_string());
    }

    pub fn on_device_authorized(&self, token: &str, authorized: bool) {
        if let Some(state) = self.running.lock().as_ref() {
            state.transport_manager.authorize_device(token, authorized);
        }
    }

    pub fn on_info_sent(&self, token: &str, info_id: u32, info_text: &str) {
        if let Some(state) = self.running.lock().as_ref() {
            state.transport_manager.send_info(token, info_id, info_text);
        }
    }

    /// The active transport's id and reported state, or two empty strings
    /// if the engine isn't running or no transport is registered.
    pub fn active_transport(&self) -> (String, String) {
        self.running
            .lock()
            .as_ref()
            .map(|state| state.transport_manager.active_transport())
            .unwrap_or_default()
    }

    pub fn counters(&self) -> crate::session::stats::CountersSnapshot {
        self.running
            .lock()
            .as_ref()
            .map(|state| state.session.counters())
            .unwrap_or_default()
    }

    /// Stops the engine (a no-op if already stopped) and releases every
    /// host interface reference. Safe to call multiple times.
    pub fn shutdown(&self) {
        self.on_stop();
    }
}
