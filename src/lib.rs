//! A mobile-tethered VPN data plane with a multi-transport multiplexer.
//!
//! A paired mobile device provides internet access to a head unit. This
//! crate owns everything downstream of that pairing: a local TUN interface
//! is read by the [`session`] manager, which terminates each TCP/UDP flow
//! against the local [`tcp_proxy`]/[`udp_proxy`] listeners; [`transport_manager`]
//! and [`transport_loop`] carry the resulting bytes, framed by [`muxer`], over
//! whichever registered transport (Bluetooth, Wi-Fi, USB/EAP, ...) is
//! currently active. [`engine`] wires all of this together behind the
//! lifecycle API the embedding application drives.
//!
//! Deliberately out of scope: the cross-language broker that would expose
//! this engine to a host application across a process or language boundary,
//! the host-side platform hooks for transport I/O (see [`host`] for the Rust
//! trait boundary those hooks fill instead), and anything peripheral to the
//! data plane itself (voice assistants, media adapters, metrics export).

#![deny(unsafe_op_in_unsafe_fn)]

mod config;
mod engine;
mod host;
mod logger;
mod muxer;
mod pipe;
mod session;
mod socket_puller;
mod tcp_proxy;
mod transport_loop;
mod transport_manager;
mod udp_proxy;

pub use config::{Config, ConfigError};
pub use engine::{EngineError, MobileBridgeEngine};
pub use host::{Connection, EngineListener, Host, Transport, TransportType};
pub use logger::{install_sink, set_breadcrumb_mask, BreadcrumbFlags, LogLevel, LogSink};
pub use session::stats::CountersSnapshot;
