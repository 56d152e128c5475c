//! The host-interface contract: everything the engine calls out to the
//! embedding application for, and everything it calls back with.
//!
//! Expressed as Rust traits rather than a C ABI — the cross-language broker
//! that would marshal these across a process or language boundary is a
//! named exclusion (see crate-level docs), so this is the last point the
//! contract can stay ordinary Rust.

use std::io;

/// A single mobile-side bearer capable of carrying an ordered byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transport {
    pub id: String,
    pub transport_type: TransportType,
}

/// Priority is ascending ordinal: `Bluetooth` outranks `Wifi`, which
/// outranks `Eap`, and so on. `Test` transports are implicitly authorized
/// and exist for harness use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TransportType {
    Undefined = 0,
    Bluetooth = 1,
    Wifi = 2,
    Eap = 3,
    Usb = 4,
    Test = 5,
}

/// A live connection to one transport. `read`/`write`/`connect` may block
/// arbitrarily and must only be called from the transport's own dedicated
/// thread — never from the session reactor or the engine executor.
pub trait Connection: Send {
    /// `Ok(0)` is EOS. `Err` is a hard failure.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    fn close(&mut self);
    /// An independent handle to the same underlying transport, so a
    /// dedicated reader can block in `read` while a separate writer calls
    /// `write` concurrently without contending on one lock (mirrors
    /// `TcpStream::try_clone` for host connections not backed by a socket).
    fn try_clone(&self) -> io::Result<Box<dyn Connection>>;
}

/// Everything the engine calls out to the host for.
pub trait Host: Send + Sync + 'static {
    fn get_transports(&self) -> Vec<Transport>;
    /// `None` triggers the transport loop's backoff/retry.
    fn connect(&self, transport_id: &str) -> Option<Box<dyn Connection>>;
    fn disconnect(&self, transport_id: &str);
    /// Exempts `fd` from TUN capture so the engine's own proxy sockets don't
    /// loop back through the tunnel they are terminating.
    fn protect_socket(&self, fd: std::os::fd::RawFd) -> bool;
}

/// Outbound notifications the engine raises on the host.
pub trait EngineListener: Send + Sync + 'static {
    fn on_active_transport_change(&self, transport_id: &str, state: &str);
    fn on_device_handshaked(&self, transport_id: &str, token: &str, name: &str);
    fn on_info(&self, token: &str, info_id: u32, json: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_ascending_ordinal() {
        assert!(TransportType::Bluetooth < TransportType::Wifi);
        assert!(TransportType::Wifi < TransportType::Eap);
        assert!(TransportType::Eap < TransportType::Usb);
        assert!(TransportType::Usb < TransportType::Test);
    }
}
