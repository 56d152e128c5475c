//! Non-blocking TUN file descriptor I/O for the session reactor.
//!
//! The session manager owns exactly one OS thread, the session-manager
//! reactor thread, and must never block it on a TUN read or write; both are
//! driven through tokio's I/O driver the same way the rest of this crate
//! drives the proxy sockets, rather than a dedicated blocking thread per
//! direction. [`TunIo`] puts the fd in non-blocking mode and wraps it in
//! [`tokio::io::unix::AsyncFd`], which is what the crate's `tokio` dependency
//! already carries the `net` feature for.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

pub const TUN_PACKET_BUFFER: usize = 64 * 1024;

struct RawFdSource(RawFd);

impl AsRawFd for RawFdSource {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A borrowed, non-owning handle on a TUN file descriptor. The embedding
/// application (the "host") owns the fd's lifetime; this type only ever
/// sets `O_NONBLOCK` on it and never closes it.
pub struct TunIo {
    inner: AsyncFd<RawFdSource>,
}

impl TunIo {
    /// Puts `fd` in non-blocking mode and wraps it for reactor-driven I/O.
    /// Safety/lifetime: the caller retains ownership of `fd` and must keep it
    /// open for at least as long as the returned `TunIo`.
    pub fn new(fd: RawFd) -> io::Result<Self> {
        set_nonblocking(fd)?;
        let inner = AsyncFd::with_interest(RawFdSource(fd), Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { inner })
    }

    /// Reads one packet. TUN fds are packet-oriented: each `read()` returns
    /// exactly one IP packet (or would block).
    pub async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| read_fd(inner.get_ref().0, buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_packet(&self, buf: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| write_fd(inner.get_ref().0, buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid, open file descriptor for the lifetime of this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same as above; we only set a flag bit.
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is a valid mutable slice for its declared length; `fd` is open.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    // SAFETY: `buf` is a valid slice for its declared length; `fd` is open.
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if (n as usize) != buf.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "partial TUN write"));
    }
    Ok(())
}
