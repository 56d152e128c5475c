//! Bounded single-producer single-consumer byte pipe.
//!
//! Used to decouple a puller thread (which blocks on an external read call) from
//! a consumer thread that wants to wait for a whole frame's worth of bytes before
//! doing anything. [`DataStreamPipe::split`] hands out a [`PipeReader`] and a
//! [`PipeWriter`] that share one bounded ring; closing either side marks the pipe
//! closed for both.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipeError {
    #[error("pipe is closed")]
    Closed,
}

struct Ring {
    buf: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

struct Shared {
    state: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// A bounded byte pipe. Construct with [`DataStreamPipe::new`], then use
/// [`DataStreamPipe::split`] to get an owned reader/writer pair, or call the
/// blocking methods directly on this handle (it implements both sides).
pub struct DataStreamPipe {
    shared: Arc<Shared>,
}

impl DataStreamPipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Ring {
                    buf: VecDeque::with_capacity(capacity),
                    capacity,
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    pub fn split(&self) -> (PipeReader, PipeWriter) {
        (
            PipeReader {
                shared: Arc::clone(&self.shared),
            },
            PipeWriter {
                shared: Arc::clone(&self.shared),
            },
        )
    }

    /// Idempotent. Unblocks any waiter on either side with [`PipeError::Closed`].
    pub fn close(&self) {
        close_shared(&self.shared);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

fn close_shared(shared: &Shared) {
    let mut state = shared.state.lock();
    if state.closed {
        return;
    }
    state.closed = true;
    drop(state);
    shared.not_empty.notify_all();
    shared.not_full.notify_all();
}

#[derive(Clone)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl std::io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        PipeReader::read(self, buf).map_err(|_| std::io::ErrorKind::UnexpectedEof.into())
    }
}

impl std::io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        PipeWriter::write(self, buf)
            .map(|_| buf.len())
            .map_err(|_| std::io::ErrorKind::BrokenPipe.into())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl PipeReader {
    /// Blocks until at least one byte is available (or the pipe closes with
    /// nothing buffered), then returns up to `buf.len()` bytes.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.buf.pop_front().unwrap();
                }
                drop(state);
                self.shared.not_full.notify_all();
                return Ok(n);
            }
            if state.closed {
                return Err(PipeError::Closed);
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Blocks until exactly `buf.len()` bytes have been read.
    pub fn read_fully(&self, buf: &mut [u8]) -> Result<(), PipeError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            filled += n;
        }
        Ok(())
    }

    pub fn read_byte(&self) -> Result<u8, PipeError> {
        let mut byte = [0u8; 1];
        self.read_fully(&mut byte)?;
        Ok(byte[0])
    }

    /// Blocks until at least `min` bytes are buffered (or the pipe closes).
    pub fn wait_for_available_bytes(&self, min: usize) -> Result<(), PipeError> {
        let mut state = self.shared.state.lock();
        loop {
            if state.buf.len() >= min {
                return Ok(());
            }
            if state.closed {
                return Err(PipeError::Closed);
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Like [`PipeReader::wait_for_available_bytes`], but gives up and
    /// returns `Ok(false)` after `timeout` instead of blocking indefinitely.
    /// Lets a caller that needs to re-check some outside condition (a quit
    /// signal) do so on a bounded cadence instead of parking forever.
    pub fn wait_for_available_bytes_timeout(&self, min: usize, timeout: Duration) -> Result<bool, PipeError> {
        let mut state = self.shared.state.lock();
        loop {
            if state.buf.len() >= min {
                return Ok(true);
            }
            if state.closed {
                return Err(PipeError::Closed);
            }
            if self.shared.not_empty.wait_for(&mut state, timeout).timed_out() {
                return Ok(false);
            }
        }
    }

    pub fn available(&self) -> usize {
        self.shared.state.lock().buf.len()
    }

    pub fn close(&self) {
        close_shared(&self.shared);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl PipeWriter {
    /// Blocks until all of `buf` has been accepted into the ring.
    pub fn write(&self, buf: &[u8]) -> Result<(), PipeError> {
        let mut offset = 0;
        while offset < buf.len() {
            let mut state = self.shared.state.lock();
            loop {
                if state.closed {
                    return Err(PipeError::Closed);
                }
                let room = state.capacity - state.buf.len();
                if room > 0 {
                    let n = room.min(buf.len() - offset);
                    state.buf.extend(&buf[offset..offset + n]);
                    offset += n;
                    drop(state);
                    self.shared.not_empty.notify_all();
                    break;
                }
                self.shared.not_full.wait(&mut state);
            }
        }
        Ok(())
    }

    pub fn write_byte(&self, byte: u8) -> Result<(), PipeError> {
        self.write(&[byte])
    }

    pub fn close(&self) {
        close_shared(&self.shared);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

#[cfg(test)]
mod tests;
