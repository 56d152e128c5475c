//! A thread that continuously reads from an accepted TCP socket and hands
//! chunks to a callback, with a terminal EOS/error notification.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const SOCKET_BUFFER_BYTES: usize = 4096;

/// Delivered for every read from the socket.
///
/// - `bytes_so_far == 0` marks the first piece of the stream.
/// - `data` is `None` on read error; `Some(&[])` signals a graceful EOS.
pub trait DataHandler: Send + 'static {
    fn on_data(&self, data: Option<&[u8]>, bytes_so_far: usize);
}

impl<F> DataHandler for F
where
    F: Fn(Option<&[u8]>, usize) + Send + 'static,
{
    fn on_data(&self, data: Option<&[u8]>, bytes_so_far: usize) {
        self(data, bytes_so_far)
    }
}

/// Wraps one accepted socket. Constructing does not start the read loop —
/// callers that need to inject something on the socket first (a canned reply)
/// should do so between [`SocketPuller::new`] and [`SocketPuller::start`].
pub struct SocketPuller {
    stream: TcpStream,
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    pending: Option<Box<dyn FnOnce(Arc<AtomicBool>) -> JoinHandle<()> + Send>>,
}

impl SocketPuller {
    pub fn new<H: DataHandler>(stream: TcpStream, handler: H) -> Self {
        let reader_stream = stream.try_clone().expect("clone puller socket");
        let pending: Box<dyn FnOnce(Arc<AtomicBool>) -> JoinHandle<()> + Send> =
            Box::new(move |stopping| {
                thread::Builder::new()
                    .name("socket-puller".into())
                    .spawn(move || puller_loop(reader_stream, handler, stopping))
                    .expect("spawn socket puller thread")
            });

        Self {
            stream,
            stopping: Arc::new(AtomicBool::new(false)),
            thread: None,
            pending: Some(pending),
        }
    }

    pub fn raw_stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Spawns the read loop. A no-op if already started.
    pub fn start(&mut self) {
        if let Some(spawn) = self.pending.take() {
            self.thread = Some(spawn(Arc::clone(&self.stopping)));
        }
    }

    pub fn send_response(&self, buf: &[u8]) {
        if let Err(error) = (&self.stream).write_all(buf) {
            crate::logger::error(format!("puller: send_response failed: {error}"));
        }
    }

    /// Half-closes the socket so the puller thread observes EOS and exits on
    /// its own; does not join.
    pub fn close(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Closes the socket and joins the puller thread. Blocking.
    pub fn shutdown(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SocketPuller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn puller_loop<H: DataHandler>(mut stream: TcpStream, handler: H, stopping: Arc<AtomicBool>) {
    let mut buf = [0u8; SOCKET_BUFFER_BYTES];
    let mut total = 0usize;
    loop {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                handler.on_data(Some(&[]), total);
                return;
            }
            Ok(n) => {
                handler.on_data(Some(&buf[..n]), total);
                total += n;
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => {
                if !stopping.load(Ordering::SeqCst) {
                    crate::logger::debug(format!("puller: read failed: {error}"));
                    handler.on_data(None, total);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests;
