use super::*;
use std::io::Write as _;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Recorder {
    pieces: Arc<Mutex<Vec<(Option<Vec<u8>>, usize)>>>,
}

impl DataHandler for Recorder {
    fn on_data(&self, data: Option<&[u8]>, bytes_so_far: usize) {
        self.pieces
            .lock()
            .unwrap()
            .push((data.map(|d| d.to_vec()), bytes_so_far));
    }
}

#[test]
fn delivers_data_then_eos() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let writer_thread = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        sock.write_all(b"hi").unwrap();
        // drop to trigger EOS on the other side
    });

    let stream = TcpStream::connect(addr).unwrap();
    let pieces = Arc::new(Mutex::new(Vec::new()));
    let mut puller = SocketPuller::new(
        stream,
        Recorder {
            pieces: Arc::clone(&pieces),
        },
    );
    puller.start();
    writer_thread.join().unwrap();

    // give the puller a moment to observe EOS
    for _ in 0..50 {
        if pieces.lock().unwrap().len() >= 2 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    puller.shutdown();

    let collected = pieces.lock().unwrap();
    assert_eq!(collected[0], (Some(b"hi".to_vec()), 0));
    assert_eq!(collected[1], (Some(Vec::new()), 2));
}
