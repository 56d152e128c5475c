use super::*;
use std::io::{Read as _, Write as _};
use std::net::TcpStream as StdTcpStream;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

#[derive(Default)]
struct Recording {
    new_connections: StdMutex<Vec<u32>>,
    pieces: StdMutex<Vec<(u32, Option<Vec<u8>>)>>,
}

impl TcpProxyHandler for Recording {
    fn on_new_connection(&self, conn_id: u32, stream: &StdTcpStream) {
        self.new_connections.lock().unwrap().push(conn_id);
        let _ = (&*stream).write_all(b"HTTP/1.0 200 Connection established\r\n\r\n");
    }

    fn on_data(&self, conn_id: u32, piece: DataPiece<'_>) {
        self.pieces
            .lock()
            .unwrap()
            .push((conn_id, piece.data.map(|d| d.to_vec())));
    }
}

#[test]
fn accepts_connections_and_forwards_data_and_eos() {
    let handler = Arc::new(Recording::default());
    let mut proxy = TcpProxy::bind(0, Arc::clone(&handler) as Arc<dyn TcpProxyHandler>).unwrap();
    let addr = proxy.local_addr();

    let mut client = StdTcpStream::connect(addr).unwrap();

    let mut greeting = [0u8; 64];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = client.read(&mut greeting).unwrap();
    assert!(greeting[..n].starts_with(b"HTTP/1.0 200"));

    client.write_all(b"payload").unwrap();
    drop(client);

    let mut waited = Duration::ZERO;
    while waited < Duration::from_secs(2) {
        if handler.pieces.lock().unwrap().len() >= 2 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        waited += Duration::from_millis(20);
    }

    assert_eq!(handler.new_connections.lock().unwrap().as_slice(), &[1]);
    let pieces = handler.pieces.lock().unwrap();
    assert_eq!(pieces[0], (1, Some(b"payload".to_vec())));
    assert_eq!(pieces[1], (1, Some(Vec::new())));

    proxy.shutdown();
}

#[test]
fn assigns_monotonic_connection_ids() {
    let handler = Arc::new(Recording::default());
    let mut proxy = TcpProxy::bind(0, Arc::clone(&handler) as Arc<dyn TcpProxyHandler>).unwrap();
    let addr = proxy.local_addr();

    for _ in 0..3 {
        let _client = StdTcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    let mut waited = Duration::ZERO;
    while waited < Duration::from_secs(2) {
        if handler.new_connections.lock().unwrap().len() >= 3 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        waited += Duration::from_millis(20);
    }

    assert_eq!(handler.new_connections.lock().unwrap().as_slice(), &[1, 2, 3]);
    proxy.shutdown();
}
