use super::*;
use std::sync::Mutex as StdMutex;
use std::time::Duration as StdDuration;

#[derive(Default)]
struct Recording {
    datagrams: StdMutex<Vec<(u64, Vec<u8>)>>,
}

impl UdpProxyHandler for Recording {
    fn on_datagram(&self, datagram_id: u64, datagram: &[u8]) {
        self.datagrams
            .lock()
            .unwrap()
            .push((datagram_id, datagram.to_vec()));
    }
}

#[test]
fn assigns_monotonic_datagram_ids_and_replies_to_sender() {
    let handler = Arc::new(Recording::default());
    let mut proxy = UdpProxy::bind(0, Arc::clone(&handler) as Arc<dyn UdpProxyHandler>).unwrap();
    let addr = proxy.local_addr();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(StdDuration::from_secs(2))).unwrap();
    client.send_to(b"hello", addr).unwrap();
    client.send_to(b"world", addr).unwrap();

    let mut waited = StdDuration::ZERO;
    while waited < StdDuration::from_secs(2) {
        if handler.datagrams.lock().unwrap().len() >= 2 {
            break;
        }
        thread::sleep(StdDuration::from_millis(20));
        waited += StdDuration::from_millis(20);
    }

    let recorded = handler.datagrams.lock().unwrap().clone();
    assert_eq!(recorded[0], (1, b"hello".to_vec()));
    assert_eq!(recorded[1], (2, b"world".to_vec()));

    // give the recv thread a moment to record the return address after the handler ran
    thread::sleep(StdDuration::from_millis(20));
    proxy.send_reply(1, b"reply-1");

    let mut buf = [0u8; 64];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"reply-1");

    proxy.shutdown();
}

#[test]
fn reply_to_unknown_datagram_id_is_a_no_op() {
    let handler = Arc::new(Recording::default());
    let mut proxy = UdpProxy::bind(0, Arc::clone(&handler) as Arc<dyn UdpProxyHandler>).unwrap();
    proxy.send_reply(999, b"nothing should happen");
    proxy.shutdown();
}

#[test]
fn send_reply_is_single_use() {
    let handler = Arc::new(Recording::default());
    let mut proxy = UdpProxy::bind(0, Arc::clone(&handler) as Arc<dyn UdpProxyHandler>).unwrap();
    let addr = proxy.local_addr();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(StdDuration::from_secs(2))).unwrap();
    client.send_to(b"once", addr).unwrap();

    let mut waited = StdDuration::ZERO;
    while waited < StdDuration::from_secs(2) {
        if !handler.datagrams.lock().unwrap().is_empty() {
            break;
        }
        thread::sleep(StdDuration::from_millis(20));
        waited += StdDuration::from_millis(20);
    }
    thread::sleep(StdDuration::from_millis(20));

    proxy.send_reply(1, b"first");
    let mut buf = [0u8; 64];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"first");

    // second reply for the same id must be dropped, not resent
    proxy.send_reply(1, b"second");
    client.set_read_timeout(Some(StdDuration::from_millis(200))).unwrap();
    assert!(client.recv_from(&mut buf).is_err());

    proxy.shutdown();
}

#[test]
fn purge_stale_removes_entries_past_ttl_and_keeps_fresh_ones() {
    let registry = Mutex::new(Registry {
        return_addresses: HashMap::new(),
    });
    let stale_addr: SocketAddr = "127.0.0.1:10000".parse().unwrap();
    let fresh_addr: SocketAddr = "127.0.0.1:10001".parse().unwrap();
    let now = Instant::now();
    {
        let mut reg = registry.lock();
        reg.return_addresses.insert(
            1,
            ReturnAddress {
                addr: stale_addr,
                recorded_at: now - Duration::from_secs(200),
            },
        );
        reg.return_addresses.insert(
            2,
            ReturnAddress {
                addr: fresh_addr,
                recorded_at: now,
            },
        );
    }

    purge_stale(&registry, RETURN_ADDRESS_TTL, now);

    let reg = registry.lock();
    assert!(!reg.return_addresses.contains_key(&1));
    assert!(reg.return_addresses.contains_key(&2));
}
