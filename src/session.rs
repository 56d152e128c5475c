//! The Session Manager: the userspace TCP/IP termination layer bound to
//! the TUN file descriptor.
//!
//! Owns a dedicated "session-manager reactor thread" — an OS thread running
//! a single-worker tokio runtime whose only job
//! is to pump packets in from TUN, dispatch them to per-flow tasks, and pump
//! the flow tasks' replies back out to TUN. Every flow task runs on that
//! same runtime, so the flow tables below are only ever touched from the
//! reactor thread itself — no locking needed.

mod checksum;
pub mod packet;
mod seq;
pub mod stats;
pub mod tcp;
mod tun;
pub mod udp;

use crate::host::Host;
use crate::logger::{self, BreadcrumbFlags};
use packet::ParsedIpv4;
use stats::{Counters, CountersSnapshot};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tun::{TunIo, TUN_PACKET_BUFFER};

/// Injected from any thread to stop the reactor without racing it — a
/// channel stands in for a control-pipe `QUIT` byte here; see DESIGN.md for
/// why.
enum Control {
    Quit,
}

/// Handle to a running reactor thread. Dropping it stops the reactor.
pub struct SessionManager {
    control_tx: mpsc::UnboundedSender<Control>,
    thread: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl SessionManager {
    /// Starts the reactor thread bound to `tun_fd`. `tcp_proxy_addr` /
    /// `udp_proxy_addr` are where per-flow tasks dial the local proxy
    /// listeners.
    pub fn start(tun_fd: RawFd, tcp_proxy_addr: SocketAddr, udp_proxy_addr: SocketAddr, host: Arc<dyn Host>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let reactor_counters = Arc::clone(&counters);

        let thread = std::thread::Builder::new()
            .name("session-reactor".into())
            .spawn(move || {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_io()
                    .enable_time()
                    .build()
                    .expect("build session reactor runtime");
                runtime.block_on(reactor_main(
                    tun_fd,
                    tcp_proxy_addr,
                    udp_proxy_addr,
                    host,
                    control_rx,
                    reactor_counters,
                ));
            })
            .expect("spawn session reactor thread");

        Self {
            control_tx,
            thread: Some(thread),
            counters,
        }
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Idempotent; safe to call more than once and from any thread.
    pub fn stop(&mut self) {
        let _ = self.control_tx.send(Control::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reactor_main(
    tun_fd: RawFd,
    tcp_proxy_addr: SocketAddr,
    udp_proxy_addr: SocketAddr,
    host: Arc<dyn Host>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    counters: Arc<Counters>,
) {
    let tun_io = match TunIo::new(tun_fd) {
        Ok(io) => io,
        Err(error) => {
            logger::error(format!("session: failed to prepare tun fd: {error}"));
            return;
        }
    };

    let (tun_tx, mut tun_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut tcp_flows: HashMap<tcp::FlowKey, tcp::FlowHandle> = HashMap::new();
    let mut udp_flows: HashMap<udp::FlowKey, udp::FlowHandle> = HashMap::new();
    let mut read_buf = vec![0u8; TUN_PACKET_BUFFER];

    logger::breadcrumb(BreadcrumbFlags::SESSION, "session: reactor started".to_string());

    loop {
        tokio::select! {
            biased;
            _ = control_rx.recv() => {
                logger::breadcrumb(BreadcrumbFlags::SESSION, "session: reactor received quit".to_string());
                break;
            }
            maybe_packet = tun_rx.recv() => {
                if let Some(packet) = maybe_packet {
                    if let Err(error) = tun_io.write_packet(&packet).await {
                        logger::error(format!("session: tun write failed: {error}"));
                    }
                }
            }
            result = tun_io.read_packet(&mut read_buf) => {
                match result {
                    Ok(0) => {}
                    Ok(n) => {
                        counters.add_ip_packet(n);
                        dispatch_packet(
                            &read_buf[..n],
                            tcp_proxy_addr,
                            udp_proxy_addr,
                            &host,
                            &tun_tx,
                            &mut tcp_flows,
                            &mut udp_flows,
                            &counters,
                        );
                    }
                    Err(error) => {
                        logger::error(format!("session: tun read failed: {error}"));
                    }
                }
            }
        }
    }

    drop(tcp_flows);
    drop(udp_flows);
}

#[allow(clippy::too_many_arguments)]
fn dispatch_packet(
    raw: &[u8],
    tcp_proxy_addr: SocketAddr,
    udp_proxy_addr: SocketAddr,
    host: &Arc<dyn Host>,
    tun_tx: &mpsc::UnboundedSender<Vec<u8>>,
    tcp_flows: &mut HashMap<tcp::FlowKey, tcp::FlowHandle>,
    udp_flows: &mut HashMap<udp::FlowKey, udp::FlowHandle>,
    counters: &Arc<Counters>,
) {
    match packet::ip_version(raw) {
        Some(4) => {}
        Some(6) => {
            counters.ipv6_dropped_total.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Some(other) => {
            logger::debug(format!("session: dropping unsupported ip version {other}"));
            return;
        }
        None => return,
    }

    match packet::parse_ipv4(raw) {
        Ok(ParsedIpv4::Tcp(seg)) => {
            dispatch_tcp(seg, tcp_proxy_addr, host, tun_tx, tcp_flows, counters);
        }
        Ok(ParsedIpv4::Udp(dgram)) => {
            dispatch_udp(dgram, udp_proxy_addr, host, tun_tx, udp_flows);
        }
        Ok(ParsedIpv4::Icmp) => {
            counters.icmp_dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ParsedIpv4::Other(protocol)) => {
            logger::debug(format!("session: dropping unsupported ip protocol {protocol}"));
        }
        Err(error) => {
            logger::debug(format!("session: failed to parse ipv4 packet: {error}"));
            counters.invalid_ipv4_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn dispatch_tcp(
    seg: packet::TcpSegment<'_>,
    proxy_addr: SocketAddr,
    host: &Arc<dyn Host>,
    tun_tx: &mpsc::UnboundedSender<Vec<u8>>,
    tcp_flows: &mut HashMap<tcp::FlowKey, tcp::FlowHandle>,
    counters: &Arc<Counters>,
) {
    let key = tcp::FlowKey {
        client_ip: seg.src,
        client_port: seg.src_port,
        server_ip: seg.dst,
        server_port: seg.dst_port,
    };
    let owned = tcp::OwnedSegment::from(&seg);

    if let Some(handle) = tcp_flows.get(&key) {
        if handle.tx.send(owned.clone()).is_ok() {
            return;
        }
        // Flow task already exited (cleanup linger elapsed); fall through and
        // treat this segment as if no session existed — re-observing a
        // matching SYN on a closed session starts a new one.
        tcp_flows.remove(&key);
    }

    if owned.flags.syn {
        let handle = tcp::spawn(key, owned, proxy_addr, Arc::clone(host), tun_tx.clone(), Arc::clone(counters));
        tcp_flows.insert(key, handle);
    } else {
        tcp::reject_out_of_session(tun_tx, &key, &owned);
    }
}

fn dispatch_udp(
    dgram: packet::UdpDatagram<'_>,
    proxy_addr: SocketAddr,
    host: &Arc<dyn Host>,
    tun_tx: &mpsc::UnboundedSender<Vec<u8>>,
    udp_flows: &mut HashMap<udp::FlowKey, udp::FlowHandle>,
) {
    let key = udp::FlowKey {
        client_ip: dgram.src,
        client_port: dgram.src_port,
        server_ip: dgram.dst,
        server_port: dgram.dst_port,
    };

    if let Some(handle) = udp_flows.get(&key) {
        if handle.tx.send(dgram.payload.to_vec()).is_ok() {
            return;
        }
        udp_flows.remove(&key);
    }

    let handle = udp::spawn(key, proxy_addr, Arc::clone(host), tun_tx.clone());
    let _ = handle.tx.send(dgram.payload.to_vec());
    udp_flows.insert(key, handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct NullHost;
    impl Host for NullHost {
        fn get_transports(&self) -> Vec<crate::host::Transport> {
            Vec::new()
        }
        fn connect(&self, _transport_id: &str) -> Option<Box<dyn crate::host::Connection>> {
            None
        }
        fn disconnect(&self, _transport_id: &str) {}
        fn protect_socket(&self, _fd: std::os::fd::RawFd) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn non_syn_packet_with_no_session_gets_rejected_without_spawning() {
        let raw = packet::build_tcp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(93, 184, 216, 34),
            51000,
            443,
            500,
            0,
            packet::TcpFlags {
                ack: true,
                ..Default::default()
            },
            65535,
            &[],
        );

        let host: Arc<dyn Host> = Arc::new(NullHost);
        let (tun_tx, mut tun_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut tcp_flows = HashMap::new();
        let counters = Arc::new(Counters::default());

        dispatch_packet(
            &raw,
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            &host,
            &tun_tx,
            &mut tcp_flows,
            &mut HashMap::new(),
            &counters,
        );

        assert!(tcp_flows.is_empty());
        let reply = tun_rx.try_recv().expect("a rst should have been emitted");
        match packet::parse_ipv4(&reply).unwrap() {
            ParsedIpv4::Tcp(seg) => assert!(seg.flags.rst),
            other => panic!("expected a tcp reply, got {other:?}"),
        }
    }

    #[test]
    fn ipv6_packets_are_counted_and_dropped() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60; // version 6
        let host: Arc<dyn Host> = Arc::new(NullHost);
        let (tun_tx, _tun_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let counters = Arc::new(Counters::default());

        dispatch_packet(
            &packet,
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            &host,
            &tun_tx,
            &mut HashMap::new(),
            &mut HashMap::new(),
            &counters,
        );

        assert_eq!(counters.snapshot().ipv6_dropped_total, 1);
    }
}
