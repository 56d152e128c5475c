//! The per-flow TCP session state machine and the async task that drives
//! one flow end to end: TUN segment in, proxy socket bytes out, and back.
//!
//! Each flow is a single tokio task spawned on the session manager's
//! single-threaded runtime. Nothing outside that task ever touches the
//! flow's sequence/window/queue state — single-owner discipline, realized
//! here as a dedicated task that never yields its state to anyone else, all
//! still serialized onto the one reactor OS thread.

use super::packet::{self, ParsedIpv4, TcpFlags, TcpSegment};
use super::stats::Counters;
use crate::host::Host;
use crate::logger::{self, BreadcrumbFlags};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Cleanup linger after a flow reaches `CLOSED`.
pub const CLEANUP_LINGER: Duration = Duration::from_secs(60);
const PROXY_READ_CHUNK: usize = 16 * 1024;
const DEFAULT_MSS: u16 = 536;
const FALLBACK_SERVER_WINDOW: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynRcvd,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    NotSent,
    Sent,
    Established,
    Closed,
}

/// An owned copy of a parsed TCP segment, suitable for sending across a
/// channel to the flow's task (the borrowed [`TcpSegment`] only lives as
/// long as the TUN read buffer it was parsed from).
#[derive(Debug, Clone)]
pub struct OwnedSegment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub payload: Vec<u8>,
}

impl From<&TcpSegment<'_>> for OwnedSegment {
    fn from(seg: &TcpSegment<'_>) -> Self {
        Self {
            seq: seg.seq,
            ack: seg.ack,
            flags: seg.flags,
            window: seg.window,
            mss: seg.mss,
            window_scale: seg.window_scale,
            payload: seg.payload.to_vec(),
        }
    }
}

/// A tiny non-cryptographic xorshift PRNG, used only to pick an initial
/// sequence number. Seeded from the process clock plus a monotonic counter
/// so concurrently-created flows don't collide.
fn random_seq() -> u32 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut x = nanos ^ counter.wrapping_mul(0x9E3779B97F4A7C15);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    (x as u32) | 1
}

struct FlowState {
    state: TcpState,
    connect_state: ConnectState,
    client_seq: u32,
    server_seq_start: u32,
    server_seq: u32,
    acked_seq: u32,
    client_window: u32,
    win_scale: u8,
    mss: u16,
    server_window: u32,
    /// Un-forwarded TUN->proxy data, keyed by sequence number. Holds
    /// everything queued before `connect_state == Established`, plus any
    /// segment the client sent before its declared sequence was reached.
    queue: BTreeMap<u32, Vec<u8>>,
    fin_pending: bool,
}

impl FlowState {
    /// Returns the window value to advertise, already shifted down to fit
    /// the 16-bit wire field. The raw byte
    /// count is clamped *before* shifting, not after — clamping the shifted
    /// value against a shifted bound is a unit mismatch that only happens to
    /// cancel out when `win_scale == 0`.
    fn calc_client_window(&self, queued_bytes: usize, unsent_socket_bytes: usize) -> u32 {
        let available = self
            .server_window
            .saturating_sub(unsent_socket_bytes as u32)
            .saturating_sub(queued_bytes as u32);
        let max_raw = (u16::MAX as u32) << self.win_scale;
        available.min(max_raw) >> self.win_scale
    }

    /// Inserts a data segment into the out-of-order queue, honoring the
    /// "replace only if strictly larger, drop smaller-or-equal duplicates"
    /// rule.
    fn enqueue(&mut self, seq: u32, payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        match self.queue.get(&seq) {
            Some(existing) if existing.len() >= payload.len() => {}
            _ => {
                self.queue.insert(seq, payload);
            }
        }
    }
}

pub struct FlowHandle {
    pub tx: mpsc::UnboundedSender<OwnedSegment>,
}

/// Spawns a new flow task for a freshly observed SYN and returns the handle
/// the session manager keeps in its flow table.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    key: FlowKey,
    syn: OwnedSegment,
    proxy_addr: std::net::SocketAddr,
    host: Arc<dyn Host>,
    tun_tx: mpsc::UnboundedSender<Vec<u8>>,
    counters: Arc<Counters>,
) -> FlowHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_flow(key, syn, proxy_addr, host, tun_tx, rx, counters));
    FlowHandle { tx }
}

/// Responds, without spawning a flow, to a packet that matches no live
/// session and isn't itself a SYN: the only valid reply is a bare RST.
/// Follows the standard out-of-window RST rules: echo the
/// peer's ack as our seq when it set ACK, otherwise ack its sequence space.
pub fn reject_out_of_session(tun_tx: &mpsc::UnboundedSender<Vec<u8>>, key: &FlowKey, seg: &OwnedSegment) {
    if seg.flags.rst {
        return;
    }
    if seg.flags.ack {
        send_standalone_rst(tun_tx, key, seg.ack, 0);
    } else {
        let advanced = seg.payload.len() as u32 + seg.flags.fin as u32;
        send_packet(
            tun_tx,
            key.server_ip,
            key.client_ip,
            key.server_port,
            key.client_port,
            0,
            seg.seq.wrapping_add(advanced.max(1)),
            TcpFlags {
                rst: true,
                ack: true,
                ..Default::default()
            },
            0,
            &[],
        );
    }
}

/// Drives one TCP flow from SYN to cleanup. Spawned by the session manager
/// on first observed SYN; exits (and drops its channel) once the flow has
/// lingered past its cleanup timeout.
#[allow(clippy::too_many_arguments)]
pub async fn run_flow(
    key: FlowKey,
    syn: OwnedSegment,
    proxy_addr: std::net::SocketAddr,
    host: Arc<dyn Host>,
    tun_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut incoming_rx: mpsc::UnboundedReceiver<OwnedSegment>,
    counters: Arc<Counters>,
) {
    // Absent MSS falls back to the documented default; absent WSCALE is 0.
    let win_scale = syn.window_scale.unwrap_or(0);
    let mss = syn.mss.unwrap_or(DEFAULT_MSS);

    let mut st = FlowState {
        state: TcpState::Listen,
        connect_state: ConnectState::NotSent,
        client_seq: syn.seq.wrapping_add(1),
        server_seq_start: random_seq(),
        server_seq: 0,
        acked_seq: 0,
        client_window: (syn.window as u32) << win_scale,
        win_scale,
        mss,
        server_window: FALLBACK_SERVER_WINDOW,
        queue: BTreeMap::new(),
        fin_pending: false,
    };
    st.server_seq = st.server_seq_start;

    if !syn.flags.syn {
        send_standalone_rst(&tun_tx, &key, syn.ack, syn.seq.wrapping_add(1));
        return;
    }

    let stream = match TcpStream::connect(proxy_addr).await {
        Ok(stream) => stream,
        Err(error) => {
            logger::warn(format!("session: tcp proxy connect failed for {key:?}: {error}"));
            counters.tcp_admission_failures_total.fetch_add(1, Ordering::Relaxed);
            send_syn_rst(&tun_tx, &key, st.server_seq_start, syn.seq);
            return;
        }
    };
    let fd = std::os::fd::AsRawFd::as_raw_fd(&stream);
    if !host.protect_socket(fd) {
        logger::warn(format!("session: protect_socket declined for {key:?}"));
    }

    // SYN|ACK to the client.
    send_packet(
        &tun_tx,
        key.server_ip,
        key.client_ip,
        key.server_port,
        key.client_port,
        st.server_seq,
        st.client_seq,
        TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        },
        advertised_window(&st),
        &[],
    );
    st.server_seq = st.server_seq.wrapping_add(1);
    st.state = TcpState::SynRcvd;

    let (mut proxy_read, mut proxy_write) = stream.into_split();

    let connect_request = format!("CONNECT {}:{} HTTP/1.0\r\n\r\n", key.server_ip, key.server_port);
    if proxy_write.write_all(connect_request.as_bytes()).await.is_err() {
        send_syn_rst(&tun_tx, &key, st.server_seq, st.client_seq);
        return;
    }
    st.connect_state = ConnectState::Sent;

    if !await_connect_reply(&mut proxy_read).await {
        logger::warn(format!("session: proxy CONNECT rejected for {key:?}"));
        send_syn_rst(&tun_tx, &key, st.server_seq, st.client_seq);
        return;
    }
    st.connect_state = ConnectState::Established;
    logger::breadcrumb(BreadcrumbFlags::TCP, format!("session: tcp flow established proxy-side for {key:?}"));

    let mut read_buf = vec![0u8; PROXY_READ_CHUNK];
    let mut closed = false;

    loop {
        if closed {
            break;
        }
        let readable = st.connect_state == ConnectState::Established
            && st.state == TcpState::Established
            && st.calc_client_window(queued_bytes(&st.queue), 0) > 0;

        tokio::select! {
            biased;
            maybe_seg = incoming_rx.recv() => {
                match maybe_seg {
                    Some(seg) => {
                        handle_incoming(&mut st, &key, &tun_tx, &counters, seg);
                        drain_queue(&mut st, &key, &tun_tx, &mut proxy_write).await;
                        if st.state == TcpState::Closed {
                            closed = true;
                        }
                    }
                    None => break,
                }
            }
            result = proxy_read.read(&mut read_buf), if readable => {
                match result {
                    Ok(0) => {
                        finish_with_fin(&mut st, &key, &tun_tx);
                    }
                    Ok(n) => {
                        forward_to_tun(&mut st, &key, &tun_tx, &read_buf[..n]);
                    }
                    Err(error) => {
                        logger::debug(format!("session: proxy read failed for {key:?}: {error}"));
                        send_data_rst(&tun_tx, &key, &st);
                        st.state = TcpState::Closed;
                        closed = true;
                    }
                }
            }
        }

        if st.state == TcpState::Closed {
            break;
        }
    }

    let _ = proxy_write.shutdown().await;
    tokio::time::sleep(CLEANUP_LINGER).await;
}

fn queued_bytes(queue: &BTreeMap<u32, Vec<u8>>) -> usize {
    queue.values().map(Vec::len).sum()
}

async fn await_connect_reply(reader: &mut tokio::net::tcp::OwnedReadHalf) -> bool {
    let mut acc = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return false,
            Ok(n) => {
                acc.extend_from_slice(&chunk[..n]);
                if acc.len() >= 12 {
                    let ok = acc.starts_with(b"HTTP/1.0 200") || acc.starts_with(b"HTTP/1.1 200");
                    if !ok {
                        return false;
                    }
                    if acc.windows(4).any(|w| w == b"\r\n\r\n") {
                        return true;
                    }
                }
                if acc.len() > 8192 {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
}

fn handle_incoming(st: &mut FlowState, key: &FlowKey, tun_tx: &mpsc::UnboundedSender<Vec<u8>>, counters: &Counters, seg: OwnedSegment) {
    st.client_window = (seg.window as u32) << st.win_scale;

    if seg.flags.rst {
        st.state = TcpState::Closing;
        logger::breadcrumb(BreadcrumbFlags::TCP, format!("session: client RST for {key:?}"));
        st.state = TcpState::Closed;
        return;
    }

    if st.state == TcpState::SynRcvd {
        if seg.flags.ack {
            st.state = TcpState::Established;
        }
    }

    if !seg.payload.is_empty() {
        st.enqueue(seg.seq, seg.payload);
    }

    if seg.flags.ack {
        use std::cmp::Ordering as O;
        if seg.ack == st.server_seq.wrapping_sub(1) {
            // One behind server_seq: interpreted as a keep-alive probe.
            logger::debug(format!("session: keep-alive ack on {key:?}"));
        } else if super::seq::compare_seq(seg.ack, st.server_seq) == O::Greater {
            logger::warn(format!("session: future-seq ack from client on {key:?} (protocol violation)"));
        } else if super::seq::precedes(seg.ack, st.acked_seq) {
            logger::debug(format!("session: repeated/old ack from client on {key:?}"));
        } else {
            st.acked_seq = seg.ack;
        }
    }

    // The FIN handling below intentionally advances `server_seq`, not
    // `client_seq`, on the normal CLOSE_WAIT transitions: this side's own
    // sequence space is what the ack it sends back has to track.
    if seg.flags.fin {
        match st.state {
            TcpState::Established => {
                if st.queue.is_empty() {
                    st.server_seq = st.server_seq.wrapping_add(1);
                    send_ack(tun_tx, key, st);
                    st.state = TcpState::CloseWait;
                } else {
                    st.fin_pending = true;
                }
            }
            TcpState::CloseWait => {
                logger::debug(format!("session: repeated FIN while in CLOSE_WAIT for {key:?}"));
            }
            TcpState::FinWait1 => {
                st.server_seq = st.server_seq.wrapping_add(1);
                send_ack(tun_tx, key, st);
                st.state = TcpState::CloseWait;
            }
            _ => {}
        }
    }

    let _ = counters;
}

async fn drain_queue(
    st: &mut FlowState,
    key: &FlowKey,
    tun_tx: &mpsc::UnboundedSender<Vec<u8>>,
    proxy_write: &mut tokio::net::tcp::OwnedWriteHalf,
) {
    if st.connect_state != ConnectState::Established {
        return;
    }
    loop {
        let next = match st.queue.iter().next() {
            Some((&seq, _)) => seq,
            None => break,
        };
        if next != st.client_seq {
            break;
        }
        let data = st.queue.remove(&next).unwrap();
        if proxy_write.write_all(&data).await.is_err() {
            logger::warn(format!("session: proxy write failed for {key:?}, resetting flow"));
            st.state = TcpState::Closed;
            return;
        }
        st.client_seq = st.client_seq.wrapping_add(data.len() as u32);
        send_ack(tun_tx, key, st);
    }

    if st.fin_pending && st.queue.is_empty() {
        st.server_seq = st.server_seq.wrapping_add(1);
        st.fin_pending = false;
        st.state = TcpState::CloseWait;
        send_ack(tun_tx, key, st);
    }
}

fn forward_to_tun(st: &mut FlowState, key: &FlowKey, tun_tx: &mpsc::UnboundedSender<Vec<u8>>, data: &[u8]) {
    let client_window_available = st.calc_client_window(queued_bytes(&st.queue), 0);
    let budget = (st.mss as usize).min(client_window_available as usize).max(1);
    for chunk in data.chunks(budget.max(1)) {
        send_packet(
            tun_tx,
            key.server_ip,
            key.client_ip,
            key.server_port,
            key.client_port,
            st.server_seq,
            st.client_seq,
            TcpFlags {
                ack: true,
                ..Default::default()
            },
            advertised_window(st),
            chunk,
        );
        st.server_seq = st.server_seq.wrapping_add(chunk.len() as u32);
    }
}

fn finish_with_fin(st: &mut FlowState, key: &FlowKey, tun_tx: &mpsc::UnboundedSender<Vec<u8>>) {
    if !st.queue.is_empty() {
        send_data_rst(tun_tx, key, st);
        st.state = TcpState::Closed;
        return;
    }
    send_packet(
        tun_tx,
        key.server_ip,
        key.client_ip,
        key.server_port,
        key.client_port,
        st.server_seq,
        st.client_seq,
        TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        },
        advertised_window(st),
        &[],
    );
    st.server_seq = st.server_seq.wrapping_add(1);
    st.state = TcpState::FinWait1;
}

fn send_ack(tun_tx: &mpsc::UnboundedSender<Vec<u8>>, key: &FlowKey, st: &FlowState) {
    send_packet(
        tun_tx,
        key.server_ip,
        key.client_ip,
        key.server_port,
        key.client_port,
        st.server_seq,
        st.client_seq,
        TcpFlags {
            ack: true,
            ..Default::default()
        },
        advertised_window(st),
        &[],
    );
}

fn send_data_rst(tun_tx: &mpsc::UnboundedSender<Vec<u8>>, key: &FlowKey, st: &FlowState) {
    send_packet(
        tun_tx,
        key.server_ip,
        key.client_ip,
        key.server_port,
        key.client_port,
        st.server_seq,
        st.client_seq,
        TcpFlags {
            rst: true,
            ack: true,
            ..Default::default()
        },
        0,
        &[],
    );
}

fn send_syn_rst(tun_tx: &mpsc::UnboundedSender<Vec<u8>>, key: &FlowKey, server_seq: u32, client_seq: u32) {
    send_packet(
        tun_tx,
        key.server_ip,
        key.client_ip,
        key.server_port,
        key.client_port,
        server_seq,
        client_seq,
        TcpFlags {
            rst: true,
            ack: true,
            ..Default::default()
        },
        0,
        &[],
    );
}

/// Responds to an out-of-session non-SYN packet: the only valid reply is a
/// bare RST.
fn send_standalone_rst(tun_tx: &mpsc::UnboundedSender<Vec<u8>>, key: &FlowKey, seq: u32, ack: u32) {
    send_packet(
        tun_tx,
        key.server_ip,
        key.client_ip,
        key.server_port,
        key.client_port,
        seq,
        ack,
        TcpFlags {
            rst: true,
            ..Default::default()
        },
        0,
        &[],
    );
}

#[allow(clippy::too_many_arguments)]
fn send_packet(
    tun_tx: &mpsc::UnboundedSender<Vec<u8>>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) {
    let packet = packet::build_tcp_packet(src, dst, src_port, dst_port, seq, ack, flags, window, payload);
    let _ = tun_tx.send(packet);
}

/// The scaled window this flow currently advertises to the client (spec
/// §4.4.2 "Scaled window"), ready to drop straight into a wire packet.
fn advertised_window(st: &FlowState) -> u16 {
    st.calc_client_window(queued_bytes(&st.queue), 0).min(u16::MAX as u32) as u16
}

/// Parses the first TCP segment out of a raw IPv4 packet, for callers that
/// already know it's a TCP packet (used by tests and the TUN ingress path).
pub fn parse_tcp_from_ipv4(raw: &[u8]) -> Option<TcpSegment<'_>> {
    match packet::parse_ipv4(raw) {
        Ok(ParsedIpv4::Tcp(seg)) => Some(seg),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_queue_keeps_the_larger_duplicate() {
        let mut st = FlowState {
            state: TcpState::Established,
            connect_state: ConnectState::Established,
            client_seq: 100,
            server_seq_start: 0,
            server_seq: 0,
            acked_seq: 0,
            client_window: 65535,
            win_scale: 0,
            mss: DEFAULT_MSS,
            server_window: FALLBACK_SERVER_WINDOW,
            queue: BTreeMap::new(),
            fin_pending: false,
        };
        st.enqueue(100, vec![1, 2, 3]);
        st.enqueue(100, vec![9]); // smaller, should be dropped
        assert_eq!(st.queue.get(&100), Some(&vec![1, 2, 3]));
        st.enqueue(100, vec![1, 2, 3, 4]); // strictly larger, replaces
        assert_eq!(st.queue.get(&100), Some(&vec![1, 2, 3, 4]));
    }

    #[test]
    fn scaled_window_clamps_to_the_scaled_u16_max() {
        let st = FlowState {
            state: TcpState::Established,
            connect_state: ConnectState::Established,
            client_seq: 0,
            server_seq_start: 0,
            server_seq: 0,
            acked_seq: 0,
            client_window: 0,
            win_scale: 2,
            mss: DEFAULT_MSS,
            server_window: u32::MAX,
            queue: BTreeMap::new(),
            fin_pending: false,
        };
        let window = st.calc_client_window(0, 0);
        assert_eq!(window, u16::MAX as u32);
    }
}
