//! The per-flow UDP task: one task per client (src_ip, src_port, dst_ip,
//! dst_port) 4-tuple, torn down after 60s of inactivity.

use super::packet;
use crate::host::Host;
use crate::logger::{self, BreadcrumbFlags};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Idle timeout after which an unused UDP flow is torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const RECV_CHUNK: usize = 64 * 1024;

/// `dst_ipv4(4) | dst_port(2) | src_ipv4(4) | src_port(2)` ahead of the
/// inner payload, matching [`crate::udp_proxy`]'s encapsulation.
fn encode_envelope(dst: Ipv4Addr, dst_port: u16, src: Ipv4Addr, src_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&dst.octets());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_envelope(buf: &[u8]) -> Option<(Ipv4Addr, u16, Ipv4Addr, u16, &[u8])> {
    if buf.len() < 12 {
        return None;
    }
    let dst = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let dst_port = u16::from_be_bytes([buf[4], buf[5]]);
    let src = Ipv4Addr::new(buf[6], buf[7], buf[8], buf[9]);
    let src_port = u16::from_be_bytes([buf[10], buf[11]]);
    Some((dst, dst_port, src, src_port, &buf[12..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
}

pub struct FlowHandle {
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Spawns a new flow task for a freshly observed 4-tuple.
pub fn spawn(
    key: FlowKey,
    proxy_addr: std::net::SocketAddr,
    host: Arc<dyn Host>,
    tun_tx: mpsc::UnboundedSender<Vec<u8>>,
) -> FlowHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_flow(key, proxy_addr, host, tun_tx, rx));
    FlowHandle { tx }
}

/// Drives one UDP flow: forwards client datagrams to the local UDP proxy
/// (encapsulated), and proxy replies back into the tunnel as UDP/IPv4
/// datagrams. Exits after [`IDLE_TIMEOUT`] with no traffic in either
/// direction.
pub async fn run_flow(
    key: FlowKey,
    proxy_addr: std::net::SocketAddr,
    host: Arc<dyn Host>,
    tun_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut incoming_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let socket = match UdpSocket::bind(("127.0.0.1", 0)).await {
        Ok(socket) => socket,
        Err(error) => {
            logger::warn(format!("session: udp local bind failed for {key:?}: {error}"));
            return;
        }
    };
    if let Err(error) = socket.connect(proxy_addr).await {
        logger::warn(format!("session: udp proxy connect failed for {key:?}: {error}"));
        return;
    }
    if !host.protect_socket(std::os::fd::AsRawFd::as_raw_fd(&socket)) {
        logger::warn(format!("session: protect_socket declined for udp flow {key:?}"));
    }

    let mut recv_buf = vec![0u8; RECV_CHUNK];
    loop {
        tokio::select! {
            biased;
            maybe_payload = incoming_rx.recv() => {
                match maybe_payload {
                    Some(payload) => {
                        let envelope = encode_envelope(key.server_ip, key.server_port, key.client_ip, key.client_port, &payload);
                        if socket.send(&envelope).await.is_err() {
                            logger::debug(format!("session: udp send to proxy failed for {key:?}"));
                            break;
                        }
                    }
                    None => break,
                }
            }
            result = socket.recv(&mut recv_buf) => {
                match result {
                    Ok(n) => {
                        if let Some((_dst, _dst_port, src, src_port, inner)) = decode_envelope(&recv_buf[..n]) {
                            let packet = packet::build_udp_packet(src, key.client_ip, src_port, key.client_port, inner);
                            let _ = tun_tx.send(packet);
                        }
                    }
                    Err(error) => {
                        logger::debug(format!("session: udp recv failed for {key:?}: {error}"));
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                logger::breadcrumb(BreadcrumbFlags::UDP, format!("session: udp flow idle timeout for {key:?}"));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let dst = Ipv4Addr::new(93, 184, 216, 34);
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let encoded = encode_envelope(dst, 53, src, 40000, b"hello");
        let (d, dp, s, sp, payload) = decode_envelope(&encoded).unwrap();
        assert_eq!(d, dst);
        assert_eq!(dp, 53);
        assert_eq!(s, src);
        assert_eq!(sp, 40000);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(decode_envelope(&[0u8; 11]).is_none());
    }
}
