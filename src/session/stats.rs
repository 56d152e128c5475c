//! Session manager counters: plain atomics, snapshotted into an owned
//! struct for reporting so the host never touches the live atomics directly.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counters {
    pub ip_packets_total: AtomicU64,
    pub upstream_bytes_total: AtomicU64,
    pub invalid_ipv4_total: AtomicU64,
    pub ipv6_dropped_total: AtomicU64,
    pub icmp_dropped_total: AtomicU64,
    pub invalid_tcp_total: AtomicU64,
    pub invalid_udp_total: AtomicU64,
    pub tcp_admission_failures_total: AtomicU64,
    pub udp_admission_failures_total: AtomicU64,
}

/// A point-in-time copy of [`Counters`], safe to hand to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub ip_packets_total: u64,
    pub upstream_bytes_total: u64,
    pub invalid_ipv4_total: u64,
    pub ipv6_dropped_total: u64,
    pub icmp_dropped_total: u64,
    pub invalid_tcp_total: u64,
    pub invalid_udp_total: u64,
    pub tcp_admission_failures_total: u64,
    pub udp_admission_failures_total: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            ip_packets_total: self.ip_packets_total.load(Ordering::Relaxed),
            upstream_bytes_total: self.upstream_bytes_total.load(Ordering::Relaxed),
            invalid_ipv4_total: self.invalid_ipv4_total.load(Ordering::Relaxed),
            ipv6_dropped_total: self.ipv6_dropped_total.load(Ordering::Relaxed),
            icmp_dropped_total: self.icmp_dropped_total.load(Ordering::Relaxed),
            invalid_tcp_total: self.invalid_tcp_total.load(Ordering::Relaxed),
            invalid_udp_total: self.invalid_udp_total.load(Ordering::Relaxed),
            tcp_admission_failures_total: self.tcp_admission_failures_total.load(Ordering::Relaxed),
            udp_admission_failures_total: self.udp_admission_failures_total.load(Ordering::Relaxed),
        }
    }

    pub fn add_ip_packet(&self, bytes: usize) {
        self.ip_packets_total.fetch_add(1, Ordering::Relaxed);
        self.upstream_bytes_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_packets() {
        let counters = Counters::default();
        counters.add_ip_packet(64);
        counters.add_ip_packet(128);
        counters.icmp_dropped_total.fetch_add(1, Ordering::Relaxed);
        let snap = counters.snapshot();
        assert_eq!(snap.ip_packets_total, 2);
        assert_eq!(snap.upstream_bytes_total, 192);
        assert_eq!(snap.icmp_dropped_total, 1);
    }
}
