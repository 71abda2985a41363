//! Cumulative source-side statistics.
//!
//! Counters are monotonic and updated from the application, receive, and
//! timer threads; relaxed atomics suffice since no counter guards data.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by the transport.
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Wire bytes sent, data and control combined.
    pub(crate) bytes_sent: AtomicU64,
    /// Application payload bytes carried by ODATA.
    pub(crate) data_bytes_sent: AtomicU64,
    /// ODATA packets sent.
    pub(crate) data_msgs_sent: AtomicU64,
    /// Valid selective NAKs received.
    pub(crate) selective_naks_received: AtomicU64,
    /// Parity NAKs received, counted before the on-demand gate.
    pub(crate) parity_naks_received: AtomicU64,
    /// NAKs dropped by verification.
    pub(crate) malformed_naks: AtomicU64,
    /// Payload bytes carried by repairs.
    pub(crate) bytes_retransmitted: AtomicU64,
    /// Repair packets sent.
    pub(crate) msgs_retransmitted: AtomicU64,
    /// NNAK sequences received (primary plus list entries).
    pub(crate) nnaks_received: AtomicU64,
    /// NNAKs dropped by verification.
    pub(crate) nnak_errors: AtomicU64,
    /// SPM requests received.
    pub(crate) spmrs_received: AtomicU64,
    /// Inbound packets dropped for any reason.
    pub(crate) packets_discarded: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub data_bytes_sent: u64,
    pub data_msgs_sent: u64,
    pub selective_naks_received: u64,
    pub parity_naks_received: u64,
    pub malformed_naks: u64,
    pub bytes_retransmitted: u64,
    pub msgs_retransmitted: u64,
    pub nnaks_received: u64,
    pub nnak_errors: u64,
    pub spmrs_received: u64,
    pub packets_discarded: u64,
}

impl SourceStats {
    /// Copy all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            data_bytes_sent: self.data_bytes_sent.load(Ordering::Relaxed),
            data_msgs_sent: self.data_msgs_sent.load(Ordering::Relaxed),
            selective_naks_received: self.selective_naks_received.load(Ordering::Relaxed),
            parity_naks_received: self.parity_naks_received.load(Ordering::Relaxed),
            malformed_naks: self.malformed_naks.load(Ordering::Relaxed),
            bytes_retransmitted: self.bytes_retransmitted.load(Ordering::Relaxed),
            msgs_retransmitted: self.msgs_retransmitted.load(Ordering::Relaxed),
            nnaks_received: self.nnaks_received.load(Ordering::Relaxed),
            nnak_errors: self.nnak_errors.load(Ordering::Relaxed),
            spmrs_received: self.spmrs_received.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Relaxed add; counters never guard data.
#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Relaxed increment.
#[inline]
pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SourceStats::default();
        incr(&stats.data_msgs_sent);
        add(&stats.bytes_sent, 100);
        add(&stats.bytes_sent, 50);
        let snap = stats.snapshot();
        assert_eq!(snap.data_msgs_sent, 1);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.malformed_naks, 0);
    }
}
