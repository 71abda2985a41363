//! SPM scheduling and emission.
//!
//! SPMs carry the session identifier, a monotonic SPM sequence, and a
//! snapshot of the window extremities. After every data burst the cadence
//! restarts at the head of the heartbeat decay schedule and walks toward
//! the ambient interval; receivers use the decaying heartbeats to detect
//! loss at the tail of a burst quickly.

use std::time::{Duration, Instant};

use crate::packet;
use crate::stats;
use crate::transport::Transmitter;

use super::{Inner, Wake};

/// Heartbeat/ambient cadence state, guarded by the transport mutex.
///
/// The interval table is zero-led (index 0 marks the ambient state) and
/// zero-terminated, so `state` walks 1, 2, … until it reads the sentinel.
#[derive(Debug)]
pub(crate) struct SpmScheduler {
    spm_sqn: u32,
    intervals_us: Vec<u64>,
    ambient_us: u64,
    state: usize,
    next_spm: Instant,
}

impl SpmScheduler {
    pub fn new(ambient_us: u64, heartbeat_us: &[u64], now: Instant) -> Self {
        let mut intervals_us = Vec::with_capacity(heartbeat_us.len() + 2);
        intervals_us.push(0);
        intervals_us.extend_from_slice(heartbeat_us);
        intervals_us.push(0);
        SpmScheduler {
            spm_sqn: 0,
            intervals_us,
            ambient_us,
            state: 0,
            next_spm: now + Duration::from_micros(ambient_us),
        }
    }

    /// Deadline of the next SPM emission.
    pub fn next_deadline(&self) -> Instant {
        self.next_spm
    }

    /// Consume the next SPM sequence number.
    pub fn take_sqn(&mut self) -> u32 {
        let sqn = self.spm_sqn;
        self.spm_sqn = self.spm_sqn.wrapping_add(1);
        sqn
    }

    /// Restart the heartbeat schedule after a data transmission. Returns
    /// the new deadline.
    pub fn reset_heartbeat(&mut self, now: Instant) -> Instant {
        self.state = 1;
        self.next_spm = now + Duration::from_micros(self.intervals_us[self.state]);
        self.state += 1;
        self.next_spm
    }

    /// Move to the next deadline after an SPM has been emitted: walk the
    /// heartbeat schedule until the sentinel, then hold ambient cadence.
    pub fn advance(&mut self, now: Instant) -> Instant {
        let interval = self.intervals_us.get(self.state).copied().unwrap_or(0);
        if interval != 0 {
            self.state += 1;
            self.next_spm = now + Duration::from_micros(interval);
        } else {
            self.next_spm = now + Duration::from_micros(self.ambient_us);
        }
        self.next_spm
    }
}

/// Emit one SPM with a fresh sequence and a consistent `(trail, lead)`
/// snapshot. Rate-limited alongside data; sent with router alert.
pub(crate) fn send_spm<T: Transmitter>(inner: &Inner<T>) {
    // snapshot before taking the state lock; the window lock is never
    // acquired with the state lock held
    let (trail, lead) = {
        let window = inner.window.read();
        (window.trail(), window.lead())
    };

    let mut state = inner.state.lock();
    let spm_sqn = state.spm.take_sqn();
    let mut buf = std::mem::take(&mut state.spm_buf);
    packet::write_spm(
        &mut buf,
        inner.config.tsi,
        inner.config.dport,
        spm_sqn,
        trail,
        lead,
        inner.config.unicast,
    );
    tracing::trace!(
        target: "pgm_source::spm",
        spm_sqn,
        trail = %trail,
        lead = %lead,
        "send_spm"
    );

    let sent = inner.emit(&buf, true, true, false);
    if let Ok(sent) = sent {
        if sent == buf.len() {
            stats::add(&inner.stats.bytes_sent, buf.len() as u64);
        }
    }
    state.spm_buf = buf;
}

/// Cancel any pending heartbeat SPM and restart the decay schedule,
/// prodding the timer thread when the new deadline precedes its current
/// wakeup.
pub(crate) fn reset_heartbeat_spm<T: Transmitter>(inner: &Inner<T>) {
    let mut state = inner.state.lock();
    if state.closed {
        return;
    }
    let next = state.spm.reset_heartbeat(Instant::now());
    if next < state.next_poll {
        state.next_poll = next;
        tracing::trace!(target: "pgm_source::spm", "prod timer thread");
        drop(state);
        inner.wake(Wake::Reschedule);
    }
}

/// Restart the decay schedule from the timer thread itself; no prod
/// needed, the caller recomputes its own sleep.
pub(crate) fn reset_heartbeat_inline<T: Transmitter>(inner: &Inner<T>) {
    let mut state = inner.state.lock();
    let next = state.spm.reset_heartbeat(Instant::now());
    state.next_poll = state.next_poll.min(next);
}
