//! The send-side protocol engine.
//!
//! A [`Source`] owns the transmit window, the SPM scheduler, the rate
//! controller, and a timer thread that services repair requests and SPM
//! deadlines. Application threads push APDUs through the send paths; the
//! receive thread feeds inbound control packets to
//! [`Source::handle_control`]; the timer thread wakes on an internal
//! notify channel.
//!
//! Lock discipline: the window lock is never acquired while holding the
//! transport state lock, and the rate controller is acquired last.

mod nak;
mod send;
mod spm;
mod timer;

use std::net::IpAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::fec::ReedSolomon;
use crate::packet::{self, Tsi};
use crate::rate::RateLimiter;
use crate::stats::{SourceStats, StatsSnapshot};
use crate::transport::Transmitter;
use crate::window::TransmitWindow;
use crate::PgmError;

pub use send::{SendFlags, TsduBuffer};

/// Default ambient SPM interval, microseconds.
const DEFAULT_AMBIENT_SPM_US: u64 = 30_000_000;

/// Default heartbeat SPM decay schedule, microseconds.
const DEFAULT_HEARTBEAT_SPM_US: &[u64] = &[
    100_000, 100_000, 100_000, 100_000, 1_300_000, 7_000_000, 10_000_000, 10_000_000, 10_000_000,
];

/// Default maximum TPDU, the conventional Ethernet MTU.
const DEFAULT_MAX_TPDU: usize = 1500;

/// Default IP header allowance for wire-size accounting.
const DEFAULT_IPHDR_LEN: usize = 20;

/// Immutable post-bind configuration.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub tsi: Tsi,
    pub dport: u16,
    /// Multicast group the session sends to; NAK group NLAs must match.
    pub group: IpAddr,
    /// This host's unicast address: the SPM path NLA, and the address NAK
    /// source NLAs must match.
    pub unicast: IpAddr,
    pub max_tpdu: usize,
    pub iphdr_len: usize,
    /// Largest TSDU of an unfragmented packet.
    pub max_tsdu: usize,
    /// Largest TSDU of a fragment (OPT_FRAGMENT overhead deducted).
    pub max_tsdu_fragment: usize,
    pub txw_sqns: u32,
    pub use_ondemand_parity: bool,
    pub use_proactive_parity: bool,
    pub rs: Option<ReedSolomon>,
    /// Transmission groups span `1 << tg_sqn_shift` sequences.
    pub tg_sqn_shift: u8,
}

/// Mutable state under the transport mutex.
#[derive(Debug)]
pub(crate) struct TransportState {
    pub closed: bool,
    pub spm: spm::SpmScheduler,
    /// The instant the timer thread is currently sleeping toward.
    pub next_poll: Instant,
    /// Last answered SPMR, for the IHB_MIN response holdoff.
    pub spmr_answered_at: Option<Instant>,
    /// Recycled SPM serialization buffer.
    pub spm_buf: Vec<u8>,
}

/// Timer-thread wakeup events. `Repair` and `Reschedule` are the two
/// notify channels of the classic design folded into one edge-triggered
/// queue; `Shutdown` asks for a final drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Repair,
    Reschedule,
    Shutdown,
}

pub(crate) struct Inner<T> {
    pub config: Config,
    pub window: RwLock<TransmitWindow>,
    pub state: Mutex<TransportState>,
    pub rate: Option<Mutex<RateLimiter>>,
    pub send_state: Mutex<send::SendState>,
    pub stats: SourceStats,
    pub transmitter: T,
    pub wake_tx: mpsc::Sender<Wake>,
}

impl<T: Transmitter> Inner<T> {
    /// Put one TPDU on the wire, optionally gated by the rate controller.
    ///
    /// Returns the byte count reported by the transmitter; `RateLimited`
    /// and `WouldBlock` are surfaced for the caller's retry logic, any
    /// other transmit failure is swallowed (the window is the durable
    /// record, receivers will NAK).
    pub fn emit(
        &self,
        tpdu: &[u8],
        rate_limited: bool,
        router_alert: bool,
        nonblocking: bool,
    ) -> Result<usize, PgmError> {
        if rate_limited {
            if let Some(rate) = &self.rate {
                if !rate.lock().check(tpdu.len() + self.config.iphdr_len, nonblocking) {
                    return Err(PgmError::RateLimited);
                }
            }
        }
        match self.transmitter.send_to_group(tpdu, router_alert) {
            Ok(sent) => Ok(sent),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Err(PgmError::WouldBlock),
            Err(err) => {
                tracing::debug!(error = %err, "transmit failed, leaving repair to NAKs");
                Ok(0)
            }
        }
    }

    /// Reserve rate tokens for a whole batch up front, or refuse without
    /// emitting anything.
    pub fn reserve_rate(&self, wire_bytes: usize) -> Result<(), PgmError> {
        if let Some(rate) = &self.rate {
            if !rate.lock().check(wire_bytes, true) {
                return Err(PgmError::RateLimited);
            }
        }
        Ok(())
    }

    pub fn wake(&self, wake: Wake) {
        // the timer thread owns the receiving end for the transport's
        // whole life; a send failure means shutdown is already under way
        let _ = self.wake_tx.send(wake);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Unbound source transport under configuration.
///
/// Every setter validates eagerly and fails with [`PgmError::AlreadyBound`]
/// once [`SourceBuilder::bind`] has succeeded; the bound configuration is
/// immutable.
#[derive(Debug)]
pub struct SourceBuilder {
    tsi: Tsi,
    dport: u16,
    group: IpAddr,
    unicast: IpAddr,
    max_tpdu: usize,
    iphdr_len: usize,
    txw_sqns: u32,
    txw_secs: u32,
    txw_max_rte: u64,
    txw_preallocate: u32,
    ambient_spm_us: u64,
    heartbeat_spm_us: Vec<u64>,
    use_ondemand_parity: bool,
    use_proactive_parity: bool,
    rs_n: u8,
    rs_k: u8,
    bound: bool,
}

impl SourceBuilder {
    /// Start configuring a source session identified by `tsi`, sending to
    /// `group`:`dport`, with `unicast` as this host's path address.
    pub fn new(tsi: Tsi, dport: u16, group: IpAddr, unicast: IpAddr) -> Self {
        SourceBuilder {
            tsi,
            dport,
            group,
            unicast,
            max_tpdu: DEFAULT_MAX_TPDU,
            iphdr_len: DEFAULT_IPHDR_LEN,
            txw_sqns: 0,
            txw_secs: 0,
            txw_max_rte: 0,
            txw_preallocate: 0,
            ambient_spm_us: DEFAULT_AMBIENT_SPM_US,
            heartbeat_spm_us: DEFAULT_HEARTBEAT_SPM_US.to_vec(),
            use_ondemand_parity: false,
            use_proactive_parity: false,
            rs_n: 0,
            rs_k: 0,
            bound: false,
        }
    }

    fn check_unbound(&self) -> Result<(), PgmError> {
        if self.bound {
            Err(PgmError::AlreadyBound)
        } else {
            Ok(())
        }
    }

    /// Ambient SPM cadence in microseconds, the steady-state heartbeat
    /// once the decay schedule has run out.
    pub fn ambient_spm_interval(&mut self, micros: u64) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if micros == 0 {
            return Err(PgmError::Invalid);
        }
        self.ambient_spm_us = micros;
        Ok(self)
    }

    /// Heartbeat SPM decay schedule in microseconds, walked from the first
    /// entry after each data burst.
    pub fn heartbeat_spm_intervals(&mut self, micros: &[u64]) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if micros.is_empty() || micros.contains(&0) {
            return Err(PgmError::Invalid);
        }
        self.heartbeat_spm_us = micros.to_vec();
        Ok(self)
    }

    /// Transmit window size in sequence numbers.
    pub fn txw_sqns(&mut self, sqns: u32) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if sqns == 0 || sqns >= u32::MAX / 2 - 1 {
            return Err(PgmError::Invalid);
        }
        self.txw_sqns = sqns;
        Ok(self)
    }

    /// Transmit window size in seconds; effective only together with
    /// [`SourceBuilder::txw_max_rte`].
    pub fn txw_secs(&mut self, secs: u32) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if secs == 0 {
            return Err(PgmError::Invalid);
        }
        self.txw_secs = secs;
        Ok(self)
    }

    /// Egress budget in bytes per second; zero (the default) leaves the
    /// rate controller off.
    pub fn txw_max_rte(&mut self, max_rte: u64) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if max_rte == 0 {
            return Err(PgmError::Invalid);
        }
        self.txw_max_rte = max_rte;
        Ok(self)
    }

    /// Packet records to preallocate at bind; capped by the window size.
    pub fn txw_preallocate(&mut self, sqns: u32) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if sqns == 0 {
            return Err(PgmError::Invalid);
        }
        self.txw_preallocate = sqns;
        Ok(self)
    }

    /// Maximum TPDU size, inclusive of the IP header allowance.
    pub fn max_tpdu(&mut self, max_tpdu: usize) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if max_tpdu < DEFAULT_IPHDR_LEN + packet::PKT_OFFSET_FRAGMENT + 1 || max_tpdu > u16::MAX as usize {
            return Err(PgmError::Invalid);
        }
        self.max_tpdu = max_tpdu;
        Ok(self)
    }

    /// IP header allowance used for wire-size accounting and rate control.
    pub fn iphdr_len(&mut self, iphdr_len: usize) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        self.iphdr_len = iphdr_len;
        Ok(self)
    }

    /// Enable forward error correction with Reed–Solomon parameters
    /// `(n, k)`: transmission groups of `k = 2^shift` original packets
    /// with `n - k` parity packets available, answered on demand and/or
    /// proactively at group closure.
    pub fn fec(&mut self, n: u8, k: u8, ondemand: bool, proactive: bool) -> Result<&mut Self, PgmError> {
        self.check_unbound()?;
        if !k.is_power_of_two() || k < 2 || k >= n {
            return Err(PgmError::Invalid);
        }
        self.rs_n = n;
        self.rs_k = k;
        self.use_ondemand_parity = ondemand;
        self.use_proactive_parity = proactive;
        Ok(self)
    }

    /// Validate the configuration, spawn the timer thread, and transition
    /// to the bound-and-open state.
    pub fn bind<T>(&mut self, transmitter: T) -> Result<Source<T>, PgmError>
    where
        T: Transmitter + Send + Sync + 'static,
    {
        self.check_unbound()?;

        // the TPDU must hold a fragmented data packet with at least one
        // payload byte after the IP header allowance
        if self.max_tpdu < self.iphdr_len + packet::PKT_OFFSET_FRAGMENT + 1 {
            return Err(PgmError::Invalid);
        }

        let txw_sqns = if self.txw_sqns > 0 {
            self.txw_sqns
        } else if self.txw_secs > 0 && self.txw_max_rte > 0 {
            let derived = (u64::from(self.txw_secs) * self.txw_max_rte / self.max_tpdu as u64)
                .clamp(1, u64::from(u32::MAX / 2 - 2));
            derived as u32
        } else {
            return Err(PgmError::Invalid);
        };
        if self.txw_preallocate > txw_sqns {
            return Err(PgmError::Invalid);
        }

        let wants_parity = self.use_ondemand_parity || self.use_proactive_parity;
        let rs = if wants_parity {
            Some(ReedSolomon::new(self.rs_n, self.rs_k)?)
        } else {
            None
        };
        let tg_sqn_shift = if wants_parity { self.rs_k.trailing_zeros() as u8 } else { 0 };

        let max_tsdu = self.max_tpdu - self.iphdr_len - packet::PKT_OFFSET_PLAIN;
        let max_tsdu_fragment = self.max_tpdu - self.iphdr_len - packet::PKT_OFFSET_FRAGMENT;

        let config = Config {
            tsi: self.tsi,
            dport: self.dport,
            group: self.group,
            unicast: self.unicast,
            max_tpdu: self.max_tpdu,
            iphdr_len: self.iphdr_len,
            max_tsdu,
            max_tsdu_fragment,
            txw_sqns,
            use_ondemand_parity: self.use_ondemand_parity,
            use_proactive_parity: self.use_proactive_parity,
            rs,
            tg_sqn_shift,
        };

        let now = Instant::now();
        let scheduler = spm::SpmScheduler::new(self.ambient_spm_us, &self.heartbeat_spm_us, now);
        let next_poll = scheduler.next_deadline();
        let (wake_tx, wake_rx) = mpsc::channel();

        let inner = Arc::new(Inner {
            config,
            window: RwLock::new(TransmitWindow::new(txw_sqns, tg_sqn_shift)),
            state: Mutex::new(TransportState {
                closed: false,
                spm: scheduler,
                next_poll,
                spmr_answered_at: None,
                spm_buf: Vec::new(),
            }),
            rate: (self.txw_max_rte > 0).then(|| Mutex::new(RateLimiter::new(self.txw_max_rte))),
            send_state: Mutex::new(send::SendState::default()),
            stats: SourceStats::default(),
            transmitter,
            wake_tx,
        });

        let timer_inner = Arc::clone(&inner);
        let timer = std::thread::Builder::new()
            .name("pgm-timer".into())
            .spawn(move || timer::run(timer_inner, wake_rx))
            .map_err(|_| PgmError::Invalid)?;

        self.bound = true;
        Ok(Source { inner, timer: Mutex::new(Some(timer)) })
    }
}

/// A bound, open source transport.
pub struct Source<T: Transmitter + Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transmitter + Send + Sync + 'static> Source<T> {
    /// Session identifier.
    pub fn tsi(&self) -> Tsi {
        self.inner.config.tsi
    }

    /// Largest APDU that fits a single unfragmented packet.
    pub fn max_tsdu(&self) -> usize {
        self.inner.config.max_tsdu
    }

    /// Largest APDU acceptable at all (window capacity in fragments).
    pub fn max_apdu(&self) -> usize {
        self.inner.config.txw_sqns as usize * self.inner.config.max_tsdu_fragment
    }

    /// Copy one APDU into the window and send it, fragmenting as needed.
    /// Returns the number of application bytes accepted.
    pub fn send(&self, apdu: &[u8], flags: SendFlags) -> Result<usize, PgmError> {
        send::send(&self.inner, apdu, flags)
    }

    /// Gather-send `parts`. With `one_apdu` the parts form a single APDU;
    /// otherwise every part is its own APDU.
    pub fn send_vectored(&self, parts: &[&[u8]], one_apdu: bool, flags: SendFlags) -> Result<usize, PgmError> {
        send::send_vectored(&self.inner, parts, one_apdu, flags)
    }

    /// Zero-copy send of buffers previously obtained from
    /// [`Source::alloc_tsdu`], each already carrying header reservation.
    pub fn send_buffers(&self, bufs: Vec<TsduBuffer>, one_apdu: bool, flags: SendFlags) -> Result<usize, PgmError> {
        send::send_buffers(&self.inner, bufs, one_apdu, flags)
    }

    /// Allocate a TSDU buffer with reserved header room for
    /// [`Source::send_buffers`].
    pub fn alloc_tsdu(&self) -> TsduBuffer {
        TsduBuffer::with_reserve(self.inner.config.max_tpdu - self.inner.config.iphdr_len)
    }

    /// Receive-thread entry point: decode and dispatch one inbound control
    /// TPDU (SPMR, NAK, NNAK). Codec failures are counted, never returned.
    pub fn handle_control(&self, tpdu: &[u8]) {
        nak::handle_control(&self.inner, tpdu);
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Close the transport: subsequent sends fail with `Closed`, the timer
    /// thread drains the repair queue once and exits. In-flight sends
    /// complete normally.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.wake(Wake::Shutdown);
        if let Some(timer) = self.timer.lock().take() {
            let _ = timer.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner<T>> {
        &self.inner
    }
}

impl<T: Transmitter + Send + Sync + 'static> Drop for Source<T> {
    fn drop(&mut self) {
        self.close();
    }
}
