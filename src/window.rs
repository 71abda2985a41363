//! Transmit window: a bounded ring of sent packets indexed by sequence
//! number, plus the retransmit queue that feeds the repair path.
//!
//! The window owns every ODATA TPDU for as long as repairs may reference
//! it. `add` never blocks: on overflow the trailing (oldest) record is
//! released and the trail advances, which is the sender's prerogative
//! under receiver-reliability. The retransmit queue keeps its own lock so
//! the receive thread can enqueue repair requests while the application
//! thread holds the window for writing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;

use crate::packet::{self, OPT_PRESENT};
use crate::sqn::Sqn;
use crate::PgmError;

/// One transmitted ODATA packet, retained for repair.
///
/// Records are immutable once inserted except for parity-alignment zero
/// padding, which is applied at most once.
#[derive(Debug)]
pub struct PacketRecord {
    sqn: Sqn,
    tstamp: Instant,
    /// TPDU storage: optional unused headroom, header, options, TSDU
    /// (and, after padding, alignment bytes plus the 16-bit true-length
    /// trailer).
    buf: Vec<u8>,
    /// Offset where the PGM header begins (buffers handed in by the
    /// zero-copy path may carry leftover headroom in front).
    start: usize,
    /// Offset where the TSDU begins.
    tsdu_offset: usize,
    /// Offset of the OPT_FRAGMENT payload, when the packet carries one.
    opt_fragment_offset: Option<usize>,
    tsdu_len: u16,
    /// Unfolded TSDU checksum memoized at first transmission.
    partial_csum: u32,
    zero_padded: bool,
}

impl PacketRecord {
    pub fn new(
        sqn: Sqn,
        buf: Vec<u8>,
        start: usize,
        tsdu_offset: usize,
        opt_fragment_offset: Option<usize>,
        tsdu_len: u16,
        partial_csum: u32,
    ) -> Self {
        debug_assert_eq!(buf.len(), tsdu_offset + tsdu_len as usize);
        debug_assert!(start < tsdu_offset);
        PacketRecord {
            sqn,
            tstamp: Instant::now(),
            buf,
            start,
            tsdu_offset,
            opt_fragment_offset,
            tsdu_len,
            partial_csum,
            zero_padded: false,
        }
    }

    #[inline]
    pub fn sqn(&self) -> Sqn {
        self.sqn
    }

    #[inline]
    pub fn tstamp(&self) -> Instant {
        self.tstamp
    }

    #[inline]
    pub fn tsdu_len(&self) -> u16 {
        self.tsdu_len
    }

    #[inline]
    pub fn partial_csum(&self) -> u32 {
        self.partial_csum
    }

    /// The packet as transmitted, padding excluded.
    #[inline]
    pub fn tpdu(&self) -> &[u8] {
        &self.buf[self.start..self.tsdu_offset + self.tsdu_len as usize]
    }

    #[inline]
    pub fn tsdu(&self) -> &[u8] {
        &self.buf[self.tsdu_offset..self.tsdu_offset + self.tsdu_len as usize]
    }

    /// Whether the packet carries any options.
    #[inline]
    pub fn has_options(&self) -> bool {
        self.buf[self.start + 5] & OPT_PRESENT != 0
    }

    /// The 13-byte OPT_FRAGMENT payload, if present.
    pub fn fragment_payload(&self) -> Option<&[u8]> {
        self.opt_fragment_offset
            .map(|at| &self.buf[at..at + packet::OPT_FRAGMENT_LEN])
    }

    /// Zero-pad the TSDU up to `parity_len` bytes and append the true
    /// length as a 16-bit trailer. Idempotent; repeated parity synthesis
    /// over the same group sees identical bytes.
    pub fn zero_pad(&mut self, parity_len: u16) {
        debug_assert!(parity_len >= self.tsdu_len);
        if self.zero_padded {
            return;
        }
        self.buf.resize(self.tsdu_offset + parity_len as usize, 0);
        self.buf.extend_from_slice(&self.tsdu_len.to_be_bytes());
        self.zero_padded = true;
    }

    #[inline]
    pub fn is_zero_padded(&self) -> bool {
        self.zero_padded
    }

    /// TSDU view spanning `len` bytes, used as a parity source block.
    #[inline]
    pub fn parity_source(&self, len: usize) -> &[u8] {
        &self.buf[self.tsdu_offset..self.tsdu_offset + len]
    }
}

/// A pending repair. For parity requests `sqn` encodes the transmission
/// group base ORed with the allocated parity index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairRequest {
    pub sqn: Sqn,
    pub is_parity: bool,
}

impl RepairRequest {
    fn key(&self) -> u64 {
        u64::from(self.sqn.0) | (u64::from(self.is_parity) << 32)
    }
}

#[derive(Debug, Default)]
struct RetransmitState {
    queue: VecDeque<RepairRequest>,
    /// Requests currently queued, for duplicate suppression.
    queued: HashSet<u64>,
    /// Next parity index per transmission group base; indices are handed
    /// out monotonically for the lifetime of the group in the window.
    parity_next: HashMap<u32, u32>,
}

/// Bounded transmit window.
#[derive(Debug)]
pub struct TransmitWindow {
    slots: Vec<Option<PacketRecord>>,
    size: u32,
    trail: Sqn,
    lead: Sqn,
    count: u32,
    tg_sqn_shift: u8,
    retransmit: Mutex<RetransmitState>,
}

impl TransmitWindow {
    /// Create a window holding up to `txw_sqns` packets. `tg_sqn_shift`
    /// is the transmission-group size exponent (zero when FEC is off).
    pub fn new(txw_sqns: u32, tg_sqn_shift: u8) -> Self {
        debug_assert!(txw_sqns > 0 && txw_sqns < u32::MAX / 2 - 1);
        let mut slots = Vec::with_capacity(txw_sqns as usize);
        slots.resize_with(txw_sqns as usize, || None);
        TransmitWindow {
            slots,
            size: txw_sqns,
            trail: Sqn::ZERO,
            lead: Sqn::ZERO.prev(),
            count: 0,
            tg_sqn_shift,
            retransmit: Mutex::new(RetransmitState::default()),
        }
    }

    /// The sequence the next `add` will occupy.
    #[inline]
    pub fn next_lead(&self) -> Sqn {
        self.lead.next()
    }

    #[inline]
    pub fn trail(&self) -> Sqn {
        self.trail
    }

    #[inline]
    pub fn lead(&self) -> Sqn {
        self.lead
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn slot_of(&self, sqn: Sqn) -> usize {
        (sqn.0 % self.size) as usize
    }

    /// Append a record at the next lead, evicting the trailing record when
    /// the window is full. Never blocks.
    pub fn add(&mut self, record: PacketRecord) {
        debug_assert_eq!(record.sqn(), self.next_lead());
        if self.count == self.size {
            let trail_slot = self.slot_of(self.trail);
            if let Some(evicted) = self.slots[trail_slot].take() {
                // the group can no longer be parity-encoded once its first
                // member leaves the window
                if evicted.sqn().tg_offset(self.tg_sqn_shift) == 0 {
                    self.retransmit
                        .get_mut()
                        .parity_next
                        .remove(&evicted.sqn().tg_base(self.tg_sqn_shift).0);
                }
            }
            self.trail = self.trail.next();
            self.count -= 1;
        }
        self.lead = self.lead.next();
        let slot = self.slot_of(self.lead);
        self.slots[slot] = Some(record);
        self.count += 1;
    }

    /// Random access within `[trail, lead]`.
    pub fn peek(&self, sqn: Sqn) -> Option<&PacketRecord> {
        if self.count == 0 || !sqn.in_window(self.trail, self.lead) {
            return None;
        }
        self.slots[self.slot_of(sqn)]
            .as_ref()
            .filter(|record| record.sqn() == sqn)
    }

    /// Mutable access, used only for parity zero padding.
    pub fn peek_mut(&mut self, sqn: Sqn) -> Option<&mut PacketRecord> {
        if self.count == 0 || !sqn.in_window(self.trail, self.lead) {
            return None;
        }
        let slot = self.slot_of(sqn);
        self.slots[slot]
            .as_mut()
            .filter(|record| record.sqn() == sqn)
    }

    /// Queue a repair request.
    ///
    /// Returns `Ok(true)` when newly queued, `Ok(false)` when coalesced
    /// with an already-queued request for the same sequence, and
    /// `OutOfWindow` when the sequence (or, for parity, its whole
    /// transmission group) has left the window.
    pub fn retransmit_push(&self, sqn: Sqn, is_parity: bool) -> Result<bool, PgmError> {
        let mut state = self.retransmit.lock();
        let request = if is_parity {
            let tg = sqn.tg_base(self.tg_sqn_shift);
            let tg_last = tg.add((1u32 << self.tg_sqn_shift) - 1);
            if self.count == 0 || self.lead.lt(tg) || tg_last.lt(self.trail) {
                return Err(PgmError::OutOfWindow);
            }
            let next = state.parity_next.entry(tg.0).or_insert(0);
            let h = *next;
            *next += 1;
            let h_mask = !(!0u32 << self.tg_sqn_shift);
            RepairRequest { sqn: Sqn(tg.0 | (h & h_mask)), is_parity: true }
        } else {
            if self.count == 0 || !sqn.in_window(self.trail, self.lead) {
                return Err(PgmError::OutOfWindow);
            }
            RepairRequest { sqn, is_parity: false }
        };

        if !state.queued.insert(request.key()) {
            return Ok(false);
        }
        state.queue.push_back(request);
        Ok(true)
    }

    /// Read the head repair request without removing it, leaving duplicate
    /// suppression active until the repair has actually been sent.
    pub fn retransmit_try_peek(&self) -> Option<RepairRequest> {
        self.retransmit.lock().queue.front().copied()
    }

    /// Drop the head request, re-enabling NAK processing for it.
    pub fn retransmit_remove_head(&self) {
        let mut state = self.retransmit.lock();
        if let Some(request) = state.queue.pop_front() {
            state.queued.remove(&request.key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sqn: Sqn, payload: &[u8]) -> PacketRecord {
        let mut buf = vec![0u8; 24];
        buf.extend_from_slice(payload);
        PacketRecord::new(sqn, buf, 0, 24, None, payload.len() as u16, 0)
    }

    fn window_with(sqns: u32, shift: u8, packets: u32) -> TransmitWindow {
        let mut window = TransmitWindow::new(sqns, shift);
        for i in 0..packets {
            window.add(record(Sqn(i), &[i as u8]));
        }
        window
    }

    #[test]
    fn test_empty_window() {
        let window = TransmitWindow::new(8, 0);
        assert_eq!(window.next_lead(), Sqn(0));
        assert_eq!(window.trail(), Sqn(0));
        assert!(window.is_empty());
        assert!(window.peek(Sqn(0)).is_none());
    }

    #[test]
    fn test_add_and_peek() {
        let window = window_with(8, 0, 3);
        assert_eq!(window.trail(), Sqn(0));
        assert_eq!(window.lead(), Sqn(2));
        assert_eq!(window.peek(Sqn(1)).unwrap().tsdu(), &[1]);
        assert!(window.peek(Sqn(3)).is_none());
    }

    #[test]
    fn test_overflow_advances_trail() {
        let window = window_with(4, 0, 6);
        assert_eq!(window.trail(), Sqn(2));
        assert_eq!(window.lead(), Sqn(5));
        assert_eq!(window.len(), 4);
        assert!(window.peek(Sqn(1)).is_none());
        assert_eq!(window.peek(Sqn(2)).unwrap().tsdu(), &[2]);
        assert_eq!(window.peek(Sqn(5)).unwrap().tsdu(), &[5]);
    }

    #[test]
    fn test_retransmit_push_and_drain() {
        let window = window_with(8, 0, 4);
        assert_eq!(window.retransmit_push(Sqn(1), false), Ok(true));
        assert_eq!(window.retransmit_push(Sqn(2), false), Ok(true));
        let head = window.retransmit_try_peek().unwrap();
        assert_eq!(head, RepairRequest { sqn: Sqn(1), is_parity: false });
        window.retransmit_remove_head();
        let head = window.retransmit_try_peek().unwrap();
        assert_eq!(head.sqn, Sqn(2));
        window.retransmit_remove_head();
        assert!(window.retransmit_try_peek().is_none());
    }

    #[test]
    fn test_retransmit_duplicate_suppression() {
        let window = window_with(8, 0, 4);
        assert_eq!(window.retransmit_push(Sqn(1), false), Ok(true));
        assert_eq!(window.retransmit_push(Sqn(1), false), Ok(false));
        // still suppressed while at the head
        assert_eq!(window.retransmit_try_peek().unwrap().sqn, Sqn(1));
        assert_eq!(window.retransmit_push(Sqn(1), false), Ok(false));
        // a fresh request is accepted once the repair completes
        window.retransmit_remove_head();
        assert_eq!(window.retransmit_push(Sqn(1), false), Ok(true));
    }

    #[test]
    fn test_retransmit_out_of_window() {
        let window = window_with(4, 0, 6);
        assert_eq!(window.retransmit_push(Sqn(1), false), Err(PgmError::OutOfWindow));
        assert_eq!(window.retransmit_push(Sqn(6), false), Err(PgmError::OutOfWindow));
    }

    #[test]
    fn test_parity_index_allocation() {
        // groups of 4
        let window = window_with(16, 2, 8);
        assert_eq!(window.retransmit_push(Sqn(0), true), Ok(true));
        let first = window.retransmit_try_peek().unwrap();
        assert!(first.is_parity);
        assert_eq!(first.sqn, Sqn(0));

        // second request for the same group takes the next index and is
        // not a duplicate of the first
        assert_eq!(window.retransmit_push(Sqn(2), true), Ok(true));
        window.retransmit_remove_head();
        let second = window.retransmit_try_peek().unwrap();
        assert_eq!(second.sqn, Sqn(1));

        // a different group allocates independently
        assert_eq!(window.retransmit_push(Sqn(5), true), Ok(true));
        window.retransmit_remove_head();
        assert_eq!(window.retransmit_try_peek().unwrap().sqn, Sqn(4));
    }

    #[test]
    fn test_parity_out_of_window_group() {
        let mut window = window_with(4, 2, 8);
        // window now holds 4..7, group 0..3 is gone
        assert_eq!(window.trail(), Sqn(4));
        assert_eq!(window.retransmit_push(Sqn(1), true), Err(PgmError::OutOfWindow));
        assert_eq!(window.retransmit_push(Sqn(4), true), Ok(true));

        // evicting the base of group 4 resets its parity bookkeeping
        for i in 8..12 {
            window.add(record(Sqn(i), &[i as u8]));
        }
        assert_eq!(window.retransmit_push(Sqn(4), true), Err(PgmError::OutOfWindow));
    }

    #[test]
    fn test_zero_pad_idempotent() {
        let mut rec = record(Sqn(0), &[1, 2, 3]);
        rec.zero_pad(5);
        assert!(rec.is_zero_padded());
        let first: Vec<u8> = rec.parity_source(7).to_vec();
        assert_eq!(&first[3..5], &[0, 0]);
        assert_eq!(&first[5..7], &3u16.to_be_bytes());
        rec.zero_pad(5);
        assert_eq!(rec.parity_source(7), first.as_slice());
        // the transmitted TPDU is unchanged by padding
        assert_eq!(rec.tsdu(), &[1, 2, 3]);
    }
}
