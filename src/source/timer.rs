//! Timer thread: repair-queue drain, parity synthesis, SPM deadlines.
//!
//! The thread sleeps on the wake channel with a timeout equal to the next
//! SPM deadline. Each `Repair` wake services exactly one queued request,
//! matching the one-token-per-push discipline of the notify channel;
//! `Reschedule` just recomputes the sleep after a heartbeat reset moved
//! the deadline closer; `Shutdown` drains the queue once and exits.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use crate::checksum;
use crate::packet::{
    self, OPT_END, OPT_FRAGMENT, OPT_FRAGMENT_LEN, OPT_HEADER_LEN, OPT_LENGTH, OPT_LENGTH_LEN,
    OPT_PARITY, OPT_PRESENT, OPT_VAR_PKTLEN, OP_ENCODED, OP_ENCODED_NULL,
};
use crate::sqn::Sqn;
use crate::stats;
use crate::transport::Transmitter;
use crate::window::RepairRequest;

use super::{spm, Inner, Wake};

pub(crate) fn run<T: Transmitter>(inner: Arc<Inner<T>>, wake_rx: Receiver<Wake>) {
    let mut scratch = Vec::with_capacity(inner.config.max_tpdu);
    loop {
        let deadline = {
            let mut state = inner.state.lock();
            let deadline = state.spm.next_deadline();
            state.next_poll = deadline;
            deadline
        };
        let timeout = deadline.saturating_duration_since(Instant::now());

        match wake_rx.recv_timeout(timeout) {
            Ok(Wake::Repair) => {
                service_one_repair(&inner, &mut scratch);
            }
            Ok(Wake::Reschedule) => {}
            Ok(Wake::Shutdown) => {
                while service_one_repair(&inner, &mut scratch) {}
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                // a send may have pushed the schedule later while we slept
                let due = inner.state.lock().spm.next_deadline() <= Instant::now();
                if due {
                    spm::send_spm(&inner);
                    inner.state.lock().spm.advance(Instant::now());
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Service the head of the retransmit queue, if any. The head stays
/// queued while the repair is in flight so duplicate NAKs keep
/// coalescing; it is removed afterwards, re-enabling NAK processing for
/// that sequence.
fn service_one_repair<T: Transmitter>(inner: &Inner<T>, scratch: &mut Vec<u8>) -> bool {
    let head = inner.window.read().retransmit_try_peek();
    let Some(request) = head else {
        return false;
    };

    if request.is_parity {
        service_parity(inner, scratch, request);
    } else {
        service_selective(inner, scratch, request.sqn);
    }

    inner.window.read().retransmit_remove_head();
    true
}

/// Selective repair: re-emit the stored TPDU as RDATA, refreshing the
/// advertised trail and recomputing only the header checksum against the
/// memoized payload sum.
fn service_selective<T: Transmitter>(inner: &Inner<T>, scratch: &mut Vec<u8>, sqn: Sqn) {
    let window = inner.window.read();
    let Some(record) = window.peek(sqn) else {
        // evicted between NAK and drain
        stats::incr(&inner.stats.packets_discarded);
        return;
    };
    scratch.clear();
    scratch.extend_from_slice(record.tpdu());
    let tsdu_len = record.tsdu_len();
    let saved_partial = record.partial_csum();

    send_rdata(inner, scratch, window.trail(), tsdu_len, Some(saved_partial));
}

/// Parity repair: synthesize one parity packet for the requested
/// transmission group.
fn service_parity<T: Transmitter>(inner: &Inner<T>, scratch: &mut Vec<u8>, request: RepairRequest) {
    let Some(rs) = inner.config.rs else {
        stats::incr(&inner.stats.packets_discarded);
        return;
    };
    let shift = inner.config.tg_sqn_shift;
    let k = usize::from(rs.k());
    let tg_sqn = request.sqn.tg_base(shift);
    // parity indices wrap across the 2t parity space; repeated requests
    // for one group reuse indices cyclically
    let rs_h = request.sqn.tg_offset(shift) % u32::from(rs.parity_count());
    let parity_index = rs.k() + rs_h as u8;

    // padding mutates records, so parity synthesis holds the writer lock
    let mut window = inner.window.write();

    let mut parity_len: u16 = 0;
    let mut is_var_pktlen = false;
    let mut is_op_encoded = false;
    for i in 0..k {
        let Some(record) = window.peek(tg_sqn.add(i as u32)) else {
            // the group is no longer complete in the window
            stats::incr(&inner.stats.packets_discarded);
            return;
        };
        let tsdu_len = record.tsdu_len();
        if i > 0 && tsdu_len != parity_len {
            is_var_pktlen = true;
        }
        parity_len = parity_len.max(tsdu_len);
        if record.has_options() {
            is_op_encoded = true;
        }
    }

    if is_var_pktlen {
        for i in 0..k {
            if let Some(record) = window.peek_mut(tg_sqn.add(i as u32)) {
                record.zero_pad(parity_len);
            }
        }
    }
    // sources span the padded area plus the two-byte length trailer
    let source_len = if is_var_pktlen { parity_len as usize + 2 } else { parity_len as usize };
    let parity_tsdu_len = source_len as u16;

    let mut options = OPT_PARITY;
    if is_var_pktlen {
        options |= OPT_VAR_PKTLEN;
    }
    if is_op_encoded {
        options |= OPT_PRESENT;
    }

    scratch.clear();
    packet::put_header(
        scratch,
        inner.config.tsi,
        inner.config.dport,
        packet::PacketType::Rdata,
        options,
        parity_tsdu_len,
    );
    scratch.extend_from_slice(&(tg_sqn.0 | rs_h).to_be_bytes());
    scratch.extend_from_slice(&window.trail().0.to_be_bytes());

    let mut records = Vec::with_capacity(k);
    for i in 0..k {
        let Some(record) = window.peek(tg_sqn.add(i as u32)) else {
            stats::incr(&inner.stats.packets_discarded);
            return;
        };
        records.push(record);
    }

    // a fragmented original contributes its OPT_FRAGMENT payload to an
    // RS-encoded fragment option; unfragmented originals contribute a
    // null placeholder
    if is_op_encoded {
        let null_fragment = {
            let mut fragment = [0u8; OPT_FRAGMENT_LEN];
            fragment[0] = OP_ENCODED_NULL;
            fragment
        };
        let opt_sources: Vec<&[u8]> = records
            .iter()
            .map(|record| record.fragment_payload().unwrap_or(&null_fragment))
            .collect();
        let mut encoded = [0u8; OPT_FRAGMENT_LEN];
        rs.encode(&opt_sources, parity_index, &mut encoded);

        let total = OPT_LENGTH_LEN + OPT_HEADER_LEN + OPT_FRAGMENT_LEN;
        scratch.push(OPT_LENGTH);
        scratch.push(OPT_LENGTH_LEN as u8);
        scratch.extend_from_slice(&(total as u16).to_be_bytes());
        scratch.push(OPT_FRAGMENT | OPT_END);
        scratch.push((OPT_HEADER_LEN + OPT_FRAGMENT_LEN) as u8);
        scratch.push(OP_ENCODED);
        scratch.extend_from_slice(&encoded);
    }

    let payload_at = scratch.len();
    scratch.resize(payload_at + source_len, 0);
    let sources: Vec<&[u8]> = records.iter().map(|record| record.parity_source(source_len)).collect();
    rs.encode(&sources, parity_index, &mut scratch[payload_at..]);
    drop(records);

    let trail = window.trail();
    send_rdata(inner, scratch, trail, parity_tsdu_len, None);
}

/// Finalize and emit a repair packet: stamp RDATA, refresh `data_trail`,
/// fold the header sum against the payload sum (memoized for selective
/// repairs), then send rate-limited with router alert. Emission restarts
/// the heartbeat schedule.
fn send_rdata<T: Transmitter>(
    inner: &Inner<T>,
    tpdu: &mut [u8],
    trail: Sqn,
    tsdu_len: u16,
    saved_partial: Option<u32>,
) {
    tpdu[4] = packet::PacketType::Rdata as u8;
    tpdu[packet::DATA_TRAIL_OFFSET..packet::DATA_TRAIL_OFFSET + 4].copy_from_slice(&trail.0.to_be_bytes());
    packet::patch_checksum(tpdu, 0);

    let header_len = tpdu.len() - tsdu_len as usize;
    let unfolded_header = checksum::partial(&tpdu[..header_len]);
    let unfolded_data = saved_partial.unwrap_or_else(|| checksum::partial(&tpdu[header_len..]));
    let folded = checksum::fold(checksum::block_add(unfolded_header, unfolded_data, header_len));
    packet::patch_checksum(tpdu, folded);

    let result = inner.emit(tpdu, true, true, false);
    if let Ok(sent) = result {
        if sent == tpdu.len() {
            stats::add(&inner.stats.bytes_retransmitted, u64::from(tsdu_len));
            stats::incr(&inner.stats.msgs_retransmitted);
            stats::add(&inner.stats.bytes_sent, (tpdu.len() + inner.config.iphdr_len) as u64);
        }
    }

    // already on the timer thread, no prod required
    spm::reset_heartbeat_inline(inner);
}
