//! Inbound control-packet handling: NAK, NNAK, SPMR.
//!
//! The receive thread hands raw TPDUs to [`handle_control`]. Nothing here
//! propagates errors to the application: malformed or misaddressed
//! packets bump counters and are dropped, valid NAKs are confirmed with
//! an immediate NCF and deferred to the timer thread for repair.

use std::net::IpAddr;

use crate::checksum;
use crate::packet::{self, Header, PacketType, HEADER_LEN, OPT_PARITY};
use crate::sqn::Sqn;
use crate::stats;
use crate::transport::Transmitter;
use crate::PgmError;

use super::{spm, Inner, Wake};

/// Minimum interval between SPMR-triggered SPM responses per session
/// (RFC 3208 §13.4).
const IHB_MIN: std::time::Duration = std::time::Duration::from_millis(100);

/// Decode one inbound control TPDU and dispatch it.
pub(crate) fn handle_control<T: Transmitter>(inner: &Inner<T>, tpdu: &[u8]) {
    let header = match Header::parse(tpdu) {
        Ok(header) => header,
        Err(_) => {
            stats::incr(&inner.stats.packets_discarded);
            return;
        }
    };
    if !checksum::verify(tpdu) {
        stats::incr(&inner.stats.packets_discarded);
        return;
    }

    let body = &tpdu[HEADER_LEN..];
    match header.typ {
        PacketType::Nak => on_nak(inner, &header, body),
        PacketType::Nnak => on_nnak(inner, &header, body),
        PacketType::Spmr => on_spmr(inner, &header, body),
        _ => {
            // not addressed to a source
            stats::incr(&inner.stats.packets_discarded);
        }
    }
}

fn discard_nak<T: Transmitter>(inner: &Inner<T>) {
    stats::incr(&inner.stats.malformed_naks);
    stats::incr(&inner.stats.packets_discarded);
}

/// Validate a NAK, confirm it with an NCF, and queue the repairs.
///
/// Validation completes in full, option walk included, before the NCF
/// goes out.
fn on_nak<T: Transmitter>(inner: &Inner<T>, header: &Header, body: &[u8]) {
    tracing::debug!("on_nak");

    let is_parity = header.options & OPT_PARITY != 0;
    if is_parity {
        stats::incr(&inner.stats.parity_naks_received);
        if !inner.config.use_ondemand_parity {
            discard_nak(inner);
            return;
        }
    } else {
        stats::incr(&inner.stats.selective_naks_received);
    }

    let nak = match packet::parse_nak(header, body) {
        Ok(nak) => nak,
        Err(_) => {
            discard_nak(inner);
            return;
        }
    };

    // the source NLA carries this transport's unicast address, the group
    // NLA the session's multicast group
    if nak.src_nla != inner.config.unicast || nak.grp_nla != inner.config.group {
        discard_nak(inner);
        return;
    }

    tracing::debug!(nak_sqn = nak.sqn, list_len = nak.list.len(), is_parity, "nak accepted");

    // confirm immediately, then defer the actual repairs to the timer
    // thread
    if nak.list.is_empty() {
        send_ncf(inner, nak.sqn, nak.src_nla, nak.grp_nla, is_parity);
    } else {
        send_ncf_list(inner, nak.sqn, &nak.list, nak.src_nla, nak.grp_nla, is_parity);
    }

    let window = inner.window.read();
    for sqn in std::iter::once(nak.sqn).chain(nak.list.iter().copied()) {
        match window.retransmit_push(Sqn(sqn), is_parity) {
            Ok(true) => inner.wake(Wake::Repair),
            Ok(false) => {}
            Err(PgmError::OutOfWindow) => {
                tracing::debug!(sqn, "nak for sequence outside transmit window");
            }
            Err(_) => {}
        }
    }
}

/// Null NAKs are informational at the source: verify and account, no
/// retransmission obligation.
fn on_nnak<T: Transmitter>(inner: &Inner<T>, header: &Header, body: &[u8]) {
    tracing::debug!("on_nnak");

    let nnak = match packet::parse_nak(header, body) {
        Ok(nnak) => nnak,
        Err(_) => {
            stats::incr(&inner.stats.nnak_errors);
            stats::incr(&inner.stats.packets_discarded);
            return;
        }
    };
    if nnak.src_nla != inner.config.unicast || nnak.grp_nla != inner.config.group {
        stats::incr(&inner.stats.nnak_errors);
        stats::incr(&inner.stats.packets_discarded);
        return;
    }

    stats::add(&inner.stats.nnaks_received, 1 + nnak.list.len() as u64);
}

/// An SPMR addressed to the source requests an immediate SPM, rate
/// limited to one response per IHB_MIN per session.
fn on_spmr<T: Transmitter>(inner: &Inner<T>, header: &Header, body: &[u8]) {
    tracing::debug!("on_spmr");

    if packet::verify_spmr(header, body).is_err() {
        stats::incr(&inner.stats.packets_discarded);
        return;
    }
    stats::incr(&inner.stats.spmrs_received);

    {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        let now = std::time::Instant::now();
        if let Some(answered_at) = state.spmr_answered_at {
            if now.duration_since(answered_at) < IHB_MIN {
                tracing::debug!("suppressing SPM response within IHB_MIN holdoff");
                return;
            }
        }
        state.spmr_answered_at = Some(now);
    }
    spm::send_spm(inner);
}

/// Send a single-sequence NAK confirm. NCFs are not rate limited and
/// travel with router alert.
fn send_ncf<T: Transmitter>(inner: &Inner<T>, sqn: u32, src_nla: IpAddr, grp_nla: IpAddr, is_parity: bool) {
    tracing::debug!(sqn, "send_ncf");
    let ncf = packet::build_ncf(inner.config.tsi, inner.config.dport, sqn, src_nla, grp_nla, is_parity);
    if let Ok(sent) = inner.emit(&ncf, false, true, true) {
        if sent == ncf.len() {
            stats::add(&inner.stats.bytes_sent, ncf.len() as u64);
        }
    }
}

/// Send an NCF carrying the whole confirmed list via OPT_NAK_LIST.
fn send_ncf_list<T: Transmitter>(
    inner: &Inner<T>,
    sqn: u32,
    list: &[u32],
    src_nla: IpAddr,
    grp_nla: IpAddr,
    is_parity: bool,
) {
    tracing::debug!(sqn, list_len = list.len(), "send_ncf_list");
    let ncf = packet::build_ncf_list(inner.config.tsi, inner.config.dport, sqn, list, src_nla, grp_nla, is_parity);
    if let Ok(sent) = inner.emit(&ncf, false, true, true) {
        if sent == ncf.len() {
            stats::add(&inner.stats.bytes_sent, ncf.len() as u64);
        }
    }
}
