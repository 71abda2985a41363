//! ODATA send paths.
//!
//! Four entry points, all producing ODATA: single-APDU copy, gather
//! vector, zero-copy buffer vector, and the single-packet fast path they
//! all collapse into for small payloads. The common shape per TSDU:
//! reserve header room, stamp the PGM framing, assign the next lead
//! sequence, compute the header and payload partial checksums, fold them
//! into the wire checksum, append the record to the window, then attempt
//! a rate-limited send.
//!
//! The payload partial checksum is memoized on the window record so the
//! repair path only ever re-sums the rewritten header.
//!
//! When the write primitive reports `WouldBlock` (or the per-packet rate
//! gate refuses under `DONTWAIT`) mid-APDU, the position is captured in an
//! [`ApduResume`] and the next identical call re-enters the loop at the
//! last unsent fragment without re-allocating or re-checksumming.

use std::ops::BitOr;

use crate::checksum;
use crate::packet::{self, OPT_PRESENT, PKT_OFFSET_FRAGMENT, PKT_OFFSET_PLAIN};
use crate::sqn::Sqn;
use crate::stats;
use crate::transport::Transmitter;
use crate::window::{PacketRecord, TransmitWindow};
use crate::PgmError;

use super::{spm, Config, Inner, Wake};

/// Send-path flags.
///
/// `DONTWAIT` makes the rate controller non-blocking; `WAITALL` asks for
/// all-or-nothing packet grouping. Legal combinations are none, `DONTWAIT`
/// alone, and `DONTWAIT | WAITALL`; `WAITALL` alone is rejected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendFlags(u8);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    /// Rate non-blocking: refuse instead of sleeping on the rate gate.
    pub const DONTWAIT: SendFlags = SendFlags(0x01);
    /// Packet grouping: reserve rate tokens for the whole call up front.
    pub const WAITALL: SendFlags = SendFlags(0x02);

    #[inline]
    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    fn dontwait(self) -> bool {
        self.contains(Self::DONTWAIT)
    }

    #[inline]
    fn waitall(self) -> bool {
        self.contains(Self::WAITALL)
    }

    /// Whole-call rate reservation mode.
    #[inline]
    fn grouped(self) -> bool {
        self.dontwait() && self.waitall()
    }

    /// Per-packet rate gate behavior.
    #[inline]
    fn rate_nonblocking(self) -> bool {
        self.dontwait() && !self.waitall()
    }

    fn validate(self) -> Result<(), PgmError> {
        if self.waitall() && !self.dontwait() {
            return Err(PgmError::Invalid);
        }
        Ok(())
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// A TSDU buffer with reserved header room, for the zero-copy send path.
///
/// Obtain via [`crate::Source::alloc_tsdu`], fill with [`TsduBuffer::put`],
/// hand back through [`crate::Source::send_buffers`]. The framing is
/// stamped into the reservation in place; the payload is never copied.
#[derive(Debug)]
pub struct TsduBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl TsduBuffer {
    pub(crate) fn with_reserve(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize(PKT_OFFSET_FRAGMENT, 0);
        TsduBuffer { buf, capacity }
    }

    /// Append payload bytes.
    pub fn put(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Payload length so far.
    pub fn len(&self) -> usize {
        self.buf.len() - PKT_OFFSET_FRAGMENT
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload room remaining.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Which entry point a resume state belongs to; a retry must repeat the
/// same call with the same arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeKind {
    One,
    Apdu,
    GatheredOne,
    Buffers,
}

/// Mid-APDU resume state: where the interrupted call stopped, so the
/// retry re-enters the fragment loop without rebuilding anything.
#[derive(Debug)]
pub(crate) struct ApduResume {
    kind: ResumeKind,
    first_sqn: Sqn,
    apdu_len: usize,
    /// APDU bytes already packetized.
    data_bytes_offset: usize,
    /// Gather-cursor position for vectored sends.
    vector_index: usize,
    vector_offset: usize,
    /// Whole-call rate tokens were reserved up front.
    is_rate_limited: bool,
    /// A record was added to the window but its first transmission is
    /// still owed.
    pending: Option<Sqn>,
    /// Sequences staged by the buffer path that are still unsent,
    /// inclusive range.
    staged: Option<(Sqn, Sqn)>,
    bytes_sent: u64,
    packets_sent: u64,
    data_bytes_sent: u64,
}

impl ApduResume {
    fn fresh(kind: ResumeKind, apdu_len: usize, is_rate_limited: bool) -> Self {
        ApduResume {
            kind,
            first_sqn: Sqn::ZERO,
            apdu_len,
            data_bytes_offset: 0,
            vector_index: 0,
            vector_offset: 0,
            is_rate_limited,
            pending: None,
            staged: None,
            bytes_sent: 0,
            packets_sent: 0,
            data_bytes_sent: 0,
        }
    }
}

/// Send-path bookkeeping under its own lock, which also serializes
/// concurrent application senders so fragments of different APDUs never
/// interleave.
#[derive(Debug, Default)]
pub(crate) struct SendState {
    resume: Option<ApduResume>,
    /// Part index for multi-APDU vectored sends, resumed independently of
    /// the per-APDU state.
    multi_index: Option<usize>,
}

/// Walks a gather vector, copying into fragment payloads while folding
/// the running partial checksum.
struct VectorCursor<'a> {
    parts: &'a [&'a [u8]],
    index: usize,
    offset: usize,
}

impl<'a> VectorCursor<'a> {
    fn new(parts: &'a [&'a [u8]], index: usize, offset: usize) -> Self {
        VectorCursor { parts, index, offset }
    }

    /// Fill `dst` from the vector, returning the unfolded checksum of the
    /// copied bytes.
    fn copy_checksum(&mut self, dst: &mut [u8]) -> u32 {
        let mut filled = 0;
        let mut sum = 0;
        while filled < dst.len() {
            while self.offset >= self.parts[self.index].len() {
                self.index += 1;
                self.offset = 0;
            }
            let part = &self.parts[self.index][self.offset..];
            let take = part.len().min(dst.len() - filled);
            let piece = checksum::partial_copy(&part[..take], &mut dst[filled..filled + take]);
            sum = if filled == 0 {
                piece
            } else {
                checksum::block_add(sum, piece, filled)
            };
            filled += take;
            self.offset += take;
        }
        sum
    }
}

/// Append the fixed header and data header of an ODATA packet.
fn stamp_odata(buf: &mut Vec<u8>, config: &Config, options: u8, tsdu_len: u16, sqn: Sqn, trail: Sqn) {
    packet::put_header(buf, config.tsi, config.dport, packet::PacketType::Odata, options, tsdu_len);
    buf.extend_from_slice(&sqn.0.to_be_bytes());
    buf.extend_from_slice(&trail.0.to_be_bytes());
}

/// Wire size of an APDU when fragmented, one IP header per packet.
fn fragmented_wire_size(config: &Config, apdu_len: usize) -> usize {
    let packets = apdu_len.div_ceil(config.max_tsdu_fragment).max(1);
    packets * (config.iphdr_len + PKT_OFFSET_FRAGMENT) + apdu_len
}

/// Queue proactive parity generation when `sqn` closed its transmission
/// group.
fn maybe_schedule_proactive<T: Transmitter>(inner: &Inner<T>, window: &TransmitWindow, sqn: Sqn) {
    if !inner.config.use_proactive_parity {
        return;
    }
    if sqn.next().tg_offset(inner.config.tg_sqn_shift) != 0 {
        return;
    }
    let tg_sqn = sqn.tg_base(inner.config.tg_sqn_shift);
    match window.retransmit_push(tg_sqn, true) {
        Ok(true) => inner.wake(Wake::Repair),
        Ok(false) => {}
        Err(_) => tracing::debug!(tg_sqn = %tg_sqn, "proactive parity group already evicted"),
    }
}

/// Flush accumulated counters when a call blocks partway; the heartbeat
/// restarts only if something actually went out.
fn flush_blocked<T: Transmitter>(inner: &Inner<T>, resume: &mut ApduResume) {
    if resume.bytes_sent > 0 || resume.packets_sent > 0 {
        stats::add(&inner.stats.bytes_sent, resume.bytes_sent);
        stats::add(&inner.stats.data_msgs_sent, resume.packets_sent);
        stats::add(&inner.stats.data_bytes_sent, resume.data_bytes_sent);
        resume.bytes_sent = 0;
        resume.packets_sent = 0;
        resume.data_bytes_sent = 0;
        spm::reset_heartbeat_spm(inner);
    }
}

/// Flush counters on completion; the heartbeat always restarts after a
/// transmission attempt.
fn flush_complete<T: Transmitter>(inner: &Inner<T>, resume: &ApduResume) {
    stats::add(&inner.stats.bytes_sent, resume.bytes_sent);
    stats::add(&inner.stats.data_msgs_sent, resume.packets_sent);
    stats::add(&inner.stats.data_bytes_sent, resume.data_bytes_sent);
    spm::reset_heartbeat_spm(inner);
}

/// Pull the stored resume state, insisting the retry matches the
/// interrupted entry point.
fn take_resume(state: &mut SendState, kind: ResumeKind) -> Result<Option<ApduResume>, PgmError> {
    match &state.resume {
        Some(resume) if resume.kind != kind => Err(PgmError::Invalid),
        Some(_) => Ok(state.resume.take()),
        None => Ok(None),
    }
}

/// Copy one APDU into the window, fragmenting when it exceeds the
/// largest single TSDU.
pub(crate) fn send<T: Transmitter>(inner: &Inner<T>, apdu: &[u8], flags: SendFlags) -> Result<usize, PgmError> {
    flags.validate()?;
    if inner.is_closed() {
        return Err(PgmError::Closed);
    }
    let mut state = inner.send_state.lock();
    if apdu.len() < inner.config.max_tsdu {
        send_one_copy(inner, &mut state, apdu, flags)
    } else {
        send_apdu(inner, &mut state, &[apdu], apdu.len(), flags)
    }
}

/// Gather-send: with `one_apdu` the parts form one APDU (fragmented if
/// needed); otherwise each part is an independent APDU.
pub(crate) fn send_vectored<T: Transmitter>(
    inner: &Inner<T>,
    parts: &[&[u8]],
    one_apdu: bool,
    flags: SendFlags,
) -> Result<usize, PgmError> {
    flags.validate()?;
    if inner.is_closed() {
        return Err(PgmError::Closed);
    }
    let mut state = inner.send_state.lock();
    if parts.is_empty() {
        return send_one_copy(inner, &mut state, &[], flags);
    }

    if !one_apdu {
        // every part is its own APDU; remember which part a blocked call
        // stopped at so the retry continues there
        let start = state.multi_index.take().unwrap_or(0);
        let mut data_bytes_sent = 0;
        for (index, part) in parts.iter().copied().enumerate().skip(start) {
            let result = if part.len() < inner.config.max_tsdu {
                send_one_copy(inner, &mut state, part, flags)
            } else {
                send_apdu(inner, &mut state, &[part], part.len(), flags)
            };
            match result {
                Ok(sent) => data_bytes_sent += sent,
                Err(err) => {
                    state.multi_index = Some(index);
                    return Err(err);
                }
            }
        }
        return Ok(data_bytes_sent);
    }

    let apdu_len: usize = parts.iter().map(|part| part.len()).sum();
    if apdu_len < inner.config.max_tsdu {
        send_gathered_one(inner, &mut state, parts, apdu_len, flags)
    } else {
        send_apdu(inner, &mut state, parts, apdu_len, flags)
    }
}

/// Single-packet fast path: one unfragmented ODATA, payload copied and
/// checksummed in the same pass straight into the window record.
fn send_one_copy<T: Transmitter>(
    inner: &Inner<T>,
    state: &mut SendState,
    tsdu: &[u8],
    flags: SendFlags,
) -> Result<usize, PgmError> {
    if tsdu.len() > inner.config.max_tsdu {
        return Err(PgmError::Oversize);
    }

    let mut resume = match take_resume(state, ResumeKind::One)? {
        Some(resume) => resume,
        None => {
            if flags.grouped() {
                inner.reserve_rate(inner.config.iphdr_len + PKT_OFFSET_PLAIN + tsdu.len())?;
            }
            ApduResume::fresh(ResumeKind::One, tsdu.len(), flags.grouped())
        }
    };

    let mut window = inner.window.write();
    let sqn = match resume.pending {
        Some(sqn) => sqn,
        None => {
            let sqn = window.next_lead();
            let mut buf = Vec::with_capacity(PKT_OFFSET_PLAIN + tsdu.len());
            stamp_odata(&mut buf, &inner.config, 0, tsdu.len() as u16, sqn, window.trail());
            let unfolded_header = checksum::partial(&buf);
            buf.resize(PKT_OFFSET_PLAIN + tsdu.len(), 0);
            let unfolded_odata = checksum::partial_copy(tsdu, &mut buf[PKT_OFFSET_PLAIN..]);
            let folded = checksum::fold(checksum::block_add(unfolded_header, unfolded_odata, PKT_OFFSET_PLAIN));
            packet::patch_checksum(&mut buf, folded);
            window.add(PacketRecord::new(
                sqn,
                buf,
                0,
                PKT_OFFSET_PLAIN,
                None,
                tsdu.len() as u16,
                unfolded_odata,
            ));
            resume.pending = Some(sqn);
            sqn
        }
    };

    if let Some(record) = window.peek(sqn) {
        let tpdu = record.tpdu();
        match inner.emit(tpdu, !resume.is_rate_limited, false, flags.rate_nonblocking()) {
            Err(err) => {
                drop(window);
                state.resume = Some(resume);
                return Err(err);
            }
            Ok(sent) => {
                if sent == tpdu.len() {
                    resume.bytes_sent += (tpdu.len() + inner.config.iphdr_len) as u64;
                    resume.packets_sent += 1;
                    resume.data_bytes_sent += tsdu.len() as u64;
                }
            }
        }
    }

    maybe_schedule_proactive(inner, &window, sqn);
    drop(window);
    flush_complete(inner, &resume);
    Ok(tsdu.len())
}

/// Gathered single packet: one unfragmented ODATA whose payload is the
/// concatenation of the vector parts.
fn send_gathered_one<T: Transmitter>(
    inner: &Inner<T>,
    state: &mut SendState,
    parts: &[&[u8]],
    tsdu_len: usize,
    flags: SendFlags,
) -> Result<usize, PgmError> {
    if tsdu_len > inner.config.max_tsdu {
        return Err(PgmError::Oversize);
    }

    let mut resume = match take_resume(state, ResumeKind::GatheredOne)? {
        Some(resume) => resume,
        None => {
            if flags.grouped() {
                inner.reserve_rate(inner.config.iphdr_len + PKT_OFFSET_PLAIN + tsdu_len)?;
            }
            ApduResume::fresh(ResumeKind::GatheredOne, tsdu_len, flags.grouped())
        }
    };

    let mut window = inner.window.write();
    let sqn = match resume.pending {
        Some(sqn) => sqn,
        None => {
            let sqn = window.next_lead();
            let mut buf = Vec::with_capacity(PKT_OFFSET_PLAIN + tsdu_len);
            stamp_odata(&mut buf, &inner.config, 0, tsdu_len as u16, sqn, window.trail());
            let unfolded_header = checksum::partial(&buf);
            buf.resize(PKT_OFFSET_PLAIN + tsdu_len, 0);
            let mut cursor = VectorCursor::new(parts, 0, 0);
            let unfolded_odata = cursor.copy_checksum(&mut buf[PKT_OFFSET_PLAIN..]);
            let folded = checksum::fold(checksum::block_add(unfolded_header, unfolded_odata, PKT_OFFSET_PLAIN));
            packet::patch_checksum(&mut buf, folded);
            window.add(PacketRecord::new(
                sqn,
                buf,
                0,
                PKT_OFFSET_PLAIN,
                None,
                tsdu_len as u16,
                unfolded_odata,
            ));
            resume.pending = Some(sqn);
            sqn
        }
    };

    if let Some(record) = window.peek(sqn) {
        let tpdu = record.tpdu();
        match inner.emit(tpdu, !resume.is_rate_limited, false, flags.rate_nonblocking()) {
            Err(err) => {
                drop(window);
                state.resume = Some(resume);
                return Err(err);
            }
            Ok(sent) => {
                if sent == tpdu.len() {
                    resume.bytes_sent += (tpdu.len() + inner.config.iphdr_len) as u64;
                    resume.packets_sent += 1;
                    resume.data_bytes_sent += tsdu_len as u64;
                }
            }
        }
    }

    maybe_schedule_proactive(inner, &window, sqn);
    drop(window);
    flush_complete(inner, &resume);
    Ok(tsdu_len)
}

/// Fragmenting loop shared by the copy and gather paths: carve the APDU
/// into OPT_FRAGMENT-tagged TSDUs, each entering the window before its
/// first transmission attempt.
fn send_apdu<T: Transmitter>(
    inner: &Inner<T>,
    state: &mut SendState,
    parts: &[&[u8]],
    apdu_len: usize,
    flags: SendFlags,
) -> Result<usize, PgmError> {
    let config = &inner.config;
    if apdu_len > config.txw_sqns as usize * config.max_tsdu_fragment {
        return Err(PgmError::Oversize);
    }

    let mut resume = match take_resume(state, ResumeKind::Apdu)? {
        Some(resume) => {
            debug_assert_eq!(resume.apdu_len, apdu_len);
            resume
        }
        None => {
            let grouped = flags.grouped();
            if grouped {
                inner.reserve_rate(fragmented_wire_size(config, apdu_len))?;
            }
            ApduResume::fresh(ResumeKind::Apdu, apdu_len, grouped)
        }
    };

    let mut window = inner.window.write();
    loop {
        if resume.pending.is_none() && resume.data_bytes_offset >= apdu_len {
            break;
        }
        let tsdu_len = config
            .max_tsdu_fragment
            .min(apdu_len - resume.data_bytes_offset);

        let sqn = match resume.pending {
            Some(sqn) => sqn,
            None => {
                if resume.data_bytes_offset == 0 {
                    resume.first_sqn = window.next_lead();
                }
                let sqn = window.next_lead();
                let mut buf = Vec::with_capacity(PKT_OFFSET_FRAGMENT + tsdu_len);
                stamp_odata(&mut buf, config, OPT_PRESENT, tsdu_len as u16, sqn, window.trail());
                packet::put_fragment_options(
                    &mut buf,
                    resume.first_sqn,
                    resume.data_bytes_offset as u32,
                    apdu_len as u32,
                );
                let unfolded_header = checksum::partial(&buf);
                buf.resize(PKT_OFFSET_FRAGMENT + tsdu_len, 0);
                let mut cursor = VectorCursor::new(parts, resume.vector_index, resume.vector_offset);
                let unfolded_odata = cursor.copy_checksum(&mut buf[PKT_OFFSET_FRAGMENT..]);
                resume.vector_index = cursor.index;
                resume.vector_offset = cursor.offset;
                let folded =
                    checksum::fold(checksum::block_add(unfolded_header, unfolded_odata, PKT_OFFSET_FRAGMENT));
                packet::patch_checksum(&mut buf, folded);
                window.add(PacketRecord::new(
                    sqn,
                    buf,
                    0,
                    PKT_OFFSET_FRAGMENT,
                    Some(PKT_OFFSET_PLAIN + packet::OPT_LENGTH_LEN + packet::OPT_HEADER_LEN),
                    tsdu_len as u16,
                    unfolded_odata,
                ));
                resume.pending = Some(sqn);
                sqn
            }
        };

        if let Some(record) = window.peek(sqn) {
            let tpdu = record.tpdu();
            match inner.emit(tpdu, !resume.is_rate_limited, false, flags.rate_nonblocking()) {
                Err(err) => {
                    drop(window);
                    flush_blocked(inner, &mut resume);
                    state.resume = Some(resume);
                    return Err(err);
                }
                Ok(sent) => {
                    if sent == tpdu.len() {
                        resume.bytes_sent += (tpdu.len() + config.iphdr_len) as u64;
                        resume.packets_sent += 1;
                        resume.data_bytes_sent += tsdu_len as u64;
                    }
                }
            }
        }

        resume.pending = None;
        resume.data_bytes_offset += tsdu_len;
        maybe_schedule_proactive(inner, &window, sqn);
    }
    debug_assert_eq!(resume.data_bytes_offset, apdu_len);

    drop(window);
    flush_complete(inner, &resume);
    Ok(apdu_len)
}

/// Zero-copy path: the buffers already carry header reservation, so the
/// framing is stamped in place and payload bytes are summed where they
/// sit. All buffers are staged into the window first, then emitted in
/// sequence; a blocked call leaves the staged range in the resume state.
pub(crate) fn send_buffers<T: Transmitter>(
    inner: &Inner<T>,
    bufs: Vec<TsduBuffer>,
    one_apdu: bool,
    flags: SendFlags,
) -> Result<usize, PgmError> {
    flags.validate()?;
    if inner.is_closed() {
        return Err(PgmError::Closed);
    }
    let config = &inner.config;
    let mut state = inner.send_state.lock();
    if bufs.is_empty() && state.resume.is_none() {
        return send_one_copy(inner, &mut state, &[], flags);
    }

    let mut resume = match take_resume(&mut state, ResumeKind::Buffers)? {
        Some(resume) => resume,
        None => {
            let fragmenting = one_apdu && bufs.len() > 1;
            let max_per_buf = if fragmenting { config.max_tsdu_fragment } else { config.max_tsdu };
            if bufs.iter().any(|tsdu| tsdu.len() > max_per_buf) {
                return Err(PgmError::Oversize);
            }

            let grouped = flags.grouped();
            let header_len = if fragmenting { PKT_OFFSET_FRAGMENT } else { PKT_OFFSET_PLAIN };
            if grouped {
                let wire: usize = bufs
                    .iter()
                    .map(|tsdu| config.iphdr_len + header_len + tsdu.len())
                    .sum();
                inner.reserve_rate(wire)?;
            }

            let apdu_len: usize = bufs.iter().map(|tsdu| tsdu.len()).sum();
            let mut resume = ApduResume::fresh(ResumeKind::Buffers, apdu_len, grouped);

            // stage every buffer into the window before the first
            // transmission attempt
            let mut window = inner.window.write();
            resume.first_sqn = window.next_lead();
            let mut frag_offset = 0u32;
            let mut last_sqn = resume.first_sqn;
            for tsdu_buf in bufs {
                let sqn = window.next_lead();
                let tsdu_len = tsdu_buf.len();
                let mut buf = tsdu_buf.into_vec();
                let start = PKT_OFFSET_FRAGMENT - header_len;

                let mut header = Vec::with_capacity(header_len);
                let options = if fragmenting { OPT_PRESENT } else { 0 };
                stamp_odata(&mut header, config, options, tsdu_len as u16, sqn, window.trail());
                let opt_fragment_offset = if fragmenting {
                    packet::put_fragment_options(&mut header, resume.first_sqn, frag_offset, apdu_len as u32);
                    Some(start + PKT_OFFSET_PLAIN + packet::OPT_LENGTH_LEN + packet::OPT_HEADER_LEN)
                } else {
                    None
                };
                buf[start..PKT_OFFSET_FRAGMENT].copy_from_slice(&header);

                let unfolded_header = checksum::partial(&buf[start..PKT_OFFSET_FRAGMENT]);
                let unfolded_odata = checksum::partial(&buf[PKT_OFFSET_FRAGMENT..]);
                let folded = checksum::fold(checksum::block_add(unfolded_header, unfolded_odata, header_len));
                packet::patch_checksum(&mut buf[start..], folded);

                window.add(PacketRecord::new(
                    sqn,
                    buf,
                    start,
                    PKT_OFFSET_FRAGMENT,
                    opt_fragment_offset,
                    tsdu_len as u16,
                    unfolded_odata,
                ));
                frag_offset += tsdu_len as u32;
                last_sqn = sqn;
            }
            resume.staged = Some((resume.first_sqn, last_sqn));
            resume
        }
    };

    if let Some((first_unsent, last_sqn)) = resume.staged {
        let window = inner.window.read();
        let mut at = first_unsent;
        loop {
            if let Some(record) = window.peek(at) {
                let tpdu = record.tpdu();
                match inner.emit(tpdu, !resume.is_rate_limited, false, flags.rate_nonblocking()) {
                    Err(err) => {
                        resume.staged = Some((at, last_sqn));
                        drop(window);
                        flush_blocked(inner, &mut resume);
                        state.resume = Some(resume);
                        return Err(err);
                    }
                    Ok(sent) => {
                        if sent == tpdu.len() {
                            resume.bytes_sent += (tpdu.len() + config.iphdr_len) as u64;
                            resume.packets_sent += 1;
                            resume.data_bytes_sent += u64::from(record.tsdu_len());
                        }
                    }
                }
                maybe_schedule_proactive(inner, &window, at);
            }
            if at == last_sqn {
                break;
            }
            at = at.next();
        }
    }

    let data_bytes_sent = resume.data_bytes_sent as usize;
    flush_complete(inner, &resume);
    Ok(data_bytes_sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_validation() {
        assert!(SendFlags::NONE.validate().is_ok());
        assert!(SendFlags::DONTWAIT.validate().is_ok());
        assert!((SendFlags::DONTWAIT | SendFlags::WAITALL).validate().is_ok());
        assert_eq!(SendFlags::WAITALL.validate(), Err(PgmError::Invalid));
    }

    #[test]
    fn test_flags_modes() {
        assert!((SendFlags::DONTWAIT | SendFlags::WAITALL).grouped());
        assert!(!SendFlags::DONTWAIT.grouped());
        assert!(SendFlags::DONTWAIT.rate_nonblocking());
        assert!(!(SendFlags::DONTWAIT | SendFlags::WAITALL).rate_nonblocking());
        assert!(!SendFlags::NONE.rate_nonblocking());
    }

    #[test]
    fn test_vector_cursor_matches_contiguous() {
        let parts: [&[u8]; 3] = [b"abc", b"defgh", b"i"];
        let flat = b"abcdefghi";

        let mut cursor = VectorCursor::new(&parts, 0, 0);
        let mut gathered = [0u8; 9];
        let sum = cursor.copy_checksum(&mut gathered);
        assert_eq!(&gathered, flat);
        assert_eq!(checksum::fold(sum), checksum::fold(checksum::partial(flat)));
    }

    #[test]
    fn test_vector_cursor_split_fills() {
        let parts: [&[u8]; 2] = [b"abcde", b"fghij"];
        let mut cursor = VectorCursor::new(&parts, 0, 0);

        let mut first = [0u8; 4];
        let first_sum = cursor.copy_checksum(&mut first);
        let mut second = [0u8; 6];
        let second_sum = cursor.copy_checksum(&mut second);

        assert_eq!(&first, b"abcd");
        assert_eq!(&second, b"efghij");
        let combined = checksum::block_add(first_sum, second_sum, 4);
        assert_eq!(checksum::fold(combined), checksum::fold(checksum::partial(b"abcdefghij")));
    }

    #[test]
    fn test_tsdu_buffer_reserve() {
        let mut tsdu = TsduBuffer::with_reserve(100);
        assert!(tsdu.is_empty());
        tsdu.put(b"payload");
        assert_eq!(tsdu.len(), 7);
        assert_eq!(tsdu.remaining(), 100 - PKT_OFFSET_FRAGMENT - 7);
        let buf = tsdu.into_vec();
        assert_eq!(&buf[PKT_OFFSET_FRAGMENT..], b"payload");
    }
}
