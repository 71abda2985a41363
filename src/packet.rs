//! RFC 3208 wire codec.
//!
//! Serialization and parsing of PGM packets: the 16-byte fixed header, the
//! ODATA/RDATA data header, SPM, the NAK family (NAK/NNAK/NCF), and the
//! option chain (OPT_LENGTH, OPT_FRAGMENT, OPT_NAK_LIST). All multi-byte
//! fields are network byte order.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────┬─────────┬──────┬─────────┬──────────┬─────────┬──────────┐
//! │ sport   │ dport   │ type │ options │ checksum │ GSI     │ tsdu_len │
//! │ (2B)    │ (2B)    │ (1B) │ (1B)    │ (2B)     │ (6B)    │ (2B)     │
//! └─────────┴─────────┴──────┴─────────┴──────────┴─────────┴──────────┘
//! ```
//!
//! Data packets continue with `data_sqn` (4B) and `data_trail` (4B); the
//! NAK family continues with `nak_sqn` (4B) and two NLAs (AFI + reserved +
//! address). Options, when present, sit between the type-specific header
//! and the TSDU.

use std::fmt;
use std::net::IpAddr;

use crate::checksum;
use crate::sqn::Sqn;
use crate::PgmError;

/// Fixed PGM header length.
pub const HEADER_LEN: usize = 16;
/// ODATA/RDATA data-header length (`data_sqn` + `data_trail`).
pub const DATA_HEADER_LEN: usize = 8;
/// OPT_LENGTH element length (it carries its own option header).
pub const OPT_LENGTH_LEN: usize = 4;
/// Generic option header length (type, length, reserved).
pub const OPT_HEADER_LEN: usize = 3;
/// OPT_FRAGMENT payload length (reserved + sqn + offset + apdu length).
pub const OPT_FRAGMENT_LEN: usize = 13;
/// Total option area of a fragmented data packet.
pub const FRAGMENT_OPTIONS_LEN: usize = OPT_LENGTH_LEN + OPT_HEADER_LEN + OPT_FRAGMENT_LEN;

/// TSDU offset in an unfragmented data packet.
pub const PKT_OFFSET_PLAIN: usize = HEADER_LEN + DATA_HEADER_LEN;
/// TSDU offset in a fragmented data packet.
pub const PKT_OFFSET_FRAGMENT: usize = PKT_OFFSET_PLAIN + FRAGMENT_OPTIONS_LEN;

/// Byte offset of the checksum field within the header.
pub const CHECKSUM_OFFSET: usize = 6;
/// Byte offset of `data_sqn` within a data packet.
pub const DATA_SQN_OFFSET: usize = HEADER_LEN;
/// Byte offset of `data_trail` within a data packet.
pub const DATA_TRAIL_OFFSET: usize = HEADER_LEN + 4;

/// Maximum additional sequences an OPT_NAK_LIST can carry (the option
/// length is a single byte: 3 + 1 + 62 * 4 = 252).
pub const MAX_NAK_LIST: usize = 62;

// header option bits
pub const OPT_PRESENT: u8 = 0x01;
pub const OPT_NETWORK: u8 = 0x02;
pub const OPT_VAR_PKTLEN: u8 = 0x40;
pub const OPT_PARITY: u8 = 0x80;

// option types
pub const OPT_LENGTH: u8 = 0x00;
pub const OPT_FRAGMENT: u8 = 0x01;
pub const OPT_NAK_LIST: u8 = 0x02;
/// Parity parameters (transmission group size), advertised in SPMs by
/// FEC-aware senders.
pub const OPT_PARITY_PRM: u8 = 0x08;
/// Parity-group offset beyond the transmission group size.
pub const OPT_PARITY_GRP: u8 = 0x09;
pub const OPT_END: u8 = 0x80;
pub const OPT_MASK: u8 = 0x7f;

// opt_reserved bits for FEC-encoded options
pub const OP_ENCODED: u8 = 0x08;
pub const OP_ENCODED_NULL: u8 = 0x80;

// NLA address family indicators
pub const AFI_IP: u16 = 1;
pub const AFI_IP6: u16 = 2;

/// PGM packet types used by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Source Path Message.
    Spm = 0x00,
    /// Original data.
    Odata = 0x04,
    /// Repair data.
    Rdata = 0x05,
    /// Negative acknowledgment.
    Nak = 0x08,
    /// Null NAK (DLR-originated, informational).
    Nnak = 0x09,
    /// NAK confirm.
    Ncf = 0x0a,
    /// SPM request.
    Spmr = 0x40,
}

impl PacketType {
    /// Parse a packet type from the header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Spm),
            0x04 => Some(Self::Odata),
            0x05 => Some(Self::Rdata),
            0x08 => Some(Self::Nak),
            0x09 => Some(Self::Nnak),
            0x0a => Some(Self::Ncf),
            0x40 => Some(Self::Spmr),
            _ => None,
        }
    }
}

/// Globally-unique source identifier, six opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gsi(pub [u8; 6]);

impl fmt::Display for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

/// Transport session identifier: GSI plus source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl fmt::Display for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}

/// Decoded fixed PGM header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sport: u16,
    pub dport: u16,
    pub typ: PacketType,
    pub options: u8,
    pub checksum: u16,
    pub gsi: Gsi,
    pub tsdu_len: u16,
}

impl Header {
    /// Parse the fixed header from the front of a TPDU.
    pub fn parse(tpdu: &[u8]) -> Result<Header, PgmError> {
        if tpdu.len() < HEADER_LEN {
            return Err(PgmError::Malformed);
        }
        let typ = PacketType::from_u8(tpdu[4]).ok_or(PgmError::Malformed)?;
        let mut gsi = [0u8; 6];
        gsi.copy_from_slice(&tpdu[8..14]);
        Ok(Header {
            sport: u16::from_be_bytes([tpdu[0], tpdu[1]]),
            dport: u16::from_be_bytes([tpdu[2], tpdu[3]]),
            typ,
            options: tpdu[5],
            checksum: u16::from_be_bytes([tpdu[6], tpdu[7]]),
            gsi: Gsi(gsi),
            tsdu_len: u16::from_be_bytes([tpdu[14], tpdu[15]]),
        })
    }
}

/// Append a fixed header with a zeroed checksum field.
pub fn put_header(buf: &mut Vec<u8>, tsi: Tsi, dport: u16, typ: PacketType, options: u8, tsdu_len: u16) {
    buf.extend_from_slice(&tsi.sport.to_be_bytes());
    buf.extend_from_slice(&dport.to_be_bytes());
    buf.push(typ as u8);
    buf.push(options);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&tsi.gsi.0);
    buf.extend_from_slice(&tsdu_len.to_be_bytes());
}

/// Patch the header checksum field in a serialized TPDU.
#[inline]
pub fn patch_checksum(tpdu: &mut [u8], csum: u16) {
    tpdu[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Checksum a fully serialized control TPDU in place.
pub fn finalize_control(tpdu: &mut [u8]) {
    patch_checksum(tpdu, 0);
    let csum = checksum::fold(checksum::partial(tpdu));
    patch_checksum(tpdu, csum);
}

/// Append the OPT_LENGTH + OPT_FRAGMENT chain of a fragmented data packet.
pub fn put_fragment_options(buf: &mut Vec<u8>, first_sqn: Sqn, frag_off: u32, apdu_len: u32) {
    buf.push(OPT_LENGTH);
    buf.push(OPT_LENGTH_LEN as u8);
    buf.extend_from_slice(&(FRAGMENT_OPTIONS_LEN as u16).to_be_bytes());
    buf.push(OPT_FRAGMENT | OPT_END);
    buf.push((OPT_HEADER_LEN + OPT_FRAGMENT_LEN) as u8);
    buf.push(0); // opt_reserved
    buf.push(0); // fragment opt_reserved
    buf.extend_from_slice(&first_sqn.0.to_be_bytes());
    buf.extend_from_slice(&frag_off.to_be_bytes());
    buf.extend_from_slice(&apdu_len.to_be_bytes());
}

/// Serialized length of an NLA for the given address family.
pub fn nla_len(addr: IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => 2 + 2 + 4,
        IpAddr::V6(_) => 2 + 2 + 16,
    }
}

/// Append an NLA: AFI, two reserved bytes, then the raw address.
pub fn put_nla(buf: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.extend_from_slice(&AFI_IP.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.extend_from_slice(&AFI_IP6.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

/// Parse an NLA, returning the address and the number of bytes consumed.
pub fn parse_nla(buf: &[u8]) -> Result<(IpAddr, usize), PgmError> {
    if buf.len() < 4 {
        return Err(PgmError::Malformed);
    }
    let afi = u16::from_be_bytes([buf[0], buf[1]]);
    match afi {
        AFI_IP => {
            if buf.len() < 8 {
                return Err(PgmError::Malformed);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            Ok((IpAddr::from(octets), 8))
        }
        AFI_IP6 => {
            if buf.len() < 20 {
                return Err(PgmError::Malformed);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            Ok((IpAddr::from(octets), 20))
        }
        _ => Err(PgmError::Malformed),
    }
}

/// Serialize an SPM TPDU advertising the window extremities into `buf`,
/// replacing its contents. The buffer is reused across emissions.
pub fn write_spm(buf: &mut Vec<u8>, tsi: Tsi, dport: u16, spm_sqn: u32, trail: Sqn, lead: Sqn, path_nla: IpAddr) {
    buf.clear();
    put_header(buf, tsi, dport, PacketType::Spm, 0, 0);
    buf.extend_from_slice(&spm_sqn.to_be_bytes());
    buf.extend_from_slice(&trail.0.to_be_bytes());
    buf.extend_from_slice(&lead.0.to_be_bytes());
    put_nla(buf, path_nla);
    finalize_control(buf);
}

/// Build a complete SPM TPDU advertising the window extremities.
pub fn build_spm(tsi: Tsi, dport: u16, spm_sqn: u32, trail: Sqn, lead: Sqn, path_nla: IpAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 12 + nla_len(path_nla));
    write_spm(&mut buf, tsi, dport, spm_sqn, trail, lead, path_nla);
    buf
}

/// Decoded SPM body, used by loopback tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spm {
    pub spm_sqn: u32,
    pub trail: Sqn,
    pub lead: Sqn,
    pub path_nla: IpAddr,
}

/// Parse an SPM body (the TPDU after the fixed header).
pub fn parse_spm(body: &[u8]) -> Result<Spm, PgmError> {
    if body.len() < 12 {
        return Err(PgmError::Malformed);
    }
    let (path_nla, _) = parse_nla(&body[12..])?;
    Ok(Spm {
        spm_sqn: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        trail: Sqn(u32::from_be_bytes([body[4], body[5], body[6], body[7]])),
        lead: Sqn(u32::from_be_bytes([body[8], body[9], body[10], body[11]])),
        path_nla,
    })
}

fn put_nak_body(buf: &mut Vec<u8>, sqn: u32, src_nla: IpAddr, grp_nla: IpAddr) {
    buf.extend_from_slice(&sqn.to_be_bytes());
    put_nla(buf, src_nla);
    put_nla(buf, grp_nla);
}

fn put_nak_list_options(buf: &mut Vec<u8>, list: &[u32]) {
    debug_assert!(!list.is_empty() && list.len() <= MAX_NAK_LIST);
    let opt_len = OPT_HEADER_LEN + 1 + 4 * list.len();
    let total = OPT_LENGTH_LEN + opt_len;
    buf.push(OPT_LENGTH);
    buf.push(OPT_LENGTH_LEN as u8);
    buf.extend_from_slice(&(total as u16).to_be_bytes());
    buf.push(OPT_NAK_LIST | OPT_END);
    buf.push(opt_len as u8);
    buf.push(0); // opt_reserved
    buf.push(0); // list opt_reserved
    for sqn in list {
        buf.extend_from_slice(&sqn.to_be_bytes());
    }
}

/// Build a single-sequence NCF TPDU.
pub fn build_ncf(tsi: Tsi, dport: u16, sqn: u32, src_nla: IpAddr, grp_nla: IpAddr, is_parity: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 4 + nla_len(src_nla) + nla_len(grp_nla));
    let options = if is_parity { OPT_PARITY } else { 0 };
    put_header(&mut buf, tsi, dport, PacketType::Ncf, options, 0);
    put_nak_body(&mut buf, sqn, src_nla, grp_nla);
    finalize_control(&mut buf);
    buf
}

/// Build an NCF TPDU confirming `sqn` plus the additional `list` sequences
/// via OPT_NAK_LIST.
pub fn build_ncf_list(
    tsi: Tsi,
    dport: u16,
    sqn: u32,
    list: &[u32],
    src_nla: IpAddr,
    grp_nla: IpAddr,
    is_parity: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 4 + nla_len(src_nla) + nla_len(grp_nla) + 8 + 4 * list.len());
    let mut options = OPT_PRESENT | OPT_NETWORK;
    if is_parity {
        options |= OPT_PARITY;
    }
    put_header(&mut buf, tsi, dport, PacketType::Ncf, options, 0);
    put_nak_body(&mut buf, sqn, src_nla, grp_nla);
    put_nak_list_options(&mut buf, list);
    finalize_control(&mut buf);
    buf
}

/// Build a NAK (or, with `typ = Nnak`, a null NAK) TPDU. Receiver-side
/// encoding, provided for symmetry and loopback testing.
pub fn build_nak(
    typ: PacketType,
    tsi: Tsi,
    dport: u16,
    sqn: u32,
    list: &[u32],
    src_nla: IpAddr,
    grp_nla: IpAddr,
    is_parity: bool,
) -> Vec<u8> {
    debug_assert!(matches!(typ, PacketType::Nak | PacketType::Nnak));
    let mut buf = Vec::with_capacity(HEADER_LEN + 4 + nla_len(src_nla) + nla_len(grp_nla) + 8 + 4 * list.len());
    let mut options = if list.is_empty() { 0 } else { OPT_PRESENT | OPT_NETWORK };
    if is_parity {
        options |= OPT_PARITY;
    }
    put_header(&mut buf, tsi, dport, typ, options, 0);
    put_nak_body(&mut buf, sqn, src_nla, grp_nla);
    if !list.is_empty() {
        put_nak_list_options(&mut buf, list);
    }
    finalize_control(&mut buf);
    buf
}

/// Decoded NAK / NNAK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nak {
    pub sqn: u32,
    pub src_nla: IpAddr,
    pub grp_nla: IpAddr,
    /// Additional sequences from OPT_NAK_LIST, primary excluded.
    pub list: Vec<u32>,
}

/// Parse and structurally verify a NAK-family body (NAK, NNAK).
///
/// `body` is the TPDU after the fixed header. Returns `Malformed` on any
/// of the verification failures of the codec contract: a non-zero declared
/// TSDU length, a missing or missized OPT_LENGTH under OPT_PRESENT, an
/// option running past the packet end, or an unterminated option chain.
pub fn parse_nak(header: &Header, body: &[u8]) -> Result<Nak, PgmError> {
    if header.tsdu_len != 0 {
        return Err(PgmError::Malformed);
    }
    if body.len() < 4 {
        return Err(PgmError::Malformed);
    }
    let sqn = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let (src_nla, src_len) = parse_nla(&body[4..])?;
    let (grp_nla, grp_len) = parse_nla(&body[4 + src_len..])?;
    let opts = &body[4 + src_len + grp_len..];

    let mut list = Vec::new();
    if header.options & OPT_PRESENT != 0 {
        for (opt_type, payload) in OptionIter::new(opts)? {
            if opt_type & OPT_MASK == OPT_NAK_LIST {
                // skip the option's reserved byte
                let sqns = payload.get(1..).ok_or(PgmError::Malformed)?;
                if sqns.len() % 4 != 0 || sqns.len() / 4 > MAX_NAK_LIST {
                    return Err(PgmError::Malformed);
                }
                for raw in sqns.chunks_exact(4) {
                    list.push(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));
                }
            }
        }
    } else if !opts.is_empty() {
        return Err(PgmError::Malformed);
    }

    Ok(Nak { sqn, src_nla, grp_nla, list })
}

/// Structurally verify an SPMR body.
pub fn verify_spmr(header: &Header, body: &[u8]) -> Result<(), PgmError> {
    if header.tsdu_len != 0 || !body.is_empty() {
        return Err(PgmError::Malformed);
    }
    Ok(())
}

/// Walk a PGM option chain, yielding `(opt_type, payload)` per element.
///
/// Construction validates the leading OPT_LENGTH; iteration validates
/// bounds and OPT_END termination eagerly, so a malformed chain fails at
/// `new` rather than midway through dispatch.
struct OptionIter<'a> {
    elements: std::vec::IntoIter<(u8, &'a [u8])>,
}

impl<'a> OptionIter<'a> {
    fn new(opts: &'a [u8]) -> Result<Self, PgmError> {
        // OPT_LENGTH is mandatory first and self-describing
        if opts.len() < OPT_LENGTH_LEN || opts[0] & OPT_MASK != OPT_LENGTH {
            return Err(PgmError::Malformed);
        }
        if opts[1] as usize != OPT_LENGTH_LEN {
            return Err(PgmError::Malformed);
        }
        let total = u16::from_be_bytes([opts[2], opts[3]]) as usize;
        if total < OPT_LENGTH_LEN || total > opts.len() {
            return Err(PgmError::Malformed);
        }

        let mut elements = Vec::new();
        let mut at = OPT_LENGTH_LEN;
        let mut terminated = false;
        while at < total {
            if at + OPT_HEADER_LEN > total {
                return Err(PgmError::Malformed);
            }
            let opt_type = opts[at];
            let opt_len = opts[at + 1] as usize;
            if opt_len < OPT_HEADER_LEN || at + opt_len > total {
                return Err(PgmError::Malformed);
            }
            elements.push((opt_type, &opts[at + OPT_HEADER_LEN..at + opt_len]));
            at += opt_len;
            if opt_type & OPT_END != 0 {
                terminated = true;
                break;
            }
        }
        if !terminated {
            return Err(PgmError::Malformed);
        }
        Ok(OptionIter { elements: elements.into_iter() })
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        self.elements.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tsi() -> Tsi {
        Tsi { gsi: Gsi([1, 2, 3, 4, 5, 6]), sport: 4000 }
    }

    fn src() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    fn grp() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(239, 255, 0, 1))
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        put_header(&mut buf, tsi(), 7500, PacketType::Odata, OPT_PRESENT, 42);
        let header = Header::parse(&buf).unwrap();
        assert_eq!(header.sport, 4000);
        assert_eq!(header.dport, 7500);
        assert_eq!(header.typ, PacketType::Odata);
        assert_eq!(header.options, OPT_PRESENT);
        assert_eq!(header.gsi, Gsi([1, 2, 3, 4, 5, 6]));
        assert_eq!(header.tsdu_len, 42);
    }

    #[test]
    fn test_spm_roundtrip() {
        let spm = build_spm(tsi(), 7500, 9, Sqn(3), Sqn(17), src());
        assert!(crate::checksum::verify(&spm));
        let header = Header::parse(&spm).unwrap();
        assert_eq!(header.typ, PacketType::Spm);
        assert_eq!(header.tsdu_len, 0);
        let body = parse_spm(&spm[HEADER_LEN..]).unwrap();
        assert_eq!(body.spm_sqn, 9);
        assert_eq!(body.trail, Sqn(3));
        assert_eq!(body.lead, Sqn(17));
        assert_eq!(body.path_nla, src());
    }

    #[test]
    fn test_nak_roundtrip_single() {
        let nak = build_nak(PacketType::Nak, tsi(), 7500, 11, &[], src(), grp(), false);
        assert!(crate::checksum::verify(&nak));
        let header = Header::parse(&nak).unwrap();
        assert_eq!(header.typ, PacketType::Nak);
        let parsed = parse_nak(&header, &nak[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.sqn, 11);
        assert_eq!(parsed.src_nla, src());
        assert_eq!(parsed.grp_nla, grp());
        assert!(parsed.list.is_empty());
    }

    #[test]
    fn test_nak_roundtrip_list() {
        let list = [12u32, 14, 19];
        let nak = build_nak(PacketType::Nak, tsi(), 7500, 11, &list, src(), grp(), false);
        let header = Header::parse(&nak).unwrap();
        assert_ne!(header.options & OPT_PRESENT, 0);
        let parsed = parse_nak(&header, &nak[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.sqn, 11);
        assert_eq!(parsed.list, list);
    }

    #[test]
    fn test_nak_roundtrip_ipv6() {
        let src6 = "fe80::1".parse().unwrap();
        let grp6 = "ff3e::8000:1".parse().unwrap();
        let nak = build_nak(PacketType::Nak, tsi(), 7500, 2, &[3], src6, grp6, true);
        let header = Header::parse(&nak).unwrap();
        assert_ne!(header.options & OPT_PARITY, 0);
        let parsed = parse_nak(&header, &nak[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.src_nla, src6);
        assert_eq!(parsed.grp_nla, grp6);
        assert_eq!(parsed.list, [3]);
    }

    #[test]
    fn test_ncf_list_options() {
        let ncf = build_ncf_list(tsi(), 7500, 1, &[2, 3], src(), grp(), false);
        let header = Header::parse(&ncf).unwrap();
        assert_eq!(header.typ, PacketType::Ncf);
        assert_eq!(header.options & (OPT_PRESENT | OPT_NETWORK), OPT_PRESENT | OPT_NETWORK);
        let parsed = parse_nak(&header, &ncf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.list, [2, 3]);
    }

    #[test]
    fn test_nak_nonzero_tsdu_rejected() {
        let mut nak = build_nak(PacketType::Nak, tsi(), 7500, 11, &[], src(), grp(), false);
        nak[14..16].copy_from_slice(&5u16.to_be_bytes());
        let header = Header::parse(&nak).unwrap();
        assert_eq!(parse_nak(&header, &nak[HEADER_LEN..]), Err(PgmError::Malformed));
    }

    #[test]
    fn test_nak_missing_opt_length_rejected() {
        let mut nak = build_nak(PacketType::Nak, tsi(), 7500, 11, &[12], src(), grp(), false);
        // overwrite the OPT_LENGTH type byte
        let opts_at = HEADER_LEN + 4 + 8 + 8;
        nak[opts_at] = OPT_FRAGMENT;
        let header = Header::parse(&nak).unwrap();
        assert_eq!(parse_nak(&header, &nak[HEADER_LEN..]), Err(PgmError::Malformed));
    }

    #[test]
    fn test_nak_missized_opt_length_rejected() {
        let mut nak = build_nak(PacketType::Nak, tsi(), 7500, 11, &[12], src(), grp(), false);
        let opts_at = HEADER_LEN + 4 + 8 + 8;
        nak[opts_at + 1] = 5;
        let header = Header::parse(&nak).unwrap();
        assert_eq!(parse_nak(&header, &nak[HEADER_LEN..]), Err(PgmError::Malformed));
    }

    #[test]
    fn test_nak_unterminated_chain_rejected() {
        let mut nak = build_nak(PacketType::Nak, tsi(), 7500, 11, &[12], src(), grp(), false);
        let opts_at = HEADER_LEN + 4 + 8 + 8;
        // clear OPT_END on the nak-list element
        nak[opts_at + OPT_LENGTH_LEN] &= !OPT_END;
        let header = Header::parse(&nak).unwrap();
        assert_eq!(parse_nak(&header, &nak[HEADER_LEN..]), Err(PgmError::Malformed));
    }

    #[test]
    fn test_nak_option_past_end_rejected() {
        let mut nak = build_nak(PacketType::Nak, tsi(), 7500, 11, &[12], src(), grp(), false);
        let opts_at = HEADER_LEN + 4 + 8 + 8;
        // inflate the nak-list element length beyond the packet
        nak[opts_at + OPT_LENGTH_LEN + 1] = 200;
        let header = Header::parse(&nak).unwrap();
        assert_eq!(parse_nak(&header, &nak[HEADER_LEN..]), Err(PgmError::Malformed));
    }

    #[test]
    fn test_spmr_verify() {
        let mut buf = Vec::new();
        put_header(&mut buf, tsi(), 7500, PacketType::Spmr, 0, 0);
        finalize_control(&mut buf);
        let header = Header::parse(&buf).unwrap();
        assert!(verify_spmr(&header, &buf[HEADER_LEN..]).is_ok());

        let mut bad = buf.clone();
        bad.push(0xaa);
        assert_eq!(verify_spmr(&header, &bad[HEADER_LEN..]), Err(PgmError::Malformed));
    }

    #[test]
    fn test_fragment_options_layout() {
        let mut buf = Vec::new();
        put_fragment_options(&mut buf, Sqn(7), 100, 1000);
        assert_eq!(buf.len(), FRAGMENT_OPTIONS_LEN);
        assert_eq!(buf[0], OPT_LENGTH);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]) as usize, FRAGMENT_OPTIONS_LEN);
        assert_eq!(buf[4], OPT_FRAGMENT | OPT_END);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 7);
        assert_eq!(u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]), 100);
        assert_eq!(u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]), 1000);
    }
}
