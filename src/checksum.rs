//! Incremental Internet checksum (RFC 1071).
//!
//! The PGM header checksum is the standard one's-complement sum over the
//! whole TPDU. Partial sums are kept unfolded in 32 bits so that
//! non-contiguous regions can be summed independently and combined with
//! [`block_add`]; [`fold`] collapses the accumulator into the 16-bit wire
//! value at the end.
//!
//! The algebra that makes retransmission cheap:
//!
//! ```text
//! fold(partial(A ++ B)) == fold(block_add(partial(A), partial(B), A.len()))
//! ```
//!
//! so the payload sum of a data packet can be memoized at first transmission
//! and only the rewritten header needs re-summing for each repair.

/// Unfolded one's-complement sum over `buf`.
///
/// An odd trailing byte is summed as the high byte of a zero-padded word,
/// per RFC 1071.
pub fn partial(buf: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut words = buf.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Copy `src` into the front of `dst` and return the unfolded sum of the
/// copied bytes.
pub fn partial_copy(src: &[u8], dst: &mut [u8]) -> u32 {
    dst[..src.len()].copy_from_slice(src);
    partial(&dst[..src.len()])
}

/// Combine two partial sums where the second covers bytes starting at
/// `offset` relative to the first region's start.
///
/// An odd offset means the second region's bytes land on swapped lanes of
/// the 16-bit words, so its sum is byte-swapped before adding.
pub fn block_add(sum: u32, sum2: u32, offset: usize) -> u32 {
    let mut sum2 = fold_carries(sum2);
    if offset & 1 == 1 {
        sum2 = ((sum2 & 0x00ff) << 8) | (sum2 >> 8);
    }
    sum + sum2
}

/// Collapse an unfolded sum into the 16-bit complemented wire checksum.
///
/// A result of zero is mapped to `0xffff`: zero in the header means "no
/// checksum" and must never be produced by an actual computation.
pub fn fold(sum: u32) -> u16 {
    let folded = !(fold_carries(sum) as u16);
    if folded == 0 {
        0xffff
    } else {
        folded
    }
}

/// Receiver-side acceptance test: the sum over a packet that includes its
/// own checksum field folds to all-ones.
pub fn verify(buf: &[u8]) -> bool {
    fold_carries(partial(buf)) == 0xffff
}

fn fold_carries(mut sum: u32) -> u32 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(buf: &[u8]) -> u16 {
        fold(partial(buf))
    }

    #[test]
    fn test_partial_even() {
        assert_eq!(partial(&[0x12, 0x34, 0x56, 0x78]), 0x1234 + 0x5678);
    }

    #[test]
    fn test_partial_odd_tail() {
        assert_eq!(partial(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
    }

    #[test]
    fn test_fold_carry_propagation() {
        // 0xffff + 0x0001 folds to 0x0001, complemented 0xfffe
        assert_eq!(fold(0xffff + 0x0001), !0x0001u16);
    }

    #[test]
    fn test_fold_never_zero() {
        // an all-ones folded sum complements to zero, which the wire
        // encoding reserves for "no checksum"
        assert_eq!(fold(0xffff), 0xffff);
    }

    #[test]
    fn test_block_add_even_split() {
        let whole = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06];
        let (a, b) = whole.split_at(2);
        assert_eq!(fold(block_add(partial(a), partial(b), a.len())), reference(&whole));
    }

    #[test]
    fn test_block_add_odd_split() {
        let whole = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        for split in 0..=whole.len() {
            let (a, b) = whole.split_at(split);
            assert_eq!(
                fold(block_add(partial(a), partial(b), a.len())),
                reference(&whole),
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_partial_copy_matches_partial() {
        let src = [0xde, 0xad, 0xbe, 0xef, 0x99];
        let mut dst = [0u8; 8];
        let sum = partial_copy(&src, &mut dst);
        assert_eq!(&dst[..5], &src);
        assert_eq!(sum, partial(&src));
    }

    #[test]
    fn test_verify_roundtrip() {
        let mut packet = vec![0x13u8, 0x37, 0x00, 0x00, 0xab, 0xcd, 0xef];
        let csum = fold(partial(&packet));
        packet[2..4].copy_from_slice(&csum.to_be_bytes());
        assert!(verify(&packet));
        packet[4] ^= 0x01;
        assert!(!verify(&packet));
    }
}
