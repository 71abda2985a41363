//! Systematic (n, k) Reed–Solomon erasure coding over GF(256).
//!
//! A transmission group of `k` original packets admits up to `n - k` parity
//! packets. Parity block `h` is the linear combination of the `k` source
//! blocks under row `k + h` of a normalized Cauchy matrix, which is MDS:
//! any `k` of the `n` blocks recover the originals.

use gf256::gf::gf;

use crate::PgmError;

// Field matching the classic CM256 polynomial: index 3 = 0xa6,
// (0xa6 << 1) | 1 = 0x14d, generator 0x02.
#[gf(polynomial = 0x14d, generator = 0x2)]
pub type Gf256;

/// Generate a Cauchy matrix element.
///
/// The matrix is normalized so the first parity row is all 1s:
///   a_ij = (y_j + x_0) / (x_i + y_j)
///
/// Where:
/// - x_i is the recovery block index (k..n)
/// - x_0 = k (first recovery block index)
/// - y_j is the original block index (column, 0..k)
#[inline]
fn matrix_element(x_i: u8, x_0: u8, y_j: u8) -> Gf256 {
    let numerator = Gf256(y_j) + Gf256(x_0);
    let denominator = Gf256(x_i) + Gf256(y_j);
    numerator / denominator
}

/// Systematic Reed–Solomon encoder/decoder for one (n, k) parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReedSolomon {
    n: u8,
    k: u8,
}

impl ReedSolomon {
    /// Create a codec for `n` total blocks of which `k` are original.
    ///
    /// Requires `0 < k < n <= 255`.
    pub fn new(n: u8, k: u8) -> Result<Self, PgmError> {
        if k == 0 || k >= n {
            return Err(PgmError::Invalid);
        }
        Ok(ReedSolomon { n, k })
    }

    #[inline]
    pub fn n(&self) -> u8 {
        self.n
    }

    #[inline]
    pub fn k(&self) -> u8 {
        self.k
    }

    /// Number of parity blocks available per group.
    #[inline]
    pub fn parity_count(&self) -> u8 {
        self.n - self.k
    }

    /// Encode one parity block into `out`.
    ///
    /// `sources` must hold the `k` original blocks; `index` is the block
    /// index of the parity to synthesize, `k + h` for parity offset `h`.
    /// Source slices shorter than `out` contribute implicit zero padding.
    pub fn encode(&self, sources: &[&[u8]], index: u8, out: &mut [u8]) {
        debug_assert_eq!(sources.len(), self.k as usize);
        debug_assert!(index >= self.k && index < self.n);

        out.fill(0);
        for (j, src) in sources.iter().enumerate() {
            let coeff = matrix_element(index, self.k, j as u8);
            for (dst, byte) in out.iter_mut().zip(src.iter()) {
                *dst ^= (coeff * Gf256(*byte)).0;
            }
        }
    }

    /// Recover the `k` original blocks from any `k` received blocks.
    ///
    /// `blocks` pairs each received block with its index: originals carry
    /// their position `0..k`, parity blocks carry `k + h`. Fails with
    /// `Invalid` on wrong counts, duplicate indices, or a singular system
    /// (which the Cauchy construction rules out for distinct indices).
    pub fn decode(&self, blocks: &[(u8, &[u8])], block_len: usize) -> Result<Vec<Vec<u8>>, PgmError> {
        let k = self.k as usize;
        if blocks.len() != k {
            return Err(PgmError::Invalid);
        }
        for (i, (index, data)) in blocks.iter().enumerate() {
            if *index >= self.n || data.len() != block_len {
                return Err(PgmError::Invalid);
            }
            if blocks[..i].iter().any(|(other, _)| other == index) {
                return Err(PgmError::Invalid);
            }
        }

        // rows of the generator matrix restricted to the received indices
        let mut matrix = vec![Gf256(0); k * k];
        let mut rhs: Vec<Vec<u8>> = blocks.iter().map(|(_, data)| data.to_vec()).collect();
        for (r, (index, _)) in blocks.iter().enumerate() {
            for c in 0..k {
                matrix[r * k + c] = if (*index as usize) < k {
                    Gf256(u8::from(*index as usize == c))
                } else {
                    matrix_element(*index, self.k, c as u8)
                };
            }
        }

        // Gaussian elimination, pivoting on nonzero elements
        for col in 0..k {
            let pivot = (col..k)
                .find(|&r| matrix[r * k + col] != Gf256(0))
                .ok_or(PgmError::Invalid)?;
            if pivot != col {
                for c in 0..k {
                    matrix.swap(pivot * k + c, col * k + c);
                }
                rhs.swap(pivot, col);
            }

            let inv = Gf256(1) / matrix[col * k + col];
            for c in 0..k {
                matrix[col * k + c] = matrix[col * k + c] * inv;
            }
            for byte in rhs[col].iter_mut() {
                *byte = (inv * Gf256(*byte)).0;
            }

            for r in 0..k {
                if r == col || matrix[r * k + col] == Gf256(0) {
                    continue;
                }
                let factor = matrix[r * k + col];
                for c in 0..k {
                    let scaled = factor * matrix[col * k + c];
                    matrix[r * k + c] = matrix[r * k + c] + scaled;
                }
                let (head, tail) = rhs.split_at_mut(r.max(col));
                let (row, src) = if r > col {
                    (&mut tail[0], &head[col][..])
                } else {
                    (&mut head[r], &tail[0][..])
                };
                for (dst, byte) in row.iter_mut().zip(src.iter()) {
                    *dst ^= (factor * Gf256(*byte)).0;
                }
            }
        }

        Ok(rhs)
    }
}
