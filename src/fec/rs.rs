// WAVELINK — SYSTEMATIC REED-SOLOMON ERASURE CODEC
// Generator: (k+r)×k Vandermonde matrix right-multiplied by the inverse of
// its top k×k square, so the first k rows become the identity and any k
// rows stay invertible (MDS). Encoding MACs the parity rows over the source
// shards; decoding inverts the surviving sub-generator by Gauss-Jordan and
// rebuilds only the missing sources.

use crate::fec::gf256;
use crate::fec::{MAX_PRIMARY_FRAGMENTS, MAX_TOTAL_FRAGMENTS};

/// Surviving sub-generator turned out singular. Cannot happen for distinct
/// fragment indices — indicates corrupted fragment indexing upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError;

pub struct RsCodec {
    k: usize,
    n: usize,
    /// n rows × k columns; rows[0..k] form the identity.
    rows: Vec<Vec<u8>>,
}

fn vandermonde_row(x: usize, k: usize) -> Vec<u8> {
    (0..k).map(|j| gf256::pow(x as u8, j)).collect()
}

/// Invert a k×k matrix in place via Gauss-Jordan. Returns None if singular.
fn invert(mut m: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    let k = m.len();
    let mut out: Vec<Vec<u8>> = (0..k)
        .map(|i| {
            let mut row = vec![0u8; k];
            row[i] = 1;
            row
        })
        .collect();
    for col in 0..k {
        // pivot search
        let pivot = (col..k).find(|&r| m[r][col] != 0)?;
        m.swap(col, pivot);
        out.swap(col, pivot);
        let scale = gf256::inv(m[col][col]);
        if scale != 1 {
            for v in m[col].iter_mut() {
                *v = gf256::mul(*v, scale);
            }
            for v in out[col].iter_mut() {
                *v = gf256::mul(*v, scale);
            }
        }
        for r in 0..k {
            if r == col {
                continue;
            }
            let factor = m[r][col];
            if factor == 0 {
                continue;
            }
            let (pivot_row, other_row) = if r < col {
                let (a, b) = m.split_at_mut(col);
                (&b[0], &mut a[r])
            } else {
                let (a, b) = m.split_at_mut(r);
                (&a[col], &mut b[0])
            };
            gf256::region_multiply_add(other_row, pivot_row, factor);
            let (pivot_row, other_row) = if r < col {
                let (a, b) = out.split_at_mut(col);
                (&b[0], &mut a[r])
            } else {
                let (a, b) = out.split_at_mut(r);
                (&a[col], &mut b[0])
            };
            gf256::region_multiply_add(other_row, pivot_row, factor);
        }
    }
    Some(out)
}

impl RsCodec {
    /// Build the systematic generator for k sources and r parity rows.
    pub fn new(k: usize, r: usize) -> RsCodec {
        assert!(k >= 1 && k <= MAX_PRIMARY_FRAGMENTS);
        assert!(k + r <= MAX_TOTAL_FRAGMENTS);
        let n = k + r;
        let top: Vec<Vec<u8>> = (0..k).map(|i| vandermonde_row(i, k)).collect();
        // Vandermonde with distinct points is always invertible
        let top_inv = invert(top).expect("vandermonde top square invertible");
        let mut rows = Vec::with_capacity(n);
        for i in 0..k {
            let mut row = vec![0u8; k];
            row[i] = 1;
            rows.push(row);
        }
        for i in k..n {
            let v = vandermonde_row(i, k);
            let mut row = vec![0u8; k];
            for (j, cell) in row.iter_mut().enumerate() {
                for (t, &vt) in v.iter().enumerate() {
                    *cell ^= gf256::mul(vt, top_inv[t][j]);
                }
            }
            rows.push(row);
        }
        RsCodec { k, n, rows }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Compute the r parity shards over k equal-length source shards.
    pub fn encode_parity(&self, sources: &[&[u8]]) -> Vec<Vec<u8>> {
        assert_eq!(sources.len(), self.k);
        let len = sources[0].len();
        debug_assert!(sources.iter().all(|s| s.len() == len));
        let mut parities = Vec::with_capacity(self.n - self.k);
        for row in &self.rows[self.k..] {
            let mut parity = vec![0u8; len];
            for (i, src) in sources.iter().enumerate() {
                gf256::region_multiply_add(&mut parity, src, row[i]);
            }
            parities.push(parity);
        }
        parities
    }

    /// Fill in the missing source shards of a block. `shards` is indexed by
    /// fragment index (sources `0..k`, parity `k..n`), each present shard
    /// padded to the common length. Requires at least k present shards.
    ///
    /// When every source is already present this performs no field
    /// operations at all.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), DecodeError> {
        assert!(shards.len() <= self.n);
        let missing_sources: Vec<usize> =
            (0..self.k).filter(|&i| shards.get(i).map_or(true, |s| s.is_none())).collect();
        if missing_sources.is_empty() {
            return Ok(());
        }
        let survivors: Vec<usize> = (0..shards.len()).filter(|&i| shards[i].is_some()).collect();
        if survivors.len() < self.k {
            return Err(DecodeError);
        }
        let survivors = &survivors[..self.k];
        let sub: Vec<Vec<u8>> = survivors.iter().map(|&i| self.rows[i].clone()).collect();
        let inv = invert(sub).ok_or(DecodeError)?;
        let len = shards[survivors[0]].as_ref().map(|s| s.len()).unwrap_or(0);
        for &m in &missing_sources {
            let mut rebuilt = vec![0u8; len];
            for (t, &s_idx) in survivors.iter().enumerate() {
                let shard = shards[s_idx].as_ref().ok_or(DecodeError)?;
                if shard.len() != len {
                    return Err(DecodeError);
                }
                gf256::region_multiply_add(&mut rebuilt, shard, inv[m][t]);
            }
            shards[m] = Some(rebuilt);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(i: usize, len: usize) -> Vec<u8> {
        (0..len).map(|j| ((i * 131 + j * 7) & 0xFF) as u8).collect()
    }

    fn roundtrip(k: usize, r: usize, len: usize, drop: &[usize]) {
        let codec = RsCodec::new(k, r);
        let sources: Vec<Vec<u8>> = (0..k).map(|i| shard(i, len)).collect();
        let refs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();
        let parities = codec.encode_parity(&refs);
        assert_eq!(parities.len(), r);

        let mut shards: Vec<Option<Vec<u8>>> = sources
            .iter()
            .cloned()
            .map(Some)
            .chain(parities.iter().cloned().map(Some))
            .collect();
        for &d in drop {
            shards[d] = None;
        }
        codec.reconstruct(&mut shards).unwrap();
        for i in 0..k {
            assert_eq!(shards[i].as_ref().unwrap(), &sources[i], "k={k} r={r} source {i}");
        }
    }

    #[test]
    fn identity_top_rows() {
        let codec = RsCodec::new(5, 3);
        for i in 0..5 {
            for j in 0..5 {
                assert_eq!(codec.rows[i][j], u8::from(i == j));
            }
        }
    }

    #[test]
    fn recover_any_r_losses() {
        roundtrip(4, 2, 100, &[1, 3]);
        roundtrip(4, 2, 100, &[0, 1]);
        roundtrip(4, 2, 100, &[2, 5]); // one source + one parity lost
        roundtrip(4, 2, 100, &[4, 5]); // both parities lost — pure copy
        roundtrip(1, 1, 64, &[0]);
        roundtrip(8, 4, 1449, &[0, 2, 4, 6]);
    }

    #[test]
    fn exhaustive_double_loss_small_block() {
        for a in 0..6 {
            for b in (a + 1)..6 {
                roundtrip(4, 2, 37, &[a, b]);
            }
        }
    }

    #[test]
    fn large_k_roundtrip() {
        let drops: Vec<usize> = (0..16).map(|i| i * 8).collect();
        roundtrip(128, 16, 200, &drops);
    }

    #[test]
    fn all_sources_present_is_pure_fast_path() {
        let codec = RsCodec::new(4, 2);
        let sources: Vec<Vec<u8>> = (0..4).map(|i| shard(i, 50)).collect();
        // no parity shard present at all: the fast path must not need them
        let mut shards: Vec<Option<Vec<u8>>> =
            sources.iter().cloned().map(Some).chain([None, None]).collect();
        codec.reconstruct(&mut shards).unwrap();
        for i in 0..4 {
            assert_eq!(shards[i].as_ref().unwrap(), &sources[i]);
        }
    }

    #[test]
    fn too_many_losses_fail() {
        let codec = RsCodec::new(4, 2);
        let sources: Vec<Vec<u8>> = (0..4).map(|i| shard(i, 50)).collect();
        let refs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();
        let parities = codec.encode_parity(&refs);
        let mut shards: Vec<Option<Vec<u8>>> = vec![None, None, None];
        shards.push(Some(sources[3].clone()));
        shards.push(Some(parities[0].clone()));
        shards.push(Some(parities[1].clone()));
        assert_eq!(codec.reconstruct(&mut shards), Err(DecodeError));
    }
}
