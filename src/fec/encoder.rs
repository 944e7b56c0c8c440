// WAVELINK — FEC ENCODER
// Buffers primary fragments for the open block and emits them immediately
// (the TX path never waits on a block); parity fragments are computed and
// emitted when the block closes. A block closes on an external end-of-block
// hint (variable mode), or when k_max primaries have been buffered.
// Nonce = block_idx << 8 | fragment_idx, strictly increasing per session.

use log::warn;

use crate::fec::rs::RsCodec;
use crate::fec::{
    make_nonce, MAX_FEC_PAYLOAD_SIZE, MAX_PRIMARY_FRAGMENTS, MAX_TOTAL_FRAGMENTS,
    FRAGMENT_PREAMBLE_SIZE,
};

/// Output seam. The engine seals, frames and injects each fragment.
pub trait FragmentSink {
    fn on_fragment(&mut self, nonce: u64, payload: &[u8]);
}

impl<F: FnMut(u64, &[u8])> FragmentSink for F {
    fn on_fragment(&mut self, nonce: u64, payload: &[u8]) {
        self(nonce, payload)
    }
}

/// Largest block index before the 56-bit field would wrap.
const MAX_BLOCK_IDX: u64 = (1 << 56) - 1;

fn primary_payload(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAGMENT_PREAMBLE_SIZE + data.len());
    out.push(0);
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn secondary_payload(k: usize, padded_len: usize, parity: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAGMENT_PREAMBLE_SIZE + parity.len());
    out.push(k as u8);
    out.extend_from_slice(&(padded_len as u16).to_le_bytes());
    out.extend_from_slice(parity);
    out
}

pub struct FecEncoder {
    k_max: usize,
    percentage: u32,
    block_idx: u64,
    /// Buffered primary shards of the open block (preamble included),
    /// kept for the parity computation at close.
    shards: Vec<Vec<u8>>,
    overflowed: bool,
    codec_cache: Option<RsCodec>,
}

impl FecEncoder {
    pub fn new(k_max: usize, percentage: u32) -> FecEncoder {
        assert!(k_max >= 1 && k_max <= MAX_PRIMARY_FRAGMENTS);
        FecEncoder {
            k_max,
            percentage,
            block_idx: 0,
            shards: Vec::with_capacity(k_max),
            overflowed: false,
            codec_cache: None,
        }
    }

    pub fn k_max(&self) -> usize {
        self.k_max
    }

    /// Parity count for a block of k primaries.
    fn parity_count(&self, k: usize) -> usize {
        let r = (k as u32 * self.percentage).div_ceil(100) as usize;
        r.min(MAX_TOTAL_FRAGMENTS - k)
    }

    /// Largest fragment count a block of this configuration can reach.
    /// Announced to receivers for buffer sizing.
    pub fn n_max(&self) -> usize {
        self.k_max + self.parity_count(self.k_max)
    }

    /// Feed one application packet. `end_of_block` is the external hint
    /// (NAL boundary, stream switch); ignored mid-block when k_max closes
    /// the block first.
    pub fn encode(&mut self, data: &[u8], end_of_block: bool, sink: &mut dyn FragmentSink) {
        debug_assert!(!data.is_empty() && data.len() <= MAX_FEC_PAYLOAD_SIZE);
        let fragment_idx = self.shards.len() as u8;
        let payload = primary_payload(data);
        sink.on_fragment(make_nonce(self.block_idx, fragment_idx), &payload);
        self.shards.push(payload);
        if end_of_block || self.shards.len() == self.k_max {
            self.close_block(sink);
        }
    }

    /// Close the open block early (stream switch, shutdown flush).
    pub fn flush(&mut self, sink: &mut dyn FragmentSink) {
        if !self.shards.is_empty() {
            self.close_block(sink);
        }
    }

    fn close_block(&mut self, sink: &mut dyn FragmentSink) {
        let k = self.shards.len();
        let r = self.parity_count(k);
        if r > 0 {
            let padded_len = self.shards.iter().map(Vec::len).max().unwrap_or(0);
            for shard in self.shards.iter_mut() {
                shard.resize(padded_len, 0);
            }
            let codec = match self.codec_cache.take() {
                Some(c) if c.k() == k && c.n() == k + r => c,
                _ => RsCodec::new(k, r),
            };
            let refs: Vec<&[u8]> = self.shards.iter().map(|s| s.as_slice()).collect();
            for (j, parity) in codec.encode_parity(&refs).iter().enumerate() {
                let nonce = make_nonce(self.block_idx, (k + j) as u8);
                sink.on_fragment(nonce, &secondary_payload(k, padded_len, parity));
            }
            self.codec_cache = Some(codec);
        }
        self.shards.clear();
        if self.block_idx == MAX_BLOCK_IDX {
            warn!("FEC block index exhausted — forcing rekey");
            self.overflowed = true;
            self.block_idx = 0;
        } else {
            self.block_idx += 1;
        }
    }

    /// True once after the nonce space wrapped; the engine must rekey so
    /// reused nonces never meet the old session key.
    pub fn reset_on_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }
}

// ============================================================================
// FEC-DISABLED BYPASS
// ============================================================================

/// Straight pass-through used when FEC is off: one packet, one fragment,
/// sequential nonces, no preamble.
pub struct FecDisabledEncoder {
    nonce: u64,
    overflowed: bool,
}

impl FecDisabledEncoder {
    pub fn new() -> FecDisabledEncoder {
        FecDisabledEncoder { nonce: 0, overflowed: false }
    }

    pub fn encode(&mut self, data: &[u8], sink: &mut dyn FragmentSink) {
        sink.on_fragment(self.nonce, data);
        if self.nonce == u64::MAX {
            self.overflowed = true;
            self.nonce = 0;
        } else {
            self.nonce += 1;
        }
    }

    pub fn reset_on_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }
}

impl Default for FecDisabledEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::{block_idx_of, fragment_idx_of};

    fn collect(encoder: &mut FecEncoder, packets: &[(&[u8], bool)]) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut sink = |nonce: u64, payload: &[u8]| out.push((nonce, payload.to_vec()));
        for (data, end) in packets {
            encoder.encode(data, *end, &mut sink);
        }
        out
    }

    #[test]
    fn fixed_k_block_shape() {
        let mut enc = FecEncoder::new(4, 50);
        let out = collect(
            &mut enc,
            &[(&[1u8; 100], false), (&[2u8; 200], false), (&[3u8; 100], false), (&[4u8; 300], true)],
        );
        // 4 primaries + ceil(4*50/100)=2 parities
        assert_eq!(out.len(), 6);
        for (i, (nonce, payload)) in out.iter().enumerate() {
            assert_eq!(block_idx_of(*nonce), 0);
            assert_eq!(fragment_idx_of(*nonce) as usize, i);
            if i < 4 {
                assert_eq!(payload[0], 0);
                let len = u16::from_le_bytes([payload[1], payload[2]]) as usize;
                assert_eq!(len, payload.len() - FRAGMENT_PREAMBLE_SIZE);
            } else {
                assert_eq!(payload[0], 4); // secondary carries k
                let padded = u16::from_le_bytes([payload[1], payload[2]]) as usize;
                assert_eq!(padded, 300 + FRAGMENT_PREAMBLE_SIZE);
                assert_eq!(payload.len(), padded + FRAGMENT_PREAMBLE_SIZE);
            }
        }
    }

    #[test]
    fn nonces_strictly_increase_across_blocks() {
        let mut enc = FecEncoder::new(3, 34);
        let packets: Vec<(Vec<u8>, bool)> = (0..10).map(|i| (vec![i as u8; 20], false)).collect();
        let refs: Vec<(&[u8], bool)> = packets.iter().map(|(d, e)| (d.as_slice(), *e)).collect();
        let out = collect(&mut enc, &refs);
        for pair in out.windows(2) {
            assert!(pair[1].0 > pair[0].0, "{} !> {}", pair[1].0, pair[0].0);
        }
    }

    #[test]
    fn variable_k_closes_on_hint() {
        let mut enc = FecEncoder::new(128, 50);
        let out = collect(&mut enc, &[(&[9u8; 10], false), (&[8u8; 10], true), (&[7u8; 10], false)]);
        // block 0: 2 primaries + 1 parity; block 1: 1 primary so far
        assert_eq!(out.len(), 4);
        assert_eq!(block_idx_of(out[2].0), 0);
        assert_eq!(fragment_idx_of(out[2].0), 2);
        assert_eq!(out[2].1[0], 2); // k = 2
        assert_eq!(block_idx_of(out[3].0), 1);
    }

    #[test]
    fn kmax_closes_without_hint() {
        let mut enc = FecEncoder::new(2, 100);
        let out = collect(&mut enc, &[(&[1u8; 5], false), (&[2u8; 5], false)]);
        // 2 primaries + 2 parities
        assert_eq!(out.len(), 4);
        assert_eq!(block_idx_of(out[3].0), 0);
    }

    #[test]
    fn flush_emits_parity_for_partial_block() {
        let mut enc = FecEncoder::new(8, 100);
        let mut out = Vec::new();
        let mut sink = |nonce: u64, payload: &[u8]| out.push((nonce, payload.to_vec()));
        enc.encode(&[5u8; 10], false, &mut sink);
        enc.flush(&mut sink);
        enc.flush(&mut sink); // idempotent on empty block
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].1[0], 1); // k = 1
    }

    #[test]
    fn zero_percentage_emits_no_parity() {
        let mut enc = FecEncoder::new(4, 0);
        let out = collect(&mut enc, &[(&[1u8; 5], true)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn parity_count_clamped_to_fragment_space() {
        let enc = FecEncoder::new(128, 100);
        assert_eq!(enc.n_max(), 255); // 128 + 128 clamped to 255 total
    }

    #[test]
    fn bypass_sequential_nonces() {
        let mut enc = FecDisabledEncoder::new();
        let mut out = Vec::new();
        let mut sink = |nonce: u64, payload: &[u8]| out.push((nonce, payload.to_vec()));
        enc.encode(b"a", &mut sink);
        enc.encode(b"b", &mut sink);
        assert_eq!(out[0].0, 0);
        assert_eq!(out[1].0, 1);
        assert_eq!(out[1].1, b"b");
        assert!(!enc.reset_on_overflow());
    }
}
