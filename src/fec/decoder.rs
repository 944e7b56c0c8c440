// WAVELINK — FEC DECODER
// Per-block reassembly keyed by block_idx with duplicate suppression.
// Delivery rules:
//   - primaries of the oldest active block are forwarded the moment they
//     form a contiguous prefix (no added latency on a clean link)
//   - a block completes when any k of its k+r fragments arrived; missing
//     primaries are then recovered and delivered in index order
//   - blocks deliver strictly in block_idx order; a finished newer block
//     is held until the older one finishes or is declared lost
//   - forward-progress eviction: the front block is abandoned (partials
//     delivered, gaps skipped) once a block two indices ahead finished,
//     on ~1s timeout, or under ring pressure
// Late fragments for retired blocks are dropped silently.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::fec::rs::RsCodec;
use crate::fec::{
    block_idx_of, fragment_idx_of, make_nonce, MAX_PRIMARY_FRAGMENTS, MAX_TOTAL_FRAGMENTS,
    FRAGMENT_PREAMBLE_SIZE,
};

pub const RX_RING_SIZE: usize = 40;
pub const FORWARD_HORIZON: u64 = 2;
pub const BLOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Delivery seam: recovered application payloads, in order per stream.
pub trait PayloadSink {
    fn on_payload(&mut self, nonce: u64, stream_index: u8, payload: &[u8]);
}

impl<F: FnMut(u64, u8, &[u8])> PayloadSink for F {
    fn on_payload(&mut self, nonce: u64, stream_index: u8, payload: &[u8]) {
        self(nonce, stream_index, payload)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderStats {
    pub count_fragments: u64,
    pub count_duplicates: u64,
    pub count_late: u64,
    pub count_malformed: u64,
    pub count_recovered: u64,
    pub count_blocks_complete: u64,
    pub count_blocks_lost: u64,
}

enum Shard {
    /// Primary fragment payload, preamble included, unpadded.
    Primary(Vec<u8>),
    /// Secondary parity bytes, preamble stripped (already padded length).
    Secondary(Vec<u8>),
}

struct RxBlock {
    block_idx: u64,
    stream_index: u8,
    shards: Vec<Option<Shard>>,
    n_present: usize,
    /// Primary count, learned from any secondary preamble.
    k: Option<usize>,
    /// Shard length the parity was computed over.
    padded_len: Option<usize>,
    /// Contiguous primaries already handed to the sink.
    n_forwarded: usize,
    finished: bool,
    first_seen: Instant,
}

impl RxBlock {
    fn new(block_idx: u64, stream_index: u8, now: Instant) -> RxBlock {
        RxBlock {
            block_idx,
            stream_index,
            shards: Vec::new(),
            n_present: 0,
            k: None,
            padded_len: None,
            n_forwarded: 0,
            finished: false,
            first_seen: now,
        }
    }

    fn slot(&mut self, idx: usize) -> &mut Option<Shard> {
        if self.shards.len() <= idx {
            self.shards.resize_with(idx + 1, || None);
        }
        &mut self.shards[idx]
    }

    /// Highest present secondary index, if any.
    fn max_secondary_idx(&self) -> Option<usize> {
        self.shards
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| matches!(s, Some(Shard::Secondary(_))))
            .map(|(i, _)| i)
    }
}

pub struct FecDecoder {
    ring: VecDeque<RxBlock>,
    /// Blocks below this index are retired; their stragglers are late.
    first_undelivered: u64,
    codec_cache: Option<RsCodec>,
    pub stats: DecoderStats,
}

impl FecDecoder {
    pub fn new() -> FecDecoder {
        FecDecoder {
            ring: VecDeque::new(),
            first_undelivered: 0,
            codec_cache: None,
            stats: DecoderStats::default(),
        }
    }

    /// Feed one validated fragment. `now` drives the timeout policy.
    pub fn process_fragment(
        &mut self,
        nonce: u64,
        stream_index: u8,
        payload: &[u8],
        now: Instant,
        sink: &mut dyn PayloadSink,
    ) {
        self.stats.count_fragments += 1;
        let block_idx = block_idx_of(nonce);
        let fragment_idx = fragment_idx_of(nonce) as usize;
        if block_idx < self.first_undelivered {
            self.stats.count_late += 1;
            return;
        }
        if payload.len() < FRAGMENT_PREAMBLE_SIZE || fragment_idx >= MAX_TOTAL_FRAGMENTS {
            self.stats.count_malformed += 1;
            return;
        }
        let flag = payload[0];
        let length = u16::from_le_bytes([payload[1], payload[2]]) as usize;

        let shard = if flag == 0 {
            if length + FRAGMENT_PREAMBLE_SIZE > payload.len() {
                self.stats.count_malformed += 1;
                return;
            }
            Shard::Primary(payload[..FRAGMENT_PREAMBLE_SIZE + length].to_vec())
        } else {
            let k = flag as usize;
            if k > MAX_PRIMARY_FRAGMENTS
                || fragment_idx < k
                || payload.len() - FRAGMENT_PREAMBLE_SIZE != length
            {
                self.stats.count_malformed += 1;
                return;
            }
            Shard::Secondary(payload[FRAGMENT_PREAMBLE_SIZE..].to_vec())
        };

        // Locate or create the block, keeping the ring sorted by index.
        let pos = match self.ring.binary_search_by_key(&block_idx, |b| b.block_idx) {
            Ok(pos) => pos,
            Err(pos) => {
                self.ring.insert(pos, RxBlock::new(block_idx, stream_index, now));
                pos
            }
        };
        let block = &mut self.ring[pos];

        if block.slot(fragment_idx).is_some() {
            self.stats.count_duplicates += 1;
            return;
        }
        if let Shard::Secondary(_) = shard {
            block.k = Some(flag as usize);
            block.padded_len = Some(length);
        }
        *block.slot(fragment_idx) = Some(shard);
        block.n_present += 1;

        self.try_complete(pos);
        // Memory bound: a fragment beyond the ring force-evicts the oldest.
        while self.ring.len() > RX_RING_SIZE {
            self.abandon_front(sink);
        }
        self.drive(now, sink);
    }

    /// Run the timeout policy; called on the engine's housekeeping tick.
    pub fn poll(&mut self, now: Instant, sink: &mut dyn PayloadSink) {
        self.drive(now, sink);
    }

    /// Attempt RS completion of one block (held or front).
    fn try_complete(&mut self, pos: usize) {
        let need_recovery = {
            let block = &self.ring[pos];
            if block.finished {
                return;
            }
            let Some(k) = block.k else { return };
            if block.n_present < k {
                return;
            }
            (0..k).any(|i| !matches!(block.shards.get(i), Some(Some(Shard::Primary(_)))))
        };
        if need_recovery {
            if let Err(()) = self.recover_block(pos) {
                // singular sub-matrix or inconsistent lengths — salvage
                // whatever primaries are present (drive delivers them)
                warn!(
                    "FEC recovery failed for block {} — delivering partials",
                    self.ring[pos].block_idx
                );
            }
        }
        let block = &mut self.ring[pos];
        block.finished = true;
        self.stats.count_blocks_complete += 1;
    }

    fn recover_block(&mut self, pos: usize) -> Result<(), ()> {
        let block = &mut self.ring[pos];
        let k = block.k.ok_or(())?;
        let padded_len = block.padded_len.ok_or(())?;
        let max_sec = block.max_secondary_idx().ok_or(())?;
        let r = max_sec + 1 - k;

        let mut work: Vec<Option<Vec<u8>>> = Vec::with_capacity(k + r);
        for i in 0..(k + r) {
            let entry = match block.shards.get(i) {
                Some(Some(Shard::Primary(p))) if i < k => {
                    if p.len() > padded_len {
                        return Err(());
                    }
                    let mut padded = p.clone();
                    padded.resize(padded_len, 0);
                    Some(padded)
                }
                Some(Some(Shard::Secondary(s))) if i >= k => {
                    if s.len() != padded_len {
                        return Err(());
                    }
                    Some(s.clone())
                }
                _ => None,
            };
            work.push(entry);
        }

        let codec = match self.codec_cache.take() {
            Some(c) if c.k() == k && c.n() >= k + r => c,
            _ => RsCodec::new(k, r),
        };
        let result = codec.reconstruct(&mut work);
        self.codec_cache = Some(codec);
        result.map_err(|_| ())?;

        for (i, entry) in work.into_iter().enumerate().take(k) {
            if matches!(block.shards.get(i), Some(Some(Shard::Primary(_)))) {
                continue;
            }
            let rebuilt = entry.ok_or(())?;
            let length =
                u16::from_le_bytes([rebuilt[1], rebuilt[2]]) as usize;
            if rebuilt[0] != 0 || FRAGMENT_PREAMBLE_SIZE + length > rebuilt.len() {
                return Err(());
            }
            let mut payload = rebuilt;
            payload.truncate(FRAGMENT_PREAMBLE_SIZE + length);
            *block.slot(i) = Some(Shard::Primary(payload));
            self.stats.count_recovered += 1;
        }
        Ok(())
    }

    /// Deliver everything the ordering policy allows right now.
    fn drive(&mut self, now: Instant, sink: &mut dyn PayloadSink) {
        loop {
            let Some(front) = self.ring.front() else { return };
            let front_idx = front.block_idx;

            self.forward_contiguous(sink);

            let front = &self.ring[0];
            if front.finished {
                let upper = front.k.unwrap_or(0);
                if front.n_forwarded >= upper {
                    self.retire_front();
                    continue;
                }
                // finished but a hole remains: recovery failed — abandon
                self.abandon_front(sink);
                continue;
            }
            let horizon_passed = self
                .ring
                .iter()
                .any(|b| b.finished && b.block_idx >= front_idx + FORWARD_HORIZON);
            if horizon_passed || now.duration_since(front.first_seen) > BLOCK_TIMEOUT {
                self.abandon_front(sink);
                continue;
            }
            return;
        }
    }

    /// Forward the front block's contiguous primary prefix.
    fn forward_contiguous(&mut self, sink: &mut dyn PayloadSink) {
        let Some(front) = self.ring.front_mut() else { return };
        let limit = front.k.unwrap_or(MAX_PRIMARY_FRAGMENTS);
        let mut forwarded_any = false;
        while front.n_forwarded < limit {
            let idx = front.n_forwarded;
            let Some(Some(Shard::Primary(payload))) = front.shards.get(idx) else { break };
            sink.on_payload(
                make_nonce(front.block_idx, idx as u8),
                front.stream_index,
                &payload[FRAGMENT_PREAMBLE_SIZE..],
            );
            front.n_forwarded += 1;
            forwarded_any = true;
        }
        if forwarded_any {
            // older blocks may no longer slip in ahead of delivered data
            self.first_undelivered = self.first_undelivered.max(front.block_idx);
        }
    }

    /// Retire a fully delivered front block.
    fn retire_front(&mut self) {
        if let Some(block) = self.ring.pop_front() {
            self.first_undelivered = block.block_idx + 1;
        }
    }

    /// Declare the front block lost: deliver its remaining primaries in
    /// index order (gaps skipped), then advance.
    fn abandon_front(&mut self, sink: &mut dyn PayloadSink) {
        let Some(mut block) = self.ring.pop_front() else { return };
        let limit = block.k.unwrap_or(MAX_PRIMARY_FRAGMENTS).min(block.shards.len());
        for idx in block.n_forwarded..limit {
            if let Some(Some(Shard::Primary(payload))) = block.shards.get(idx) {
                sink.on_payload(
                    make_nonce(block.block_idx, idx as u8),
                    block.stream_index,
                    &payload[FRAGMENT_PREAMBLE_SIZE..],
                );
            }
        }
        if !block.finished {
            self.stats.count_blocks_lost += 1;
            debug!(
                "block {} abandoned with {}/{} fragments",
                block.block_idx,
                block.n_present,
                block.k.map(|k| k.to_string()).unwrap_or_else(|| "?".into())
            );
        }
        block.shards.clear();
        self.first_undelivered = block.block_idx + 1;
    }

    /// Discard all pending blocks (session reset / shutdown).
    pub fn reset(&mut self) {
        self.ring.clear();
        self.first_undelivered = 0;
        self.codec_cache = None;
    }
}

impl Default for FecDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FEC-DISABLED BYPASS
// ============================================================================

/// Pass-through with duplicate/reorder suppression by nonce comparison.
pub struct FecDisabledDecoder {
    last_nonce: Option<u64>,
    pub count_dropped: u64,
}

impl FecDisabledDecoder {
    pub fn new() -> FecDisabledDecoder {
        FecDisabledDecoder { last_nonce: None, count_dropped: 0 }
    }

    pub fn process_packet(
        &mut self,
        nonce: u64,
        stream_index: u8,
        payload: &[u8],
        sink: &mut dyn PayloadSink,
    ) {
        match self.last_nonce {
            Some(last) if nonce <= last => self.count_dropped += 1,
            _ => {
                self.last_nonce = Some(nonce);
                sink.on_payload(nonce, stream_index, payload);
            }
        }
    }
}

impl Default for FecDisabledDecoder {
    fn default() -> Self {
        Self::new()
    }
}
