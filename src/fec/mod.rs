// WAVELINK — FORWARD ERROR CORRECTION
// gf256.rs   — GF(2^8) arithmetic + SIMD region ops
// rs.rs      — systematic Vandermonde Reed-Solomon erasure codec
// encoder.rs — fixed/variable-k block encoder + FEC-disabled bypass
// decoder.rs — block reassembly, recovery, in-order delivery

pub mod decoder;
pub mod encoder;
pub mod gf256;
pub mod rs;

/// Upper bound on primary fragments per block.
pub const MAX_PRIMARY_FRAGMENTS: usize = 128;
/// Upper bound on primary + secondary fragments per block
/// (fragment_idx is one byte; 255 keeps every generator row distinct).
pub const MAX_TOTAL_FRAGMENTS: usize = 255;
/// Largest application payload accepted per FEC-protected packet.
pub const MAX_FEC_PAYLOAD_SIZE: usize = 1449;

/// Per-fragment preamble: flag(1) + length(2 LE).
/// flag == 0: primary, length = unpadded payload length.
/// flag != 0: secondary, flag = the block's primary count k,
///            length = padded shard length the parity was computed over.
pub const FRAGMENT_PREAMBLE_SIZE: usize = 3;

#[inline(always)]
pub fn block_idx_of(nonce: u64) -> u64 {
    nonce >> 8
}

#[inline(always)]
pub fn fragment_idx_of(nonce: u64) -> u8 {
    (nonce & 0xFF) as u8
}

#[inline(always)]
pub fn make_nonce(block_idx: u64, fragment_idx: u8) -> u64 {
    (block_idx << 8) | fragment_idx as u64
}
