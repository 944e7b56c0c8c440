// WAVELINK — CRATE ROOT (LIBRARY)
// Broadcast-style bidirectional link over raw 802.11 frames.
//
// Module hierarchy:
//   protocol/  — Wire format: data header, session-key packet, radiotap, 802.11
//   crypto/    — Long-term keys, per-packet AEAD envelope, session-key box
//   fec/       — GF(256), systematic Reed-Solomon, block encoder/decoder
//   radio/     — RawCard seam (external frame I/O) + loopback pipe card
//   engine/    — LinkEngine: TX path, RX thread, diversity, stats
//   nal        — H.264/H.265 end-of-frame detectors for variable FEC

pub mod crypto;
pub mod engine;
pub mod error;
pub mod fec;
pub mod nal;
pub mod protocol;
pub mod radio;

pub use engine::stats::{RxStats, RxStatsPerCard, TxStats};
pub use engine::txrx::{FecConfig, LinkEngine, Options};
pub use error::Error;
pub use nal::Codec;
pub use protocol::radiotap::RadiotapParams;
pub use radio::RawCard;
