// WAVELINK — ERROR KINDS
// Only configuration errors surface to the caller (construction time).
// Everything else on the data path is counted, rate-limit logged and dropped.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Keyfile missing, unreadable or not secret(32)||peer_public(32).
    #[error("keyfile {path}: {reason}")]
    ConfigKeyfile { path: PathBuf, reason: String },

    /// Engine constructed with no cards, or a card option combination
    /// that cannot work (e.g. auto TX switch with zero cards).
    #[error("config: {0}")]
    Config(String),

    /// Raw card I/O failed during construction.
    #[error("card {card}: {source}")]
    ConfigCard {
        card: usize,
        #[source]
        source: io::Error,
    },
}

/// AEAD tag verification failed. Routine on a polluted channel; the
/// packet is dropped and counted, never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthFailure;

/// Session-key announcement could not be opened (wrong keypair or a
/// foreign link on the same channel). Dropped and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOpenFailure;
