// WAVELINK — LONG-TERM KEY MATERIAL
// Keyfile layout (symmetric on both ends): own_secret(32) || peer_public(32).
// Without a keyfile both roles derive the identical deterministic pair from
// an all-zero seed — development only, announced loudly in the log.

use std::path::Path;

use log::warn;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::Error;

pub const SECRET_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const KEYFILE_SIZE: usize = SECRET_KEY_SIZE + PUBLIC_KEY_SIZE;

/// One endpoint's long-term keypair plus the peer's public key.
pub struct LinkKeypair {
    secret: StaticSecret,
    public: PublicKey,
    peer_public: PublicKey,
}

impl std::fmt::Debug for LinkKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkKeypair").finish_non_exhaustive()
    }
}

impl LinkKeypair {
    /// Load from a keyfile, or fall back to the deterministic zero-seed
    /// pair when no path is given.
    pub fn load(path: Option<&Path>) -> Result<LinkKeypair, Error> {
        match path {
            Some(p) => Self::from_keyfile(p),
            None => {
                warn!("no keyfile given — using deterministic development keys");
                Ok(Self::from_seed(&[0u8; 32]))
            }
        }
    }

    fn from_keyfile(path: &Path) -> Result<LinkKeypair, Error> {
        let raw = Zeroizing::new(std::fs::read(path).map_err(|e| Error::ConfigKeyfile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?);
        if raw.len() != KEYFILE_SIZE {
            return Err(Error::ConfigKeyfile {
                path: path.to_path_buf(),
                reason: format!("expected {} bytes, found {}", KEYFILE_SIZE, raw.len()),
            });
        }
        let mut secret_bytes = [0u8; SECRET_KEY_SIZE];
        secret_bytes.copy_from_slice(&raw[..SECRET_KEY_SIZE]);
        let mut peer_bytes = [0u8; PUBLIC_KEY_SIZE];
        peer_bytes.copy_from_slice(&raw[SECRET_KEY_SIZE..]);
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let public = PublicKey::from(&secret);
        Ok(LinkKeypair { secret, public, peer_public: PublicKey::from(peer_bytes) })
    }

    /// Deterministic pair: clamped SHA-512(seed)[0..32] secret. Both roles
    /// derive the same keypair, so the peer key is our own public key.
    pub fn from_seed(seed: &[u8; 32]) -> LinkKeypair {
        let mut digest = Sha512::digest(seed);
        let mut secret_bytes = [0u8; SECRET_KEY_SIZE];
        secret_bytes.copy_from_slice(&digest[..SECRET_KEY_SIZE]);
        digest.as_mut_slice().zeroize();
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let public = PublicKey::from(&secret);
        LinkKeypair { secret, public, peer_public: public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Static-static DH with the peer. Both ends compute the same value,
    /// which keys the session-key box.
    pub fn shared_secret(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.diffie_hellman(&self.peer_public).to_bytes())
    }
}
