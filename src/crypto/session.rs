// WAVELINK — SESSION-KEY ANNOUNCEMENT BOX
// The 32-byte session key is sealed with XChaCha20-Poly1305 under a key
// derived once from the static-static X25519 shared secret (HKDF-SHA256).
// Wire fields match the announcement packet: 24-byte nonce, 48-byte sealed.
// Re-announcements of the same key are idempotent on the open side.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::aead::SESSION_KEY_SIZE;
use crate::crypto::keys::LinkKeypair;
use crate::error::SessionOpenFailure;
use crate::protocol::wire::{SessionKeyPacket, SESSION_FLAG_FEC_ENABLED};

const BOX_KDF_INFO: &[u8] = b"wavelink session-key box v1";

fn box_cipher(keypair: &LinkKeypair) -> XChaCha20Poly1305 {
    let shared = keypair.shared_secret();
    let hk = Hkdf::<Sha256>::new(None, shared.as_ref());
    let mut okm = [0u8; 32];
    // 32 bytes is far below the HKDF expand limit, cannot fail
    hk.expand(BOX_KDF_INFO, &mut okm).unwrap();
    let cipher = XChaCha20Poly1305::new_from_slice(&okm).unwrap();
    okm.zeroize();
    cipher
}

// ============================================================================
// TX SIDE
// ============================================================================

/// Owns the TX session key and the ready-to-send announcement packet.
pub struct SessionSealer {
    cipher: XChaCha20Poly1305,
    session_key: Zeroizing<[u8; SESSION_KEY_SIZE]>,
    packet: SessionKeyPacket,
    fec_enabled: bool,
    n_max: u8,
}

impl SessionSealer {
    pub fn new(keypair: &LinkKeypair, fec_enabled: bool, n_max: u8) -> SessionSealer {
        let mut sealer = SessionSealer {
            cipher: box_cipher(keypair),
            session_key: Zeroizing::new([0u8; SESSION_KEY_SIZE]),
            packet: bytemuck::Zeroable::zeroed(),
            fec_enabled,
            n_max,
        };
        sealer.rekey();
        sealer
    }

    /// Fresh random session key + box nonce; rebuilds the announcement.
    /// Called at construction and on FEC nonce exhaustion.
    pub fn rekey(&mut self) {
        OsRng.fill_bytes(self.session_key.as_mut());
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), &self.session_key[..])
            .expect("session key seal");
        debug_assert_eq!(sealed.len(), 48);
        self.packet.nonce = nonce;
        self.packet.sealed.copy_from_slice(&sealed);
        self.packet.flags = if self.fec_enabled { SESSION_FLAG_FEC_ENABLED } else { 0 };
        self.packet.n_max = self.n_max;
        info!("new session key sealed (fec={}, n_max={})", self.fec_enabled, self.n_max);
    }

    pub fn session_key(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.session_key
    }

    pub fn packet(&self) -> &SessionKeyPacket {
        &self.packet
    }
}

// ============================================================================
// RX SIDE
// ============================================================================

/// Opens announcements and tracks the currently installed session key.
pub struct SessionOpener {
    cipher: XChaCha20Poly1305,
    session_key: Option<Zeroizing<[u8; SESSION_KEY_SIZE]>>,
    pub fec_enabled: bool,
    pub n_max: u8,
}

impl SessionOpener {
    pub fn new(keypair: &LinkKeypair) -> SessionOpener {
        SessionOpener { cipher: box_cipher(keypair), session_key: None, fec_enabled: false, n_max: 0 }
    }

    /// Open one announcement. Ok(true) = a different key was installed
    /// (callers reset decoders and fire new-session callbacks);
    /// Ok(false) = idempotent re-announcement of the installed key.
    pub fn on_session_packet(&mut self, pkt: &SessionKeyPacket) -> Result<bool, SessionOpenFailure> {
        let nonce = pkt.nonce;
        let sealed = pkt.sealed;
        let opened = self
            .cipher
            .decrypt(XNonce::from_slice(&nonce), &sealed[..])
            .map_err(|_| SessionOpenFailure)?;
        if opened.len() != SESSION_KEY_SIZE {
            warn!("session announcement opened to {} bytes", opened.len());
            return Err(SessionOpenFailure);
        }
        let mut new_key = Zeroizing::new([0u8; SESSION_KEY_SIZE]);
        new_key.copy_from_slice(&opened);
        drop(Zeroizing::new(opened));

        let is_new = match &self.session_key {
            Some(current) => current[..] != new_key[..],
            None => true,
        };
        if is_new {
            info!("new session detected");
            self.session_key = Some(new_key);
            self.fec_enabled = pkt.flags & SESSION_FLAG_FEC_ENABLED != 0;
            self.n_max = pkt.n_max;
        } else {
            debug!("session key re-announced");
        }
        Ok(is_new)
    }

    pub fn session_key(&self) -> Option<&[u8; SESSION_KEY_SIZE]> {
        self.session_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (LinkKeypair, LinkKeypair) {
        // zero-seed pair: both roles share the identical keypair
        (LinkKeypair::load(None).unwrap(), LinkKeypair::load(None).unwrap())
    }

    #[test]
    fn seal_open_roundtrip() {
        let (tx_keys, rx_keys) = pair();
        let sealer = SessionSealer::new(&tx_keys, true, 12);
        let mut opener = SessionOpener::new(&rx_keys);
        assert_eq!(opener.on_session_packet(sealer.packet()), Ok(true));
        assert_eq!(opener.session_key().unwrap(), sealer.session_key());
        assert!(opener.fec_enabled);
        assert_eq!(opener.n_max, 12);
    }

    #[test]
    fn reannounce_is_idempotent() {
        let (tx_keys, rx_keys) = pair();
        let sealer = SessionSealer::new(&tx_keys, false, 0);
        let mut opener = SessionOpener::new(&rx_keys);
        assert_eq!(opener.on_session_packet(sealer.packet()), Ok(true));
        for _ in 0..5 {
            assert_eq!(opener.on_session_packet(sealer.packet()), Ok(false));
        }
    }

    #[test]
    fn rekey_installs_exactly_once() {
        let (tx_keys, rx_keys) = pair();
        let mut sealer = SessionSealer::new(&tx_keys, false, 0);
        let mut opener = SessionOpener::new(&rx_keys);
        assert_eq!(opener.on_session_packet(sealer.packet()), Ok(true));
        sealer.rekey();
        assert_eq!(opener.on_session_packet(sealer.packet()), Ok(true));
        assert_eq!(opener.on_session_packet(sealer.packet()), Ok(false));
        assert_eq!(opener.session_key().unwrap(), sealer.session_key());
    }

    #[test]
    fn tampered_announcement_fails_open() {
        let (tx_keys, rx_keys) = pair();
        let sealer = SessionSealer::new(&tx_keys, false, 0);
        let mut opener = SessionOpener::new(&rx_keys);
        let mut pkt = *sealer.packet();
        pkt.sealed[0] ^= 0xFF;
        assert_eq!(opener.on_session_packet(&pkt), Err(SessionOpenFailure));
        assert!(opener.session_key().is_none());
    }

    #[test]
    fn foreign_keypair_cannot_open() {
        let tx_keys = LinkKeypair::from_seed(&[3u8; 32]);
        let sealer = SessionSealer::new(&tx_keys, false, 0);
        let (_, rx_keys) = pair();
        let mut opener = SessionOpener::new(&rx_keys);
        assert_eq!(opener.on_session_packet(sealer.packet()), Err(SessionOpenFailure));
    }
}
