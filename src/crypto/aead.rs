// WAVELINK — PER-PACKET AEAD ENVELOPE
// ChaCha20-Poly1305 under the current session key.
// Nonce layout: zeros(4) || packet_nonce(8 LE) = 12 bytes.
// AAD: the 11-byte cleartext data header.
// Encryption is per-packet optional: with it off, the payload rides in
// cleartext and the tag covers header || payload (integrity stays on).

use ring::aead::{Aad, LessSafeKey, Nonce, Tag, UnboundKey, CHACHA20_POLY1305};

use crate::error::AuthFailure;
use crate::protocol::wire::{DataHeader, AEAD_TAG_SIZE};

pub const SESSION_KEY_SIZE: usize = 32;

/// Seals / opens data packets under one session key. Rebuilt on rekey.
pub struct PacketCipher {
    key: LessSafeKey,
}

#[inline(always)]
fn packet_nonce(nonce: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..12].copy_from_slice(&nonce.to_le_bytes());
    // 12 fixed bytes, cannot fail
    Nonce::try_assume_unique_for_key(&bytes).unwrap()
}

impl PacketCipher {
    pub fn new(session_key: &[u8; SESSION_KEY_SIZE]) -> PacketCipher {
        // 32-byte key for CHACHA20_POLY1305, cannot fail
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, session_key).unwrap();
        PacketCipher { key: LessSafeKey::new(unbound) }
    }

    /// Produce the wire body following the header: ciphertext-or-plaintext
    /// plus the 16-byte tag.
    pub fn seal(&self, hdr: &DataHeader, payload: &[u8], encrypt: bool) -> Vec<u8> {
        let nonce = packet_nonce(hdr.nonce);
        let mut out = Vec::with_capacity(payload.len() + AEAD_TAG_SIZE);
        let tag = if encrypt {
            out.extend_from_slice(payload);
            self.key
                .seal_in_place_separate_tag(nonce, Aad::from(hdr.serialize()), &mut out)
                .unwrap()
        } else {
            out.extend_from_slice(payload);
            self.key
                .seal_in_place_separate_tag(nonce, Aad::from(validate_aad(hdr, payload)), &mut [])
                .unwrap()
        };
        out.extend_from_slice(tag.as_ref());
        out
    }

    /// Verify (and decrypt when `encrypted`) a received body. Returns the
    /// plaintext payload, or `AuthFailure` on any mismatch.
    pub fn open(&self, hdr: &DataHeader, body: &[u8], encrypted: bool) -> Result<Vec<u8>, AuthFailure> {
        if body.len() < AEAD_TAG_SIZE {
            return Err(AuthFailure);
        }
        let (content, tag_bytes) = body.split_at(body.len() - AEAD_TAG_SIZE);
        let tag_arr: [u8; AEAD_TAG_SIZE] = tag_bytes.try_into().map_err(|_| AuthFailure)?;
        let tag = Tag::from(tag_arr);
        let nonce = packet_nonce(hdr.nonce);
        if encrypted {
            let mut buf = content.to_vec();
            self.key
                .open_in_place_separate_tag(nonce, Aad::from(hdr.serialize()), tag, &mut buf, 0..)
                .map_err(|_| AuthFailure)?;
            Ok(buf)
        } else {
            self.key
                .open_in_place_separate_tag(nonce, Aad::from(validate_aad(hdr, content)), tag, &mut [], 0..)
                .map_err(|_| AuthFailure)?;
            Ok(content.to_vec())
        }
    }
}

/// Validate-only AAD: header || payload, tag over the empty message.
fn validate_aad(hdr: &DataHeader, payload: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(hdr.serialize().len() + payload.len());
    aad.extend_from_slice(&hdr.serialize());
    aad.extend_from_slice(payload);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PacketCipher {
        PacketCipher::new(&[7u8; 32])
    }

    fn hdr(nonce: u64) -> DataHeader {
        DataHeader { radio_port: 0x87, nonce, seq: 4 }
    }

    #[test]
    fn encrypted_roundtrip() {
        let c = cipher();
        let body = c.seal(&hdr(1), b"hello link", true);
        assert_eq!(body.len(), 10 + AEAD_TAG_SIZE);
        assert_ne!(&body[..10], b"hello link"); // actually encrypted
        let plain = c.open(&hdr(1), &body, true).unwrap();
        assert_eq!(plain, b"hello link");
    }

    #[test]
    fn validate_only_roundtrip_is_cleartext() {
        let c = cipher();
        let body = c.seal(&hdr(2), b"telemetry", false);
        assert_eq!(&body[..9], b"telemetry");
        let plain = c.open(&hdr(2), &body, false).unwrap();
        assert_eq!(plain, b"telemetry");
    }

    #[test]
    fn any_bit_flip_fails_auth() {
        let c = cipher();
        for &encrypt in &[true, false] {
            let body = c.seal(&hdr(3), b"payload bytes", encrypt);
            for i in 0..body.len() {
                let mut bad = body.clone();
                bad[i] ^= 0x01;
                assert_eq!(c.open(&hdr(3), &bad, encrypt), Err(AuthFailure), "flip at {i}");
            }
        }
    }

    #[test]
    fn header_tamper_fails_auth() {
        let c = cipher();
        let body = c.seal(&hdr(4), b"x", true);
        assert_eq!(c.open(&hdr(5), &body, true), Err(AuthFailure)); // nonce
        let mut other = hdr(4);
        other.radio_port ^= 1;
        assert_eq!(c.open(&other, &body, true), Err(AuthFailure)); // port
        let mut other = hdr(4);
        other.seq ^= 1;
        assert_eq!(c.open(&other, &body, true), Err(AuthFailure)); // seq
    }

    #[test]
    fn wrong_session_key_fails() {
        let a = PacketCipher::new(&[1u8; 32]);
        let b = PacketCipher::new(&[2u8; 32]);
        let body = a.seal(&hdr(6), b"payload", true);
        assert_eq!(b.open(&hdr(6), &body, true), Err(AuthFailure));
    }

    #[test]
    fn mode_mismatch_fails() {
        let c = cipher();
        let body = c.seal(&hdr(7), b"payload", true);
        assert_eq!(c.open(&hdr(7), &body, false), Err(AuthFailure));
    }

    #[test]
    fn truncated_body_fails() {
        let c = cipher();
        assert_eq!(c.open(&hdr(8), &[0u8; 15], true), Err(AuthFailure));
        assert_eq!(c.open(&hdr(8), &[], false), Err(AuthFailure));
    }

    #[test]
    fn empty_payload_roundtrip() {
        let c = cipher();
        let body = c.seal(&hdr(9), b"", true);
        assert_eq!(body.len(), AEAD_TAG_SIZE);
        assert_eq!(c.open(&hdr(9), &body, true).unwrap(), b"");
    }
}
