// WAVELINK — CRYPTO LAYER
// keys.rs    — long-term X25519 keypair + keyfile loading
// aead.rs    — per-packet ChaCha20-Poly1305 envelope (encrypt / validate-only)
// session.rs — session-key announcement box (XChaCha20-Poly1305 over static DH)

pub mod aead;
pub mod keys;
pub mod session;
