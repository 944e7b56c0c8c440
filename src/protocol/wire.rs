// WAVELINK — WIRE PROTOCOL
// Canonical definitions for the on-wire format.
// All constants are the single source of truth — no duplication.
// Integer fields are little-endian throughout.

use std::mem;

use bytemuck::{Pod, Zeroable};

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

/// The final injected frame (radiotap + 802.11 + payload) never exceeds this.
pub const MAX_FRAME_SIZE: usize = 1510;
/// Fixed TX radiotap header length (see radiotap.rs).
pub const RADIOTAP_TX_HEADER_SIZE: usize = 13;
/// 802.11 data frame header length (see ieee80211.rs).
pub const IEEE80211_HEADER_SIZE: usize = 24;
/// Usable bytes of 802.11 payload per injected frame.
pub const RAW_FRAME_MAX_PAYLOAD_SIZE: usize =
    MAX_FRAME_SIZE - RADIOTAP_TX_HEADER_SIZE - IEEE80211_HEADER_SIZE;
const _: () = assert!(RAW_FRAME_MAX_PAYLOAD_SIZE == 1473);

/// Poly1305 tag appended to every data packet.
pub const AEAD_TAG_SIZE: usize = 16;
/// Upper bound on bytes accepted by `inject` per packet.
pub const MAX_PACKET_PAYLOAD_SIZE: usize = RAW_FRAME_MAX_PAYLOAD_SIZE - AEAD_TAG_SIZE;
const _: () = assert!(MAX_PACKET_PAYLOAD_SIZE == 1457);

/// Multiplexed stream indices usable by the application.
pub const STREAM_INDEX_MIN: u8 = 0;
pub const STREAM_INDEX_MAX: u8 = 127;
/// Reserved: the raw radio-port byte value tagging session-key frames.
pub const RADIO_PORT_SESSION_KEY: u8 = 128;

// ============================================================================
// RADIO PORT BYTE
// ============================================================================

/// 1-byte stream tag: bit7 = encrypted, bits0-6 = stream index.
/// The raw value 0x80 is reserved for session-key frames, which is why
/// stream 0 cannot be injected with encryption enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioPort {
    pub encrypted: bool,
    pub stream_index: u8,
}

impl RadioPort {
    #[inline(always)]
    pub fn to_byte(self) -> u8 {
        (if self.encrypted { 0x80 } else { 0 }) | (self.stream_index & 0x7F)
    }

    #[inline(always)]
    pub fn from_byte(b: u8) -> Self {
        RadioPort { encrypted: b & 0x80 != 0, stream_index: b & 0x7F }
    }
}

// ============================================================================
// DATA PACKET HEADER
// ============================================================================

/// Cleartext header preceding every data payload. Also the AEAD
/// associated data, so any tampering fails tag verification.
/// Wire: port(1) + nonce(8 LE) + seq(2 LE) = 11 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub radio_port: u8,
    pub nonce: u64,
    pub seq: u16,
}

pub const DATA_HEADER_SIZE: usize = 11;

impl DataHeader {
    #[inline]
    pub fn serialize(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut out = [0u8; DATA_HEADER_SIZE];
        out[0] = self.radio_port;
        out[1..9].copy_from_slice(&self.nonce.to_le_bytes());
        out[9..11].copy_from_slice(&self.seq.to_le_bytes());
        out
    }

    #[inline]
    pub fn parse(buf: &[u8]) -> Option<DataHeader> {
        if buf.len() < DATA_HEADER_SIZE {
            return None;
        }
        Some(DataHeader {
            radio_port: buf[0],
            nonce: u64::from_le_bytes(buf[1..9].try_into().ok()?),
            seq: u16::from_le_bytes(buf[9..11].try_into().ok()?),
        })
    }
}

// ============================================================================
// SESSION-KEY PACKET
// ============================================================================

/// Session-key announcement payload, sent on RADIO_PORT_SESSION_KEY.
/// sealed = XChaCha20-Poly1305 box of the 32-byte session key under the
/// pairwise long-term box key (32 + 16 bytes).
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SessionKeyPacket {
    pub nonce: [u8; 24],
    pub sealed: [u8; 48],
    pub flags: u8,
    pub n_max: u8,
}

pub const SESSION_KEY_PACKET_SIZE: usize = mem::size_of::<SessionKeyPacket>();
const _: () = assert!(SESSION_KEY_PACKET_SIZE == 74);

/// flags bit0: subsequent data packets are FEC-protected.
pub const SESSION_FLAG_FEC_ENABLED: u8 = 0x01;

impl SessionKeyPacket {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_PACKET_SIZE] {
        bytemuck::cast_ref(self)
    }

    #[inline]
    pub fn parse(buf: &[u8]) -> Option<&SessionKeyPacket> {
        let arr: &[u8; SESSION_KEY_PACKET_SIZE] = buf.get(..SESSION_KEY_PACKET_SIZE)?.try_into().ok()?;
        Some(bytemuck::cast_ref(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_port_byte_roundtrip() {
        for stream in 0..=STREAM_INDEX_MAX {
            for &enc in &[false, true] {
                let rp = RadioPort { encrypted: enc, stream_index: stream };
                assert_eq!(RadioPort::from_byte(rp.to_byte()), rp);
            }
        }
    }

    #[test]
    fn session_tag_is_encrypted_stream_zero() {
        let rp = RadioPort { encrypted: true, stream_index: 0 };
        assert_eq!(rp.to_byte(), RADIO_PORT_SESSION_KEY);
    }

    #[test]
    fn data_header_roundtrip() {
        let hdr = DataHeader { radio_port: 0x87, nonce: 0x0123_4567_89AB_CDEF, seq: 0xBEEF };
        let bytes = hdr.serialize();
        assert_eq!(DataHeader::parse(&bytes), Some(hdr));
        // little-endian nonce on the wire
        assert_eq!(bytes[1], 0xEF);
        assert_eq!(bytes[8], 0x01);
    }

    #[test]
    fn data_header_short_buffer() {
        assert_eq!(DataHeader::parse(&[0u8; 10]), None);
    }

    #[test]
    fn session_key_packet_layout() {
        let mut pkt = SessionKeyPacket::zeroed();
        pkt.nonce[0] = 0xAA;
        pkt.sealed[47] = 0xBB;
        pkt.flags = SESSION_FLAG_FEC_ENABLED;
        pkt.n_max = 12;
        let bytes = *pkt.as_bytes();
        assert_eq!(bytes[0], 0xAA);
        assert_eq!(bytes[24 + 47], 0xBB);
        assert_eq!(bytes[72], SESSION_FLAG_FEC_ENABLED);
        assert_eq!(bytes[73], 12);
        let back = SessionKeyPacket::parse(&bytes).unwrap();
        assert_eq!(back.n_max, 12);
    }
}
