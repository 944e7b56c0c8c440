// WAVELINK — RADIOTAP
// TX: fixed 13-byte injection header (TX_FLAGS + MCS fields).
// RX: present-word chain walk to pull per-antenna RSSI, MCS, width, bad-FCS.
// Repeated present words re-open the same namespace, which is how drivers
// report one signal/antenna pair per chain.

use crate::protocol::wire::RADIOTAP_TX_HEADER_SIZE;

// Present-word bits (radiotap field index)
const RT_TSFT: u32 = 0;
const RT_FLAGS: u32 = 1;
const RT_RATE: u32 = 2;
const RT_CHANNEL: u32 = 3;
const RT_FHSS: u32 = 4;
const RT_DBM_ANTSIGNAL: u32 = 5;
const RT_DBM_ANTNOISE: u32 = 6;
const RT_LOCK_QUALITY: u32 = 7;
const RT_TX_ATTENUATION: u32 = 8;
const RT_DB_TX_ATTENUATION: u32 = 9;
const RT_DBM_TX_POWER: u32 = 10;
const RT_ANTENNA: u32 = 11;
const RT_DB_ANTSIGNAL: u32 = 12;
const RT_DB_ANTNOISE: u32 = 13;
const RT_RX_FLAGS: u32 = 14;
const RT_TX_FLAGS: u32 = 15;
const RT_RTS_RETRIES: u32 = 16;
const RT_DATA_RETRIES: u32 = 17;
const RT_MCS: u32 = 19;
const RT_AMPDU_STATUS: u32 = 20;
const RT_VHT: u32 = 21;
const RT_TIMESTAMP: u32 = 22;
const RT_EXT: u32 = 31;

// FLAGS field bits
const F_BADFCS: u8 = 0x40;

// MCS field: known bits
const MCS_KNOWN_BW: u8 = 0x01;
const MCS_KNOWN_MCS: u8 = 0x02;
const MCS_KNOWN_GI: u8 = 0x04;
const MCS_KNOWN_FEC: u8 = 0x10;
const MCS_KNOWN_STBC: u8 = 0x20;
// MCS field: flags bits
const MCS_FLAGS_BW_40: u8 = 0x01;
const MCS_FLAGS_SGI: u8 = 0x04;
const MCS_FLAGS_FEC_LDPC: u8 = 0x10;
const MCS_FLAGS_STBC_SHIFT: u8 = 5;

// TX flags
const TXF_NOACK: u16 = 0x0008;

/// User-selectable injection parameters. Applied on the next injected
/// packet after `LinkEngine::update_radiotap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadiotapParams {
    pub mcs_index: u8,
    /// 20 or 40 (MHz)
    pub channel_width_mhz: u8,
    pub short_gi: bool,
    /// 0 = off, 1..=3 = number of STBC streams
    pub stbc: u8,
    pub ldpc: bool,
}

impl Default for RadiotapParams {
    fn default() -> Self {
        RadiotapParams { mcs_index: 3, channel_width_mhz: 20, short_gi: false, stbc: 0, ldpc: false }
    }
}

/// Serialize the fixed TX radiotap header:
/// version(1) pad(1) len(2) present(4) tx_flags(2) mcs_known(1) mcs_flags(1) mcs_index(1)
pub fn build_tx_header(params: &RadiotapParams) -> [u8; RADIOTAP_TX_HEADER_SIZE] {
    let mut out = [0u8; RADIOTAP_TX_HEADER_SIZE];
    out[2..4].copy_from_slice(&(RADIOTAP_TX_HEADER_SIZE as u16).to_le_bytes());
    let present: u32 = (1 << RT_TX_FLAGS) | (1 << RT_MCS);
    out[4..8].copy_from_slice(&present.to_le_bytes());
    out[8..10].copy_from_slice(&TXF_NOACK.to_le_bytes());
    let mut known = MCS_KNOWN_MCS | MCS_KNOWN_BW | MCS_KNOWN_GI | MCS_KNOWN_FEC;
    let mut flags = 0u8;
    if params.channel_width_mhz == 40 {
        flags |= MCS_FLAGS_BW_40;
    }
    if params.short_gi {
        flags |= MCS_FLAGS_SGI;
    }
    if params.ldpc {
        flags |= MCS_FLAGS_FEC_LDPC;
    }
    if params.stbc > 0 {
        known |= MCS_KNOWN_STBC;
        flags |= (params.stbc & 0x03) << MCS_FLAGS_STBC_SHIFT;
    }
    out[10] = known;
    out[11] = flags;
    out[12] = params.mcs_index;
    out
}

/// Everything the RX path needs from a sniffed radiotap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRadiotap {
    /// Offset of the 802.11 header (== radiotap it_len).
    pub payload_offset: usize,
    /// Max dBm antenna signal across chains, if reported.
    pub rssi_dbm: Option<i8>,
    /// Per-chain dBm values in report order (rtl8812au fixup skips [0]).
    pub rssi_per_antenna: [Option<i8>; 4],
    pub mcs_index: Option<u8>,
    pub channel_width_mhz: Option<u8>,
    /// Frame failed the hardware FCS check — must be discarded.
    pub bad_fcs: bool,
}

#[inline(always)]
fn align_up(off: usize, align: usize) -> usize {
    (off + align - 1) & !(align - 1)
}

/// (size, alignment) per radiotap field index; None = unknown field,
/// parsing must stop (sizes past it cannot be derived).
fn field_layout(bit: u32) -> Option<(usize, usize)> {
    Some(match bit {
        RT_TSFT => (8, 8),
        RT_FLAGS | RT_RATE => (1, 1),
        RT_CHANNEL => (4, 2),
        RT_FHSS => (2, 1),
        RT_DBM_ANTSIGNAL | RT_DBM_ANTNOISE => (1, 1),
        RT_LOCK_QUALITY | RT_TX_ATTENUATION | RT_DB_TX_ATTENUATION => (2, 2),
        RT_DBM_TX_POWER | RT_ANTENNA | RT_DB_ANTSIGNAL | RT_DB_ANTNOISE => (1, 1),
        RT_RX_FLAGS | RT_TX_FLAGS => (2, 2),
        RT_RTS_RETRIES | RT_DATA_RETRIES => (1, 1),
        RT_MCS => (3, 1),
        RT_AMPDU_STATUS => (8, 4),
        RT_VHT => (12, 2),
        RT_TIMESTAMP => (12, 8),
        _ => return None,
    })
}

/// Parse a sniffed frame's radiotap header. Returns None on a frame too
/// short or structurally broken to trust.
pub fn parse(frame: &[u8]) -> Option<RxRadiotap> {
    if frame.len() < 8 || frame[0] != 0 {
        return None;
    }
    let it_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    if it_len < 8 || it_len > frame.len() {
        return None;
    }
    let hdr = &frame[..it_len];

    // Present-word chain: bit31 of each word announces one more.
    let mut present_words = Vec::with_capacity(2);
    let mut off = 4;
    loop {
        if off + 4 > hdr.len() {
            return None;
        }
        let word = u32::from_le_bytes(hdr[off..off + 4].try_into().ok()?);
        present_words.push(word);
        off += 4;
        if word & (1 << RT_EXT) == 0 {
            break;
        }
        if present_words.len() > 8 {
            return None; // runaway chain
        }
    }

    let mut out = RxRadiotap {
        payload_offset: it_len,
        rssi_dbm: None,
        rssi_per_antenna: [None; 4],
        mcs_index: None,
        channel_width_mhz: None,
        bad_fcs: false,
    };
    let mut antenna_slot = 0usize;

    'words: for &word in &present_words {
        for bit in 0..RT_EXT {
            if word & (1 << bit) == 0 {
                continue;
            }
            let (size, align) = match field_layout(bit) {
                Some(l) => l,
                None => break 'words,
            };
            off = align_up(off, align);
            if off + size > hdr.len() {
                break 'words;
            }
            match bit {
                RT_FLAGS => {
                    if hdr[off] & F_BADFCS != 0 {
                        out.bad_fcs = true;
                    }
                }
                RT_DBM_ANTSIGNAL => {
                    let dbm = hdr[off] as i8;
                    if antenna_slot < out.rssi_per_antenna.len() {
                        out.rssi_per_antenna[antenna_slot] = Some(dbm);
                        antenna_slot += 1;
                    }
                    out.rssi_dbm = Some(match out.rssi_dbm {
                        Some(best) if best >= dbm => best,
                        _ => dbm,
                    });
                }
                RT_MCS => {
                    let known = hdr[off];
                    let flags = hdr[off + 1];
                    if known & MCS_KNOWN_MCS != 0 {
                        out.mcs_index = Some(hdr[off + 2]);
                    }
                    if known & MCS_KNOWN_BW != 0 {
                        out.channel_width_mhz =
                            Some(if flags & MCS_FLAGS_BW_40 != 0 { 40 } else { 20 });
                    }
                }
                _ => {}
            }
            off += size;
        }
    }
    Some(out)
}
