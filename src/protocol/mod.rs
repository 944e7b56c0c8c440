// WAVELINK — PROTOCOL LAYER
// Canonical wire definitions (wire.rs), radiotap build/parse (radiotap.rs),
// 802.11 data-frame framing (ieee80211.rs).

pub mod ieee80211;
pub mod radiotap;
pub mod wire;
