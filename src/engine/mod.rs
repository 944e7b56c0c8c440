// WAVELINK — ENGINE LAYER
// stats.rs — loss, rate and RSSI accounting
// txrx.rs  — LinkEngine: TX path, RX thread, card diversity

pub mod stats;
pub mod txrx;
