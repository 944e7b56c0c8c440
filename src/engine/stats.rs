// WAVELINK — STATS & LOSS ACCOUNTING
// Loss comes from gaps in the validated 8-byte nonce stream; pollution
// from the 802.11 classification of every sniffed frame. Rates are
// recomputed on the 1-second housekeeping tick and report -1 when the
// window saw no data.

use std::time::Duration;

/// Gap larger than this counts as a "big gap" (burst loss indicator).
const BIG_GAP_SIZE: u64 = 10;

// ============================================================================
// PUBLIC SNAPSHOTS
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct TxStats {
    pub n_injected_packets: i64,
    /// Application bytes only.
    pub n_injected_bytes_excluding_overhead: i64,
    /// Everything that hit the radio, session-key packets included.
    pub n_injected_bytes_including_overhead: i64,
    pub curr_packets_per_second: i32,
    pub curr_bits_per_second_excluding_overhead: i32,
    pub curr_bits_per_second_including_overhead: i32,
    /// Injection wall time exceeded the sane bound — TX queue pressure.
    pub count_tx_injections_error_hint: i32,
    pub count_tx_errors: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RxStats {
    /// Every sniffed frame, foreign traffic included.
    pub count_p_any: i64,
    pub count_bytes_any: i64,
    /// Frames that passed tag verification under the session key.
    pub count_p_valid: i64,
    pub count_bytes_valid: i64,
    /// -1 until the first full window.
    pub curr_packet_loss_perc: i32,
    pub curr_packets_per_second: i32,
    pub curr_bits_per_second: i32,
    pub n_received_valid_session_key_packets: i32,
    pub last_received_packet_mcs_index: i32,
    pub last_received_packet_channel_width: i32,
    pub curr_big_gaps_counter: i16,
    /// Percentage of sniffed frames not attributable to this link.
    pub curr_link_pollution_perc: i32,
    pub curr_n_likely_link_packets: i32,
}

impl RxStats {
    pub fn new() -> RxStats {
        RxStats {
            curr_packet_loss_perc: -1,
            curr_packets_per_second: -1,
            curr_bits_per_second: -1,
            last_received_packet_mcs_index: -1,
            last_received_packet_channel_width: -1,
            curr_big_gaps_counter: -1,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RxStatsPerCard {
    pub count_p_any: i64,
    pub count_p_valid: i64,
    pub curr_packet_loss_perc: i32,
    pub rssi_min_dbm: i32,
    pub rssi_avg_dbm: i32,
    pub rssi_max_dbm: i32,
    pub signal_quality: i32,
    pub is_disconnected: bool,
}

impl Default for RxStatsPerCard {
    fn default() -> Self {
        RxStatsPerCard {
            count_p_any: 0,
            count_p_valid: 0,
            curr_packet_loss_perc: -1,
            rssi_min_dbm: 0,
            rssi_avg_dbm: 0,
            rssi_max_dbm: 0,
            signal_quality: -1,
            is_disconnected: false,
        }
    }
}

// ============================================================================
// WINDOWED CALCULATORS (owned by one thread, recomputed on the 1s tick)
// ============================================================================

/// Loss from gaps in a strictly increasing sequence. Reordered or
/// duplicated values are ignored; each window reports loss percentage
/// and the count of big gaps.
pub struct SeqGapTracker {
    last: Option<u64>,
    received: u64,
    lost: u64,
    big_gaps: u16,
    curr_loss_perc: i32,
    curr_big_gaps: i16,
}

impl SeqGapTracker {
    pub fn new() -> SeqGapTracker {
        SeqGapTracker {
            last: None,
            received: 0,
            lost: 0,
            big_gaps: 0,
            curr_loss_perc: -1,
            curr_big_gaps: -1,
        }
    }

    #[inline]
    pub fn on_seq(&mut self, seq: u64) {
        match self.last {
            None => {
                self.last = Some(seq);
                self.received += 1;
            }
            Some(last) if seq > last => {
                let gap = seq - last - 1;
                self.lost += gap;
                if gap > BIG_GAP_SIZE {
                    self.big_gaps = self.big_gaps.saturating_add(1);
                }
                self.last = Some(seq);
                self.received += 1;
            }
            _ => {} // duplicate or reordered
        }
    }

    pub fn recalculate(&mut self) {
        let total = self.received + self.lost;
        self.curr_loss_perc =
            if total == 0 { -1 } else { (self.lost * 100 / total) as i32 };
        self.curr_big_gaps = if total == 0 { -1 } else { self.big_gaps as i16 };
        self.received = 0;
        self.lost = 0;
        self.big_gaps = 0;
    }

    pub fn curr_loss_perc(&self) -> i32 {
        self.curr_loss_perc
    }

    pub fn curr_big_gaps(&self) -> i16 {
        self.curr_big_gaps
    }

    pub fn reset(&mut self) {
        *self = SeqGapTracker::new();
    }
}

impl Default for SeqGapTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes per window → bits per second, -1 when the window was empty.
pub struct BitrateCalculator {
    bytes: u64,
    curr_bits_per_second: i32,
}

impl BitrateCalculator {
    pub fn new() -> BitrateCalculator {
        BitrateCalculator { bytes: 0, curr_bits_per_second: -1 }
    }

    #[inline]
    pub fn add_bytes(&mut self, n: usize) {
        self.bytes += n as u64;
    }

    pub fn recalculate(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis().max(1) as u64;
        self.curr_bits_per_second =
            if self.bytes == 0 { -1 } else { (self.bytes * 8 * 1000 / ms).min(i32::MAX as u64) as i32 };
        self.bytes = 0;
    }

    pub fn curr_bits_per_second(&self) -> i32 {
        self.curr_bits_per_second
    }
}

impl Default for BitrateCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Packets per window → packets per second, -1 when idle.
pub struct PacketsPerSecondCalculator {
    packets: u64,
    curr_packets_per_second: i32,
}

impl PacketsPerSecondCalculator {
    pub fn new() -> PacketsPerSecondCalculator {
        PacketsPerSecondCalculator { packets: 0, curr_packets_per_second: -1 }
    }

    #[inline]
    pub fn on_packet(&mut self) {
        self.packets += 1;
    }

    pub fn recalculate(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis().max(1) as u64;
        self.curr_packets_per_second =
            if self.packets == 0 { -1 } else { (self.packets * 1000 / ms).min(i32::MAX as u64) as i32 };
        self.packets = 0;
    }

    pub fn curr_packets_per_second(&self) -> i32 {
        self.curr_packets_per_second
    }
}

impl Default for PacketsPerSecondCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-card RSSI min/avg/max over one window. The average of the last
/// full window drives TX-card election.
pub struct RssiWindow {
    sum: i64,
    count: u32,
    min: i8,
    max: i8,
    last_avg: Option<i32>,
    last_min: i32,
    last_max: i32,
}

impl RssiWindow {
    pub fn new() -> RssiWindow {
        RssiWindow { sum: 0, count: 0, min: i8::MAX, max: i8::MIN, last_avg: None, last_min: 0, last_max: 0 }
    }

    #[inline]
    pub fn add(&mut self, dbm: i8) {
        self.sum += dbm as i64;
        self.count += 1;
        self.min = self.min.min(dbm);
        self.max = self.max.max(dbm);
    }

    pub fn recalculate(&mut self) {
        if self.count == 0 {
            self.last_avg = None;
            self.last_min = 0;
            self.last_max = 0;
        } else {
            self.last_avg = Some((self.sum / self.count as i64) as i32);
            self.last_min = self.min as i32;
            self.last_max = self.max as i32;
        }
        self.sum = 0;
        self.count = 0;
        self.min = i8::MAX;
        self.max = i8::MIN;
    }

    /// Average of the last completed window, None when it saw no frames.
    pub fn last_avg(&self) -> Option<i32> {
        self.last_avg
    }

    pub fn last_min(&self) -> i32 {
        self.last_min
    }

    pub fn last_max(&self) -> i32 {
        self.last_max
    }
}

impl Default for RssiWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_gap_loss_percentage() {
        let mut t = SeqGapTracker::new();
        assert_eq!(t.curr_loss_perc(), -1);
        // 1,2,4,5: one of five lost
        for s in [1u64, 2, 4, 5] {
            t.on_seq(s);
        }
        t.recalculate();
        assert_eq!(t.curr_loss_perc(), 20);
        assert_eq!(t.curr_big_gaps(), 0);
    }

    #[test]
    fn seq_gap_ignores_reorder_and_dup() {
        let mut t = SeqGapTracker::new();
        for s in [1u64, 3, 2, 3, 4] {
            t.on_seq(s);
        }
        t.recalculate();
        // 1,3,4 received, 2 counted lost by the 1→3 gap
        assert_eq!(t.curr_loss_perc(), 25);
    }

    #[test]
    fn seq_gap_big_gap_counter() {
        let mut t = SeqGapTracker::new();
        t.on_seq(1);
        t.on_seq(50);
        t.recalculate();
        assert_eq!(t.curr_big_gaps(), 1);
        // next window starts clean
        t.on_seq(51);
        t.recalculate();
        assert_eq!(t.curr_big_gaps(), 0);
    }

    #[test]
    fn bitrate_reports_idle_as_minus_one() {
        let mut b = BitrateCalculator::new();
        b.recalculate(Duration::from_secs(1));
        assert_eq!(b.curr_bits_per_second(), -1);
        b.add_bytes(1000);
        b.recalculate(Duration::from_secs(1));
        assert_eq!(b.curr_bits_per_second(), 8000);
        b.recalculate(Duration::from_secs(1));
        assert_eq!(b.curr_bits_per_second(), -1);
    }

    #[test]
    fn pps_window() {
        let mut p = PacketsPerSecondCalculator::new();
        for _ in 0..120 {
            p.on_packet();
        }
        p.recalculate(Duration::from_millis(2000));
        assert_eq!(p.curr_packets_per_second(), 60);
    }

    #[test]
    fn rssi_window_min_avg_max() {
        let mut r = RssiWindow::new();
        assert_eq!(r.last_avg(), None);
        for dbm in [-60i8, -40, -50] {
            r.add(dbm);
        }
        r.recalculate();
        assert_eq!(r.last_avg(), Some(-50));
        assert_eq!(r.last_min(), -60);
        assert_eq!(r.last_max(), -40);
        r.recalculate();
        assert_eq!(r.last_avg(), None);
    }
}
