// WAVELINK — LINK ENGINE (TxRx)
// One engine per endpoint. Callers drive TX through inject(); a single
// internal thread polls every RX card, validates, decodes and dispatches
// to per-stream callbacks. Multi-card diversity: all cards sniff, the one
// with the best windowed RSSI transmits.
//
// Locking: m_tx guards the radiotap template, the FEC encoder, the packet
// cipher and the injection write itself. Stats snapshots sit behind their
// own short-lived mutexes. Callbacks run on the RX thread and must not block.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::crypto::aead::PacketCipher;
use crate::crypto::keys::LinkKeypair;
use crate::crypto::session::{SessionOpener, SessionSealer};
use crate::engine::stats::{
    BitrateCalculator, PacketsPerSecondCalculator, RssiWindow, RxStats, RxStatsPerCard,
    SeqGapTracker, TxStats,
};
use crate::error::Error;
use crate::fec::decoder::{FecDecoder, FecDisabledDecoder, PayloadSink};
use crate::fec::encoder::{FecDisabledEncoder, FecEncoder, FragmentSink};
use crate::fec::MAX_FEC_PAYLOAD_SIZE;
use crate::nal::{is_end_of_frame, Codec};
use crate::protocol::ieee80211::{self, Direction};
use crate::protocol::radiotap::{self, RadiotapParams};
use crate::protocol::wire::{
    DataHeader, RadioPort, SessionKeyPacket, DATA_HEADER_SIZE, MAX_PACKET_PAYLOAD_SIZE,
    RADIO_PORT_SESSION_KEY, STREAM_INDEX_MAX,
};
use crate::radio::RawCard;

/// Injection wall time above this hints at an overflowing TX queue.
const MAX_SANE_INJECTION_TIME: Duration = Duration::from_millis(5);
/// Stats windows, pollution and TX-card election run on this cadence.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
/// A candidate card must beat the active one by this margin to take over.
const TX_CARD_RSSI_MARGIN: i32 = 5;
/// Bounded drain per readable card per poll wakeup.
const RX_BATCH: usize = 64;
const POLL_TIMEOUT_MS: i32 = 100;
/// Join-latency burst: announcements sent back-to-back at startup.
const STARTUP_ANNOUNCE_COUNT: usize = 5;
const STARTUP_ANNOUNCE_SPACING: Duration = Duration::from_millis(10);
/// Transient card errors tolerated before the disconnected flag latches.
const CARD_ERROR_LIMIT: u32 = 5;

const RX_FRAME_BUF_SIZE: usize = 4096;

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub enum FecConfig {
    /// One packet per fragment, sequential nonces, no parity.
    Disabled,
    /// Blocks of exactly k packets, parity = ceil(k * percentage / 100).
    Fixed { k: usize, percentage: u32 },
    /// Blocks closed by NAL end-of-frame hints (bounded by 128 packets).
    Variable { codec: Codec, percentage: u32 },
}

#[derive(Debug, Clone)]
pub struct Options {
    /// own_secret(32) || peer_public(32); None = zero-seed development keys.
    pub encryption_key_path: Option<PathBuf>,
    /// false = air unit, true = ground unit. Each side discards frames
    /// tagged with its own direction (injected-frame loopback quirk).
    pub use_gnd_identifier: bool,
    pub fec: FecConfig,
    /// Announce cadence while data is flowing.
    pub session_key_packet_interval: Duration,
    /// Re-elect the TX card by windowed RSSI; card 0 otherwise.
    pub enable_auto_switch_tx_card: bool,
    /// SCHED_FIFO for the RX thread (best effort).
    pub receive_thread_realtime: bool,
    /// Cards should restrict capture to received-direction frames where
    /// the driver supports it; recorded here for card setup code.
    pub set_direction_in_filter: bool,
    pub log_all_received: bool,
    /// Ignore the first antenna's RSSI report (rtl8812au quirk).
    pub rtl8812au_rssi_fixup: bool,
    pub advanced_debugging_tx: bool,
    pub advanced_debugging_rx: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            encryption_key_path: None,
            use_gnd_identifier: false,
            fec: FecConfig::Disabled,
            session_key_packet_interval: Duration::from_secs(1),
            enable_auto_switch_tx_card: true,
            receive_thread_realtime: false,
            set_direction_in_filter: true,
            log_all_received: false,
            rtl8812au_rssi_fixup: false,
            advanced_debugging_tx: false,
            advanced_debugging_rx: false,
        }
    }
}

// ============================================================================
// STREAM HANDLERS
// ============================================================================

/// Called on the RX thread for every delivered packet of the stream:
/// (nonce, card index the fragment arrived on, payload).
pub type PacketCallback = Box<dyn FnMut(u64, usize, &[u8]) + Send>;
/// Called on the RX thread whenever a new TX session is installed.
pub type NewSessionCallback = Box<dyn FnMut() + Send>;

struct StreamHandler {
    on_packet: PacketCallback,
    on_new_session: NewSessionCallback,
}

type HandlerMap = Arc<Mutex<HashMap<u8, StreamHandler>>>;

// ============================================================================
// CARD HANDLE
// ============================================================================

struct CardHandle {
    name: String,
    fd: std::os::fd::RawFd,
    io: Mutex<Box<dyn RawCard>>,
    disconnected: AtomicBool,
}

// ============================================================================
// TX SIDE STATE
// ============================================================================

enum TxEncoder {
    Fec { encoder: FecEncoder, codec: Option<Codec> },
    Disabled(FecDisabledEncoder),
}

/// Everything the injection path needs besides the encoder, split out so
/// the encoder callback can borrow it while the encoder itself is live.
struct TxPath {
    radiotap_params: RadiotapParams,
    radiotap_header: [u8; crate::protocol::wire::RADIOTAP_TX_HEADER_SIZE],
    direction: Direction,
    ieee_seq: u16,
    cipher: PacketCipher,
    sealer: SessionSealer,
    next_announce: Option<Instant>,
}

impl TxPath {
    /// Serialize and inject one frame on the active card. Returns payload
    /// wire size, or None on card error.
    fn inject_frame(
        &mut self,
        port_byte: u8,
        payload_after_port: &[u8],
        cards: &[CardHandle],
        card_idx: usize,
        acct: &Mutex<TxAccounting>,
    ) -> Option<usize> {
        let mut frame = Vec::with_capacity(
            self.radiotap_header.len() + 24 + 1 + payload_after_port.len(),
        );
        frame.extend_from_slice(&self.radiotap_header);
        frame.extend_from_slice(&ieee80211::build_header(port_byte, self.direction, self.ieee_seq));
        self.ieee_seq = self.ieee_seq.wrapping_add(16);
        frame.push(port_byte);
        frame.extend_from_slice(payload_after_port);

        let card = &cards[card_idx.min(cards.len() - 1)];
        let started = Instant::now();
        let result = card.io.lock().unwrap().inject_frame(&frame);
        let elapsed = started.elapsed();

        let mut acct = acct.lock().unwrap();
        if elapsed > MAX_SANE_INJECTION_TIME {
            acct.stats.count_tx_injections_error_hint += 1;
        }
        match result {
            Ok(()) => {
                acct.stats.n_injected_packets += 1;
                acct.stats.n_injected_bytes_including_overhead += frame.len() as i64;
                acct.pps.on_packet();
                acct.bitrate_incl.add_bytes(frame.len());
                Some(frame.len())
            }
            Err(e) => {
                acct.stats.count_tx_errors += 1;
                if acct.stats.count_tx_errors % 100 == 1 {
                    warn!("injection failed on {}: {}", card.name, e);
                }
                None
            }
        }
    }

    /// Seal one data fragment and inject it.
    fn send_data_fragment(
        &mut self,
        radio_port: RadioPort,
        nonce: u64,
        fragment: &[u8],
        cards: &[CardHandle],
        card_idx: usize,
        acct: &Mutex<TxAccounting>,
    ) {
        let hdr = DataHeader { radio_port: radio_port.to_byte(), nonce, seq: self.ieee_seq };
        let body = self.cipher.seal(&hdr, fragment, radio_port.encrypted);
        let mut payload = Vec::with_capacity(DATA_HEADER_SIZE - 1 + body.len());
        payload.extend_from_slice(&hdr.serialize()[1..]); // port byte is written by inject_frame
        payload.extend_from_slice(&body);
        let _ = self.inject_frame(hdr.radio_port, &payload, cards, card_idx, acct);
    }

    fn send_session_packet(&mut self, cards: &[CardHandle], card_idx: usize, acct: &Mutex<TxAccounting>) {
        let pkt = *self.sealer.packet();
        let _ = self.inject_frame(RADIO_PORT_SESSION_KEY, pkt.as_bytes(), cards, card_idx, acct);
    }

    fn announce_session_key_if_needed(
        &mut self,
        interval: Duration,
        cards: &[CardHandle],
        card_idx: usize,
        acct: &Mutex<TxAccounting>,
    ) {
        let now = Instant::now();
        let due = self.next_announce.map_or(true, |t| now >= t);
        if due {
            self.send_session_packet(cards, card_idx, acct);
            self.next_announce = Some(now + interval);
        }
    }
}

struct TxState {
    encoder: TxEncoder,
    /// (stream, encrypt) of the open FEC block; a change closes it so a
    /// block never mixes streams and recovered packets route correctly.
    open_block: Option<(u8, bool)>,
    path: TxPath,
}

struct TxAccounting {
    stats: TxStats,
    pps: PacketsPerSecondCalculator,
    bitrate_excl: BitrateCalculator,
    bitrate_incl: BitrateCalculator,
    last_recalc: Instant,
}

impl TxAccounting {
    fn new() -> TxAccounting {
        TxAccounting {
            stats: TxStats {
                curr_packets_per_second: -1,
                curr_bits_per_second_excluding_overhead: -1,
                curr_bits_per_second_including_overhead: -1,
                ..Default::default()
            },
            pps: PacketsPerSecondCalculator::new(),
            bitrate_excl: BitrateCalculator::new(),
            bitrate_incl: BitrateCalculator::new(),
            last_recalc: Instant::now(),
        }
    }

    fn maybe_recalculate(&mut self) {
        let elapsed = self.last_recalc.elapsed();
        if elapsed < HOUSEKEEPING_INTERVAL {
            return;
        }
        self.pps.recalculate(elapsed);
        self.bitrate_excl.recalculate(elapsed);
        self.bitrate_incl.recalculate(elapsed);
        self.stats.curr_packets_per_second = self.pps.curr_packets_per_second();
        self.stats.curr_bits_per_second_excluding_overhead = self.bitrate_excl.curr_bits_per_second();
        self.stats.curr_bits_per_second_including_overhead = self.bitrate_incl.curr_bits_per_second();
        self.last_recalc = Instant::now();
    }
}

/// Bridges the FEC encoder output into the injection path.
struct InjectSink<'a> {
    path: &'a mut TxPath,
    cards: &'a [CardHandle],
    card_idx: usize,
    acct: &'a Mutex<TxAccounting>,
    radio_port: RadioPort,
}

impl FragmentSink for InjectSink<'_> {
    fn on_fragment(&mut self, nonce: u64, payload: &[u8]) {
        self.path.send_data_fragment(self.radio_port, nonce, payload, self.cards, self.card_idx, self.acct);
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct LinkEngine {
    options: Options,
    direction: Direction,
    cards: Arc<Vec<CardHandle>>,
    tx: Mutex<TxState>,
    tx_acct: Arc<Mutex<TxAccounting>>,
    rx_stats: Arc<Mutex<RxStats>>,
    rx_stats_per_card: Arc<Vec<Mutex<RxStatsPerCard>>>,
    handlers: HandlerMap,
    active_tx_card: Arc<AtomicUsize>,
    passive: Arc<AtomicBool>,
    keep_receiving: Arc<AtomicBool>,
    rx_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Consumed by start_receiving.
    rx_seed: Mutex<Option<RxWorkerSeed>>,
}

struct RxWorkerSeed {
    opener: SessionOpener,
}

impl LinkEngine {
    pub fn new(cards: Vec<Box<dyn RawCard>>, options: Options) -> Result<LinkEngine, Error> {
        if cards.is_empty() {
            return Err(Error::Config("at least one card is required".into()));
        }
        if let FecConfig::Fixed { k, percentage: _ } = &options.fec {
            if *k < 1 || *k > crate::fec::MAX_PRIMARY_FRAGMENTS {
                return Err(Error::Config(format!("fixed FEC k {} out of range", k)));
            }
        }
        let keypair = LinkKeypair::load(options.encryption_key_path.as_deref())?;
        let direction = if options.use_gnd_identifier { Direction::Ground } else { Direction::Air };

        let (encoder, fec_enabled) = match &options.fec {
            FecConfig::Disabled => (TxEncoder::Disabled(FecDisabledEncoder::new()), false),
            FecConfig::Fixed { k, percentage } => {
                (TxEncoder::Fec { encoder: FecEncoder::new(*k, *percentage), codec: None }, true)
            }
            FecConfig::Variable { codec, percentage } => (
                TxEncoder::Fec {
                    encoder: FecEncoder::new(crate::fec::MAX_PRIMARY_FRAGMENTS, *percentage),
                    codec: Some(*codec),
                },
                true,
            ),
        };
        let n_max = match &encoder {
            TxEncoder::Fec { encoder, .. } => encoder.n_max().min(255) as u8,
            TxEncoder::Disabled(_) => 0,
        };
        let sealer = SessionSealer::new(&keypair, fec_enabled, n_max);
        let cipher = PacketCipher::new(sealer.session_key());
        let opener = SessionOpener::new(&keypair);

        let card_handles: Vec<CardHandle> = cards
            .into_iter()
            .map(|c| CardHandle {
                name: c.name().to_string(),
                fd: c.raw_fd(),
                io: Mutex::new(c),
                disconnected: AtomicBool::new(false),
            })
            .collect();
        let n_cards = card_handles.len();
        info!(
            "engine up: {} card(s), direction {:?}, fec {:?}",
            n_cards, direction, options.fec
        );

        let engine = LinkEngine {
            direction,
            cards: Arc::new(card_handles),
            tx: Mutex::new(TxState {
                encoder,
                open_block: None,
                path: TxPath {
                    radiotap_params: RadiotapParams::default(),
                    radiotap_header: radiotap::build_tx_header(&RadiotapParams::default()),
                    direction,
                    ieee_seq: 0,
                    cipher,
                    sealer,
                    next_announce: None,
                },
            }),
            tx_acct: Arc::new(Mutex::new(TxAccounting::new())),
            rx_stats: Arc::new(Mutex::new(RxStats::new())),
            rx_stats_per_card: Arc::new((0..n_cards).map(|_| Mutex::new(RxStatsPerCard::default())).collect()),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            active_tx_card: Arc::new(AtomicUsize::new(0)),
            passive: Arc::new(AtomicBool::new(false)),
            keep_receiving: Arc::new(AtomicBool::new(false)),
            rx_thread: Mutex::new(None),
            rx_seed: Mutex::new(Some(RxWorkerSeed { opener })),
            options,
        };
        engine.startup_announce_burst();
        Ok(engine)
    }

    /// Minimize join latency for receivers that come up after us.
    fn startup_announce_burst(&self) {
        let mut tx = self.tx.lock().unwrap();
        let card_idx = self.active_tx_card.load(Ordering::Relaxed);
        for i in 0..STARTUP_ANNOUNCE_COUNT {
            tx.path.send_session_packet(&self.cards, card_idx, &self.tx_acct);
            if i + 1 < STARTUP_ANNOUNCE_COUNT {
                std::thread::sleep(STARTUP_ANNOUNCE_SPACING);
            }
        }
        tx.path.next_announce = Some(Instant::now() + self.options.session_key_packet_interval);
    }

    /// Feed one application packet into the link.
    /// `encrypt` trades CPU for confidentiality; integrity is always on.
    pub fn inject(&self, stream_index: u8, data: &[u8], encrypt: bool) {
        if self.passive.load(Ordering::Relaxed) {
            return;
        }
        let max_len = match &self.options.fec {
            FecConfig::Disabled => MAX_PACKET_PAYLOAD_SIZE,
            _ => MAX_FEC_PAYLOAD_SIZE,
        };
        if data.is_empty() || data.len() > max_len || stream_index > STREAM_INDEX_MAX {
            self.count_tx_error(format!(
                "rejecting packet: stream {} len {}",
                stream_index,
                data.len()
            ));
            return;
        }
        if stream_index == 0 && encrypt {
            // 0x80 is the session-key tag on the wire
            self.count_tx_error("stream 0 cannot be encrypted".into());
            return;
        }

        let mut tx = self.tx.lock().unwrap();
        let card_idx = self.active_tx_card.load(Ordering::Relaxed);
        tx.path.announce_session_key_if_needed(
            self.options.session_key_packet_interval,
            &self.cards,
            card_idx,
            &self.tx_acct,
        );

        let TxState { encoder, open_block, path } = &mut *tx;
        let radio_port = RadioPort { encrypted: encrypt, stream_index };
        match encoder {
            TxEncoder::Fec { encoder, codec } => {
                // a block never spans streams or encryption modes
                if let Some(open) = *open_block {
                    if open != (stream_index, encrypt) {
                        let mut sink = InjectSink {
                            path,
                            cards: &self.cards,
                            card_idx,
                            acct: &self.tx_acct,
                            radio_port: RadioPort { encrypted: open.1, stream_index: open.0 },
                        };
                        encoder.flush(&mut sink);
                    }
                }
                let end_of_block = match codec {
                    Some(c) => is_end_of_frame(*c, data),
                    None => false, // fixed-k closes on its own count
                };
                let mut sink =
                    InjectSink { path, cards: &self.cards, card_idx, acct: &self.tx_acct, radio_port };
                encoder.encode(data, end_of_block, &mut sink);
                *open_block = if end_of_block { None } else { Some((stream_index, encrypt)) };
                if encoder.reset_on_overflow() {
                    path.sealer.rekey();
                    path.cipher = PacketCipher::new(path.sealer.session_key());
                    path.send_session_packet(&self.cards, card_idx, &self.tx_acct);
                }
            }
            TxEncoder::Disabled(encoder) => {
                let mut sink =
                    InjectSink { path, cards: &self.cards, card_idx, acct: &self.tx_acct, radio_port };
                encoder.encode(data, &mut sink);
                if encoder.reset_on_overflow() {
                    path.sealer.rekey();
                    path.cipher = PacketCipher::new(path.sealer.session_key());
                    path.send_session_packet(&self.cards, card_idx, &self.tx_acct);
                }
            }
        }
        let mut acct = self.tx_acct.lock().unwrap();
        acct.stats.n_injected_bytes_excluding_overhead += data.len() as i64;
        acct.bitrate_excl.add_bytes(data.len());
    }

    /// Force a fresh session key and announce it (also used by tests).
    pub fn rekey(&self) {
        let mut tx = self.tx.lock().unwrap();
        let card_idx = self.active_tx_card.load(Ordering::Relaxed);
        tx.path.sealer.rekey();
        tx.path.cipher = PacketCipher::new(tx.path.sealer.session_key());
        tx.path.send_session_packet(&self.cards, card_idx, &self.tx_acct);
    }

    fn count_tx_error(&self, reason: String) {
        let mut acct = self.tx_acct.lock().unwrap();
        acct.stats.count_tx_errors += 1;
        if acct.stats.count_tx_errors % 100 == 1 {
            warn!("{}", reason);
        }
    }

    /// Register the callbacks for one multiplexed stream (0..=127).
    pub fn register_stream(
        &self,
        stream_index: u8,
        on_packet: PacketCallback,
        on_new_session: NewSessionCallback,
    ) -> Result<(), Error> {
        if stream_index > STREAM_INDEX_MAX {
            return Err(Error::Config(format!("stream index {} out of range", stream_index)));
        }
        self.handlers
            .lock()
            .unwrap()
            .insert(stream_index, StreamHandler { on_packet, on_new_session });
        Ok(())
    }

    pub fn unregister_stream(&self, stream_index: u8) {
        self.handlers.lock().unwrap().remove(&stream_index);
    }

    /// Spawn the RX thread. Receiving does not start before this.
    pub fn start_receiving(&self) {
        let Some(seed) = self.rx_seed.lock().unwrap().take() else {
            warn!("start_receiving called twice");
            return;
        };
        self.keep_receiving.store(true, Ordering::SeqCst);
        let mut worker = RxWorker {
            cards: self.cards.clone(),
            direction: self.direction,
            options: self.options.clone(),
            opener: seed.opener,
            cipher: None,
            fec_decoder: FecDecoder::new(),
            disabled_decoder: FecDisabledDecoder::new(),
            handlers: self.handlers.clone(),
            rx_stats: self.rx_stats.clone(),
            rx_stats_per_card: self.rx_stats_per_card.clone(),
            active_tx_card: self.active_tx_card.clone(),
            keep_receiving: self.keep_receiving.clone(),
            nonce_tracker: SeqGapTracker::new(),
            ieee_tracker: SeqGapTracker::new(),
            per_card_trackers: (0..self.cards.len()).map(|_| SeqGapTracker::new()).collect(),
            rssi_windows: (0..self.cards.len()).map(|_| RssiWindow::new()).collect(),
            card_errors: vec![0; self.cards.len()],
            pps: PacketsPerSecondCalculator::new(),
            bitrate: BitrateCalculator::new(),
            pollution_total: 0,
            pollution_likely: 0,
            last_tick: Instant::now(),
            auto_switch: self.options.enable_auto_switch_tx_card,
        };
        let realtime = self.options.receive_thread_realtime;
        let handle = std::thread::Builder::new()
            .name("wavelink-rx".into())
            .spawn(move || {
                if realtime {
                    set_rx_thread_realtime();
                }
                worker.run();
            })
            .expect("spawn rx thread");
        *self.rx_thread.lock().unwrap() = Some(handle);
    }

    /// Stop the RX thread and join it. Pending FEC blocks are discarded.
    pub fn stop_receiving(&self) {
        self.keep_receiving.store(false, Ordering::SeqCst);
        if let Some(handle) = self.rx_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Thread-safe; applies to the next injected packet.
    pub fn update_radiotap(&self, params: RadiotapParams) {
        let mut tx = self.tx.lock().unwrap();
        tx.path.radiotap_params = params;
        tx.path.radiotap_header = radiotap::build_tx_header(&params);
    }

    pub fn get_tx_stats(&self) -> TxStats {
        let mut acct = self.tx_acct.lock().unwrap();
        acct.maybe_recalculate();
        acct.stats
    }

    pub fn get_rx_stats(&self) -> RxStats {
        *self.rx_stats.lock().unwrap()
    }

    pub fn get_rx_stats_for_card(&self, card_idx: usize) -> RxStatsPerCard {
        let mut snapshot = self
            .rx_stats_per_card
            .get(card_idx)
            .map(|m| *m.lock().unwrap())
            .unwrap_or_default();
        if let Some(card) = self.cards.get(card_idx) {
            snapshot.is_disconnected = card.disconnected.load(Ordering::Relaxed);
        }
        snapshot
    }

    pub fn reset_stats(&self) {
        *self.rx_stats.lock().unwrap() = RxStats::new();
        for m in self.rx_stats_per_card.iter() {
            *m.lock().unwrap() = RxStatsPerCard::default();
        }
        let mut acct = self.tx_acct.lock().unwrap();
        *acct = TxAccounting::new();
    }

    pub fn get_active_tx_card(&self) -> usize {
        self.active_tx_card.load(Ordering::Relaxed)
    }

    pub fn get_card_disconnected(&self, card_idx: usize) -> bool {
        self.cards
            .get(card_idx)
            .map(|c| c.disconnected.load(Ordering::Relaxed))
            .unwrap_or(true)
    }

    /// Passive mode: listen only, never transmit (ground-station use).
    pub fn set_passive(&self, passive: bool) {
        self.passive.store(passive, Ordering::Relaxed);
    }
}

impl Drop for LinkEngine {
    fn drop(&mut self) {
        self.stop_receiving();
    }
}

fn set_rx_thread_realtime() {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let param = libc::sched_param { sched_priority: max };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            warn!("SCHED_FIFO for rx thread refused: {}", std::io::Error::last_os_error());
        }
    }
}

// ============================================================================
// RX WORKER (single thread, owns decoder + decryptor)
// ============================================================================

struct RxWorker {
    cards: Arc<Vec<CardHandle>>,
    direction: Direction,
    options: Options,
    opener: SessionOpener,
    cipher: Option<PacketCipher>,
    fec_decoder: FecDecoder,
    disabled_decoder: FecDisabledDecoder,
    handlers: HandlerMap,
    rx_stats: Arc<Mutex<RxStats>>,
    rx_stats_per_card: Arc<Vec<Mutex<RxStatsPerCard>>>,
    active_tx_card: Arc<AtomicUsize>,
    keep_receiving: Arc<AtomicBool>,
    nonce_tracker: SeqGapTracker,
    ieee_tracker: SeqGapTracker,
    per_card_trackers: Vec<SeqGapTracker>,
    rssi_windows: Vec<RssiWindow>,
    card_errors: Vec<u32>,
    pps: PacketsPerSecondCalculator,
    bitrate: BitrateCalculator,
    pollution_total: u64,
    pollution_likely: u64,
    last_tick: Instant,
    auto_switch: bool,
}

impl RxWorker {
    fn run(&mut self) {
        let mut buf = [0u8; RX_FRAME_BUF_SIZE];
        let mut pollfds: Vec<libc::pollfd> = self
            .cards
            .iter()
            .map(|c| libc::pollfd { fd: c.fd, events: libc::POLLIN, revents: 0 })
            .collect();
        info!("rx thread running over {} card(s)", self.cards.len());

        while self.keep_receiving.load(Ordering::SeqCst) {
            for pfd in pollfds.iter_mut() {
                pfd.revents = 0;
            }
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    warn!("poll failed: {}", err);
                    std::thread::sleep(Duration::from_millis(10));
                }
            } else if rc > 0 {
                for card_idx in 0..self.cards.len() {
                    if pollfds[card_idx].revents != 0 {
                        self.drain_card(card_idx, &mut buf);
                        if self.cards[card_idx].disconnected.load(Ordering::Relaxed) {
                            // poll ignores negative fds; stop spinning on HUP
                            pollfds[card_idx].fd = -1;
                        }
                    }
                }
            }
            let now = Instant::now();
            if now.duration_since(self.last_tick) >= HOUSEKEEPING_INTERVAL {
                self.housekeeping(now);
                self.last_tick = now;
            }
        }
        debug!("rx thread exiting");
    }

    fn drain_card(&mut self, card_idx: usize, buf: &mut [u8]) {
        if self.cards[card_idx].disconnected.load(Ordering::Relaxed) {
            return;
        }
        for _ in 0..RX_BATCH {
            let outcome = self.cards[card_idx].io.lock().unwrap().recv_frame(buf);
            match outcome {
                Ok(Some(n)) => {
                    self.card_errors[card_idx] = 0;
                    // frame length 0 cannot happen; parse handles runts
                    let frame = &buf[..n];
                    self.process_frame(card_idx, frame);
                }
                Ok(None) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let eof = e.kind() == std::io::ErrorKind::UnexpectedEof;
                    self.card_errors[card_idx] += 1;
                    if eof || self.card_errors[card_idx] >= CARD_ERROR_LIMIT {
                        if !self.cards[card_idx].disconnected.swap(true, Ordering::Relaxed) {
                            warn!("card {} disconnected: {}", self.cards[card_idx].name, e);
                        }
                    }
                    break;
                }
            }
        }
    }

    fn process_frame(&mut self, card_idx: usize, frame: &[u8]) {
        if self.options.log_all_received {
            debug!("card {} frame {} bytes", card_idx, frame.len());
        }
        {
            let mut rx = self.rx_stats.lock().unwrap();
            rx.count_p_any += 1;
            rx.count_bytes_any += frame.len() as i64;
        }
        self.rx_stats_per_card[card_idx].lock().unwrap().count_p_any += 1;

        let Some(rt) = radiotap::parse(frame) else { return };
        if rt.bad_fcs {
            return;
        }
        let dot11 = &frame[rt.payload_offset..];
        let Some(class) = ieee80211::classify(dot11, self.direction) else { return };
        self.pollution_total += 1;
        if class.own_echo {
            return;
        }
        if !class.likely_ours {
            return;
        }
        self.pollution_likely += 1;
        self.ieee_tracker.on_seq((class.seq_ctrl >> 4) as u64);
        // RSSI from frames attributable to the link only, so a busy
        // channel cannot steer the TX-card election
        if let Some(dbm) = self.effective_rssi(&rt) {
            self.rssi_windows[card_idx].add(dbm);
        }

        let payload = &dot11[crate::protocol::wire::IEEE80211_HEADER_SIZE..];
        if payload.is_empty() {
            return;
        }
        if payload[0] == RADIO_PORT_SESSION_KEY {
            self.on_session_frame(&payload[1..]);
            return;
        }
        self.on_data_frame(card_idx, payload, &rt);
    }

    fn effective_rssi(&self, rt: &radiotap::RxRadiotap) -> Option<i8> {
        if self.options.rtl8812au_rssi_fixup {
            // the first chain's report is bogus on this driver
            let rest: Vec<i8> = rt.rssi_per_antenna.iter().skip(1).flatten().copied().collect();
            if !rest.is_empty() {
                return rest.into_iter().max();
            }
        }
        rt.rssi_dbm
    }

    fn on_session_frame(&mut self, payload: &[u8]) {
        let Some(pkt) = SessionKeyPacket::parse(payload) else { return };
        let pkt = *pkt;
        match self.opener.on_session_packet(&pkt) {
            Ok(new_session) => {
                self.rx_stats.lock().unwrap().n_received_valid_session_key_packets += 1;
                if new_session {
                    self.cipher = Some(PacketCipher::new(
                        self.opener.session_key().expect("session key installed"),
                    ));
                    self.fec_decoder.reset();
                    self.disabled_decoder = FecDisabledDecoder::new();
                    self.nonce_tracker.reset();
                    for t in self.per_card_trackers.iter_mut() {
                        t.reset();
                    }
                    let mut handlers = self.handlers.lock().unwrap();
                    for handler in handlers.values_mut() {
                        (handler.on_new_session)();
                    }
                }
            }
            Err(_) => {
                // someone else's link on this channel, or a corrupt frame
                debug!("session announcement failed to open");
            }
        }
    }

    fn on_data_frame(&mut self, card_idx: usize, payload: &[u8], rt: &radiotap::RxRadiotap) {
        let Some(hdr) = DataHeader::parse(payload) else { return };
        let Some(cipher) = &self.cipher else { return };
        let radio_port = RadioPort::from_byte(hdr.radio_port);
        let body = &payload[DATA_HEADER_SIZE..];
        let Ok(data) = cipher.open(&hdr, body, radio_port.encrypted) else {
            if self.options.advanced_debugging_rx {
                debug!("auth failure nonce {}", hdr.nonce);
            }
            return;
        };

        {
            let mut rx = self.rx_stats.lock().unwrap();
            rx.count_p_valid += 1;
            rx.count_bytes_valid += data.len() as i64;
            if let Some(mcs) = rt.mcs_index {
                rx.last_received_packet_mcs_index = mcs as i32;
            }
            if let Some(width) = rt.channel_width_mhz {
                rx.last_received_packet_channel_width = width as i32;
            }
        }
        self.rx_stats_per_card[card_idx].lock().unwrap().count_p_valid += 1;
        self.pps.on_packet();
        self.bitrate.add_bytes(data.len());
        self.nonce_tracker.on_seq(hdr.nonce);
        self.per_card_trackers[card_idx].on_seq(hdr.nonce);

        let handlers = self.handlers.clone();
        let mut sink = DispatchSink { handlers: &handlers, card_idx };
        if self.opener.fec_enabled {
            self.fec_decoder.process_fragment(
                hdr.nonce,
                radio_port.stream_index,
                &data,
                Instant::now(),
                &mut sink,
            );
        } else {
            self.disabled_decoder.process_packet(
                hdr.nonce,
                radio_port.stream_index,
                &data,
                &mut sink,
            );
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_tick);
        self.pps.recalculate(elapsed);
        self.bitrate.recalculate(elapsed);
        self.nonce_tracker.recalculate();
        self.ieee_tracker.recalculate();
        if self.options.advanced_debugging_rx {
            debug!(
                "802.11 seq loss over likely-link frames: {}%",
                self.ieee_tracker.curr_loss_perc()
            );
        }

        {
            let mut rx = self.rx_stats.lock().unwrap();
            rx.curr_packets_per_second = self.pps.curr_packets_per_second();
            rx.curr_bits_per_second = self.bitrate.curr_bits_per_second();
            rx.curr_packet_loss_perc = self.nonce_tracker.curr_loss_perc();
            rx.curr_big_gaps_counter = self.nonce_tracker.curr_big_gaps();
            rx.curr_n_likely_link_packets = self.pollution_likely.min(i32::MAX as u64) as i32;
            rx.curr_link_pollution_perc = if self.pollution_total > 0 {
                ((self.pollution_total - self.pollution_likely) * 100 / self.pollution_total) as i32
            } else {
                0
            };
        }
        self.pollution_total = 0;
        self.pollution_likely = 0;

        for (card_idx, window) in self.rssi_windows.iter_mut().enumerate() {
            window.recalculate();
            self.per_card_trackers[card_idx].recalculate();
            let mut per_card = self.rx_stats_per_card[card_idx].lock().unwrap();
            per_card.curr_packet_loss_perc = self.per_card_trackers[card_idx].curr_loss_perc();
            if let Some(avg) = window.last_avg() {
                per_card.rssi_avg_dbm = avg;
                per_card.rssi_min_dbm = window.last_min();
                per_card.rssi_max_dbm = window.last_max();
                // crude mapping of dBm [-90, -30] onto [0, 100]
                per_card.signal_quality = ((avg + 90) * 100 / 60).clamp(0, 100);
            }
            per_card.is_disconnected = self.cards[card_idx].disconnected.load(Ordering::Relaxed);
        }

        self.elect_tx_card();

        let handlers = self.handlers.clone();
        let mut sink = DispatchSink { handlers: &handlers, card_idx: 0 };
        self.fec_decoder.poll(now, &mut sink);
    }

    /// Pick the card with the best last-window average RSSI; switch only
    /// past a margin so two similar cards do not flap.
    fn elect_tx_card(&mut self) {
        if !self.auto_switch || self.cards.len() < 2 {
            return;
        }
        let current = self.active_tx_card.load(Ordering::Relaxed);
        let current_avg = self
            .rssi_windows
            .get(current)
            .and_then(|w| w.last_avg())
            .filter(|_| !self.cards[current].disconnected.load(Ordering::Relaxed));
        let mut best: Option<(usize, i32)> = None;
        for (idx, window) in self.rssi_windows.iter().enumerate() {
            if self.cards[idx].disconnected.load(Ordering::Relaxed) {
                continue;
            }
            if let Some(avg) = window.last_avg() {
                if best.map_or(true, |(_, b)| avg > b) {
                    best = Some((idx, avg));
                }
            }
        }
        let Some((best_idx, best_avg)) = best else { return };
        if best_idx == current {
            return;
        }
        let switch = match current_avg {
            Some(cur) => best_avg > cur + TX_CARD_RSSI_MARGIN,
            None => true, // active card silent or gone
        };
        if switch {
            info!(
                "switching tx card {} -> {} (rssi {} vs {:?})",
                current, best_idx, best_avg, current_avg
            );
            self.active_tx_card.store(best_idx, Ordering::Relaxed);
        }
    }
}

/// Routes decoder output to the registered stream callback.
struct DispatchSink<'a> {
    handlers: &'a HandlerMap,
    card_idx: usize,
}

impl PayloadSink for DispatchSink<'_> {
    fn on_payload(&mut self, nonce: u64, stream_index: u8, payload: &[u8]) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(handler) = handlers.get_mut(&stream_index) {
            (handler.on_packet)(nonce, self.card_idx, payload);
        }
    }
}
