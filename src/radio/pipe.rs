// WAVELINK — PIPE CARD
// Loopback card over a SOCK_SEQPACKET socketpair: what one end injects,
// the other end sniffs. The TX radiotap header is replaced with a
// synthesized RX one carrying a configurable RSSI, the same shape a
// monitor-mode driver would report. A drop filter lets tests lose
// selected frames in transit. Message boundaries are preserved and a
// closed peer reads as EOF, so disconnect handling is exercised too.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::{Arc, Mutex};

use crate::radio::RawCard;

pub type DropFilter = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;
pub type TamperFilter = Box<dyn Fn(&mut Vec<u8>) + Send + Sync>;

/// Shared per-direction channel state (set on the receiving end).
struct Shared {
    rx_rssi_dbm: AtomicI8,
    drop_filter: Mutex<Option<DropFilter>>,
    tamper_filter: Mutex<Option<TamperFilter>>,
}

pub struct PipeCard {
    name: String,
    fd: RawFd,
    shared: Arc<Shared>,
    /// Filter applied to frames this card injects (owned by the peer).
    peer_shared: Arc<Shared>,
    scratch: Vec<u8>,
}

impl PipeCard {
    /// A connected pair of cards; frames injected on one are sniffed on
    /// the other.
    pub fn pair(name_a: &str, name_b: &str) -> io::Result<(PipeCard, PipeCard)> {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let shared_a = Arc::new(Shared {
            rx_rssi_dbm: AtomicI8::new(-60),
            drop_filter: Mutex::new(None),
            tamper_filter: Mutex::new(None),
        });
        let shared_b = Arc::new(Shared {
            rx_rssi_dbm: AtomicI8::new(-60),
            drop_filter: Mutex::new(None),
            tamper_filter: Mutex::new(None),
        });
        let a = PipeCard {
            name: name_a.to_string(),
            fd: fds[0],
            shared: shared_a.clone(),
            peer_shared: shared_b.clone(),
            scratch: vec![0u8; 4096],
        };
        let b = PipeCard {
            name: name_b.to_string(),
            fd: fds[1],
            shared: shared_b,
            peer_shared: shared_a,
            scratch: vec![0u8; 4096],
        };
        Ok((a, b))
    }

    /// RSSI the synthesized radiotap header reports for frames arriving
    /// at this card.
    pub fn set_rx_rssi(&self, dbm: i8) {
        self.shared.rx_rssi_dbm.store(dbm, Ordering::Relaxed);
    }

    /// Handle for adjusting this card after it moved into the engine.
    pub fn control(&self) -> PipeCardControl {
        PipeCardControl { shared: self.shared.clone(), peer_shared: self.peer_shared.clone() }
    }

    /// Synthesized monitor-mode radiotap header:
    /// version(1) pad(1) len(2) present(4) flags(1) antsignal(1) mcs(3).
    fn rx_radiotap(&self) -> [u8; 13] {
        let mut hdr = [0u8; 13];
        hdr[2..4].copy_from_slice(&13u16.to_le_bytes());
        let present: u32 = (1 << 1) | (1 << 5) | (1 << 19); // FLAGS | ANTSIGNAL | MCS
        hdr[4..8].copy_from_slice(&present.to_le_bytes());
        hdr[8] = 0; // flags: good FCS
        hdr[9] = self.shared.rx_rssi_dbm.load(Ordering::Relaxed) as u8;
        hdr[10] = 0x02; // mcs known: index
        hdr[11] = 0;
        hdr[12] = 1;
        hdr
    }
}

impl RawCard for PipeCard {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = unsafe {
            libc::recv(self.fd, self.scratch.as_mut_ptr() as *mut libc::c_void, self.scratch.len(), 0)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock { Ok(None) } else { Err(err) };
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
        }
        let frame = &self.scratch[..n as usize];
        // swap the sender's TX radiotap header for a synthesized RX one
        if frame.len() < 4 {
            return Ok(None);
        }
        let tx_rt_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        if tx_rt_len > frame.len() {
            return Ok(None);
        }
        let rx_rt = self.rx_radiotap();
        let out_len = rx_rt.len() + frame.len() - tx_rt_len;
        if out_len > buf.len() {
            return Ok(None);
        }
        buf[..rx_rt.len()].copy_from_slice(&rx_rt);
        buf[rx_rt.len()..out_len].copy_from_slice(&frame[tx_rt_len..]);
        Ok(Some(out_len))
    }

    fn inject_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if let Some(filter) = self.peer_shared.drop_filter.lock().unwrap().as_ref() {
            if filter(frame) {
                return Ok(()); // dropped in transit
            }
        }
        let tampered: Option<Vec<u8>> = self
            .peer_shared
            .tamper_filter
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| {
                let mut v = frame.to_vec();
                t(&mut v);
                v
            });
        let frame: &[u8] = tampered.as_deref().unwrap_or(frame);
        let n = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // a full pipe is lost airtime, not an injection failure
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for PipeCard {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Test-side control surface that outlives the card handed to the engine.
pub struct PipeCardControl {
    shared: Arc<Shared>,
    peer_shared: Arc<Shared>,
}

impl PipeCardControl {
    /// RSSI reported for frames arriving at the controlled card.
    pub fn set_rx_rssi(&self, dbm: i8) {
        self.shared.rx_rssi_dbm.store(dbm, Ordering::Relaxed);
    }

    /// Drop filter applied to frames the controlled card injects.
    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        *self.peer_shared.drop_filter.lock().unwrap() = filter;
    }

    /// In-transit corruption applied to frames the controlled card injects.
    pub fn set_tamper_filter(&self, filter: Option<TamperFilter>) {
        *self.peer_shared.tamper_filter.lock().unwrap() = filter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::radiotap;

    fn tx_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame =
            radiotap::build_tx_header(&crate::protocol::radiotap::RadiotapParams::default()).to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn inject_appears_on_peer_with_rx_radiotap() {
        let (mut a, mut b) = PipeCard::pair("a", "b").unwrap();
        b.set_rx_rssi(-42);
        a.inject_frame(&tx_frame(b"hello")).unwrap();
        let mut buf = [0u8; 2048];
        let n = b.recv_frame(&mut buf).unwrap().unwrap();
        let parsed = radiotap::parse(&buf[..n]).unwrap();
        assert_eq!(parsed.rssi_dbm, Some(-42));
        assert!(!parsed.bad_fcs);
        assert_eq!(&buf[parsed.payload_offset..n], b"hello");
    }

    #[test]
    fn drained_card_returns_none() {
        let (_a, mut b) = PipeCard::pair("a", "b").unwrap();
        let mut buf = [0u8; 2048];
        assert!(matches!(b.recv_frame(&mut buf), Ok(None)));
    }

    #[test]
    fn closed_peer_is_eof() {
        let (a, mut b) = PipeCard::pair("a", "b").unwrap();
        drop(a);
        let mut buf = [0u8; 2048];
        let err = b.recv_frame(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn drop_filter_loses_frames() {
        let (mut a, mut b) = PipeCard::pair("a", "b").unwrap();
        let ctl = a.control();
        ctl.set_drop_filter(Some(Box::new(|frame: &[u8]| frame.last() == Some(&0xFF))));
        a.inject_frame(&tx_frame(&[1, 2, 0xFF])).unwrap();
        a.inject_frame(&tx_frame(&[1, 2, 3])).unwrap();
        let mut buf = [0u8; 2048];
        let n = b.recv_frame(&mut buf).unwrap().unwrap();
        assert_eq!(buf[n - 1], 3);
        assert!(matches!(b.recv_frame(&mut buf), Ok(None)));
    }
}
