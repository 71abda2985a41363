//! Egress abstraction.
//!
//! Socket creation, interface selection, and IP framing live outside this
//! crate; the protocol engine only needs a primitive that puts one TPDU on
//! the wire toward the multicast group. Implement [`Transmitter`] over a
//! connected UDP socket, a raw socket, or an in-memory channel for tests.
//!
//! A `WouldBlock` error from the primitive is the EAGAIN-equivalent that
//! arms the sender's mid-APDU resume state.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Trait for sending one PGM TPDU toward the multicast group.
///
/// `router_alert` distinguishes packets that travel with the IP
/// router-alert option (SPM, NCF, repairs) from plain data; transports
/// without a router-alert capable socket may ignore it.
pub trait Transmitter {
    /// Send a complete TPDU. Datagram semantics: the whole buffer goes out
    /// or the call fails.
    fn send_to_group(&self, tpdu: &[u8], router_alert: bool) -> io::Result<usize>;
}

/// Connected UDP socket implementation.
///
/// The socket must be connected to the group address before use; the
/// router-alert flag is ignored, which is the normal situation for
/// UDP-encapsulated PGM.
impl Transmitter for std::net::UdpSocket {
    fn send_to_group(&self, tpdu: &[u8], _router_alert: bool) -> io::Result<usize> {
        self.send(tpdu)
    }
}

impl<T: Transmitter> Transmitter for &T {
    fn send_to_group(&self, tpdu: &[u8], router_alert: bool) -> io::Result<usize> {
        (*self).send_to_group(tpdu, router_alert)
    }
}

impl<T: Transmitter> Transmitter for std::sync::Arc<T> {
    fn send_to_group(&self, tpdu: &[u8], router_alert: bool) -> io::Result<usize> {
        (**self).send_to_group(tpdu, router_alert)
    }
}

/// In-memory transmitter that records every TPDU, for testing.
///
/// Can be switched into a blocked state where sends fail with
/// `WouldBlock`, to exercise the resume path.
#[derive(Debug, Default)]
pub struct MemoryTransmitter {
    sent: Mutex<VecDeque<(Vec<u8>, bool)>>,
    blocked: AtomicBool,
}

impl MemoryTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with `WouldBlock` (or succeed again).
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Number of TPDUs recorded.
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    /// Remove and return the oldest recorded TPDU.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.sent.lock().pop_front().map(|(tpdu, _)| tpdu)
    }

    /// Snapshot all recorded TPDUs, oldest first.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.sent.lock().drain(..).map(|(tpdu, _)| tpdu).collect()
    }

    /// Snapshot all recorded TPDUs with their router-alert flags.
    pub fn drain_with_alert(&self) -> Vec<(Vec<u8>, bool)> {
        self.sent.lock().drain(..).collect()
    }
}

impl Transmitter for MemoryTransmitter {
    fn send_to_group(&self, tpdu: &[u8], router_alert: bool) -> io::Result<usize> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        self.sent.lock().push_back((tpdu.to_vec(), router_alert));
        Ok(tpdu.len())
    }
}
