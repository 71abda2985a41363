//! PGM (RFC 3208) source transport.
//!
//! A Pragmatic General Multicast *source* is the sending side of a
//! receiver-reliable multicast session: it numbers and emits original data
//! (ODATA), keeps a sliding transmit window of sent packets, advertises
//! the window extremities with Source Path Messages (SPMs), confirms and
//! services negative acknowledgments (NAK → NCF → RDATA), and can answer
//! repair requests with Reed–Solomon parity packets covering whole
//! transmission groups.
//!
//! This crate is the send-side protocol engine only. Socket setup, IP
//! framing, and the receive polling loop are collaborators behind the
//! [`transport::Transmitter`] trait and the [`Source::handle_control`]
//! entry point.
//!
//! # Example
//!
//! ```rust
//! use pgm_source::packet::{Gsi, Tsi};
//! use pgm_source::transport::MemoryTransmitter;
//! use pgm_source::{SendFlags, SourceBuilder};
//!
//! let tsi = Tsi { gsi: Gsi([1, 2, 3, 4, 5, 6]), sport: 4000 };
//! let mut builder = SourceBuilder::new(
//!     tsi,
//!     7500,
//!     "239.255.0.1".parse().unwrap(),
//!     "10.0.0.1".parse().unwrap(),
//! );
//! builder.txw_sqns(128).unwrap();
//! let source = builder.bind(MemoryTransmitter::new()).unwrap();
//!
//! let sent = source.send(b"hello", SendFlags::NONE).unwrap();
//! assert_eq!(sent, 5);
//! source.close();
//! ```

use std::fmt;

pub mod checksum;
pub mod fec;
pub mod packet;
pub mod rate;
pub mod source;
pub mod sqn;
pub mod stats;
pub mod transport;
pub mod window;

pub use source::{SendFlags, Source, SourceBuilder, TsduBuffer};
pub use sqn::Sqn;
pub use stats::StatsSnapshot;

/// Error type for source-transport operations.
///
/// The classic API mapped these onto `errno`: `Invalid` → EINVAL,
/// `Closed` → ECONNRESET, `Oversize` → EMSGSIZE, `RateLimited` and
/// `WouldBlock` → EAGAIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgmError {
    /// Argument or state precondition violated.
    Invalid,
    /// Configuration change attempted after bind.
    AlreadyBound,
    /// Transport has been closed.
    Closed,
    /// APDU exceeds the window capacity.
    Oversize,
    /// Rejected by the rate controller; retry later.
    RateLimited,
    /// The write primitive would block; retry resumes mid-APDU.
    WouldBlock,
    /// Inbound packet failed verification.
    Malformed,
    /// Requested sequence has left the transmit window.
    OutOfWindow,
}

impl fmt::Display for PgmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgmError::Invalid => write!(f, "invalid argument or state"),
            PgmError::AlreadyBound => write!(f, "transport is already bound"),
            PgmError::Closed => write!(f, "transport is closed"),
            PgmError::Oversize => write!(f, "APDU exceeds window capacity"),
            PgmError::RateLimited => write!(f, "rejected by rate controller"),
            PgmError::WouldBlock => write!(f, "send would block"),
            PgmError::Malformed => write!(f, "malformed packet"),
            PgmError::OutOfWindow => write!(f, "sequence outside transmit window"),
        }
    }
}

impl std::error::Error for PgmError {}
