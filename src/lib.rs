//! CRC-framed packet codec and protocol state machine for a BLE
//! sleep-study band.
//!
//! [`header`] and [`packet`] define the wire format: a 24-byte
//! little-endian header wrapping a big-endian payload, checksummed with
//! CRC-16/CCITT-FALSE ([`crc`]). [`psm`] reassembles that format out of
//! noisy, BLE-MTU-sized chunks; [`fragment`] does the reverse for
//! outbound frames. [`protocol`] drives the session lifecycle and
//! request/response correlation on top of those pieces, against
//! whatever [`transport::Transport`] the caller supplies.

pub mod config;
pub mod crc;
pub mod error;
pub mod fragment;
pub mod header;
pub mod packet;
pub mod protocol;
pub mod psm;
pub mod transport;

pub use config::ProtocolConfig;
pub use error::{Error, Result};
pub use header::Header;
pub use packet::Packet;
pub use protocol::{ConnectionState, ProtocolMachine, SessionState};
pub use transport::Transport;
