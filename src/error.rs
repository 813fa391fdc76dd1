use thiserror::Error;

/// A protocol `Result`, conveniently wrapping [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
/// Error types which can occur while decoding frames or driving the
/// protocol machine.
pub enum Error {
    #[error("invalid magic in frame header")]
    InvalidMagic,

    #[error("frame CRC mismatch: expected {0:#06X}, computed {1:#06X}")]
    CrcMismatch(u16, u16),

    #[error("transport write failed for seqno {0}")]
    WriteFailed(u32),

    #[error("response arrived for unknown seqno {0}")]
    ProtocolSequenceError(u32),

    #[error("session negotiation failed in state {0:?}")]
    SessionFailed(crate::protocol::SessionState),

    #[error("frame shorter than minimum header length")]
    FrameTooShort,

    #[error("payload too short for kind {0:#06X}")]
    PayloadTooShort(u16),
}
