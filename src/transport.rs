//! The BLE/transport layer is external to this crate. This module defines
//! only the interface the protocol machine drives, plus the Nordic UART
//! Service UUIDs the reference device happens to expose (informational —
//! nothing here hard-depends on them).

/// Host→device write, device→host notify, and service UUIDs for the
/// Nordic UART Service. Observed on the reference device; not enforced
/// by this crate.
pub mod nordic_uart {
    pub const SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
    pub const WRITE_CHARACTERISTIC: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
    pub const NOTIFY_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
}

/// What the protocol machine requires of a BLE transport. All methods
/// are non-blocking; results arrive later through the protocol machine's
/// own `on_*` entry points (see [`crate::protocol::ProtocolMachine`]),
/// which the transport calls back into.
///
/// At most one [`Transport::write_chunk`] call may be outstanding at a
/// time — the protocol machine will not issue another until the prior
/// one's completion is reported.
pub trait Transport {
    fn connect(&mut self);
    fn disconnect(&mut self);
    /// Write a single chunk, at most [`crate::fragment::MTU`] bytes.
    fn write_chunk(&mut self, chunk: &[u8]);
}
