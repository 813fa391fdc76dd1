//! Packet registry: a closed tagged union of payload kinds, keyed by the
//! header's `kind` field. Unregistered kinds decode to [`Packet::Unknown`]
//! instead of being dropped, so the parser never silently discards data.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Wire `kind` tags, as observed on the device.
pub mod kind {
    pub const ACK: u16 = 0x00;
    pub const SESSION_START: u16 = 0x01;
    pub const SESSION_START_RESP: u16 = 0x02;
    pub const CONFIG_GET: u16 = 0x03;
    pub const DEVICE_RESET: u16 = 0x0B;
    pub const SEND_STORED_DATA: u16 = 0x10;
    /// Not present in the vendor's own packet table; assigned immediately
    /// after `SEND_STORED_DATA` by analogy with the SESSION_START /
    /// SESSION_START_RESP and IS_DEVICE_PAIRED / IS_DEVICE_PAIRED_RESP
    /// pairs, since no device log sample pinned down its value.
    pub const DATA_RESP: u16 = 0x11;
    /// Not present in the corpus at all: the original drives acquisition
    /// purely through `SEND_STORED_DATA`/`LOG_GET` and never stops a
    /// stream over the wire. Assigned so `request_acquisition_stop` can
    /// keep the same seqno/ACK contract as every other command method.
    pub const ACQUISITION_STOP: u16 = 0x12;
    pub const TECHNICAL_STATUS: u16 = 0x15;
    pub const LEDS_CONTROL: u16 = 0x23;
    pub const IS_DEVICE_PAIRED: u16 = 0x2A;
    pub const IS_DEVICE_PAIRED_RESP: u16 = 0x2B;
    pub const LOG_GET: u16 = 0x44;
    /// Likewise unpinned; assigned immediately after `LOG_GET`.
    pub const LOG_FILE_RESP: u16 = 0x45;
}

/// ISO-8859-1 (Latin-1) is a direct byte<->codepoint mapping, so encode
/// and decode are just `as u8`/`as char` casts.
fn latin1_decode(buf: &[u8]) -> String {
    buf.iter().map(|&b| b as char).collect()
}

fn latin1_encode(s: &str) -> Vec<u8> {
    s.chars().map(|c| c as u8).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub orig_kind: u16,
    pub status: u8,
    pub unknown: u16,
}

impl Ack {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 5];
        BigEndian::write_u16(&mut buf[0..2], self.orig_kind);
        buf[2] = self.status;
        BigEndian::write_u16(&mut buf[3..5], self.unknown);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 5 {
            return Err(Error::PayloadTooShort(kind::ACK));
        }
        Ok(Self {
            orig_kind: BigEndian::read_u16(&buf[0..2]),
            status: buf[2],
            unknown: BigEndian::read_u16(&buf[3..5]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    pub host_id: u32,
    pub mode: u8,
    pub version: String,
}

impl SessionStart {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 5];
        BigEndian::write_u32(&mut buf[0..4], self.host_id);
        buf[4] = self.mode;
        buf.extend(latin1_encode(&self.version));
        buf.push(0); // NUL terminator
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(Error::PayloadTooShort(kind::SESSION_START));
        }
        let host_id = BigEndian::read_u32(&buf[0..4]);
        let mode = buf[4];
        let version = latin1_decode(&buf[5..buf.len() - 1]);
        Ok(Self {
            host_id,
            mode,
            version,
        })
    }
}

/// Opaque 512-byte blob. Not interpreted; its presence alone signals a
/// successful session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStartResp {
    pub config: Vec<u8>,
}

impl SessionStartResp {
    fn encode(&self) -> Vec<u8> {
        self.config.clone()
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            config: buf.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceReset {
    pub reason: u8,
}

impl DeviceReset {
    fn encode(&self) -> Vec<u8> {
        vec![self.reason]
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::PayloadTooShort(kind::DEVICE_RESET));
        }
        Ok(Self { reason: buf[0] })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedsControl {
    pub value: u8,
}

impl LedsControl {
    fn encode(&self) -> Vec<u8> {
        vec![self.value]
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::PayloadTooShort(kind::LEDS_CONTROL));
        }
        Ok(Self { value: buf[0] })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsDevicePairedResp {
    pub value: u16,
}

impl IsDevicePairedResp {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 5];
        BigEndian::write_u16(&mut buf[0..2], kind::IS_DEVICE_PAIRED);
        BigEndian::write_u16(&mut buf[2..4], self.value);
        buf[4] = 0;
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::PayloadTooShort(kind::IS_DEVICE_PAIRED_RESP));
        }
        Ok(Self {
            value: BigEndian::read_u16(&buf[2..4]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGet {
    pub offset: u32,
    pub length: u32,
}

impl LogGet {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        BigEndian::write_u32(&mut buf[0..4], self.offset);
        BigEndian::write_u32(&mut buf[4..8], self.length);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::PayloadTooShort(kind::LOG_GET));
        }
        Ok(Self {
            offset: BigEndian::read_u32(&buf[0..4]),
            length: BigEndian::read_u32(&buf[4..8]),
        })
    }
}

/// Streamed chunk payload, shared shape for `LOG_FILE_RESP` and
/// `DATA_RESP` — both are variable-length opaque buffers delivered
/// across a run of responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
}

impl Chunk {
    fn encode(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self { data: buf.to_vec() })
    }
}

/// The closed set of known packet payloads, plus a catch-all for kinds
/// with no registered codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ack(Ack),
    SessionStart(SessionStart),
    SessionStartResp(SessionStartResp),
    ConfigGet,
    DeviceReset(DeviceReset),
    SendStoredData,
    AcquisitionStop,
    TechnicalStatus,
    LedsControl(LedsControl),
    IsDevicePaired,
    IsDevicePairedResp(IsDevicePairedResp),
    LogGet(LogGet),
    LogFileResp(Chunk),
    DataResp(Chunk),
    /// A kind with no registered codec. Carries the raw payload bytes so
    /// the caller can still inspect them.
    Unknown(u16, Vec<u8>),
}

impl Packet {
    pub fn kind(&self) -> u16 {
        match self {
            Packet::Ack(_) => kind::ACK,
            Packet::SessionStart(_) => kind::SESSION_START,
            Packet::SessionStartResp(_) => kind::SESSION_START_RESP,
            Packet::ConfigGet => kind::CONFIG_GET,
            Packet::DeviceReset(_) => kind::DEVICE_RESET,
            Packet::SendStoredData => kind::SEND_STORED_DATA,
            Packet::AcquisitionStop => kind::ACQUISITION_STOP,
            Packet::TechnicalStatus => kind::TECHNICAL_STATUS,
            Packet::LedsControl(_) => kind::LEDS_CONTROL,
            Packet::IsDevicePaired => kind::IS_DEVICE_PAIRED,
            Packet::IsDevicePairedResp(_) => kind::IS_DEVICE_PAIRED_RESP,
            Packet::LogGet(_) => kind::LOG_GET,
            Packet::LogFileResp(_) => kind::LOG_FILE_RESP,
            Packet::DataResp(_) => kind::DATA_RESP,
            Packet::Unknown(k, _) => *k,
        }
    }

    /// Serialize the payload (big-endian fields, per the wire format).
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Packet::Ack(p) => p.encode(),
            Packet::SessionStart(p) => p.encode(),
            Packet::SessionStartResp(p) => p.encode(),
            Packet::ConfigGet => vec![],
            Packet::DeviceReset(p) => p.encode(),
            Packet::SendStoredData => vec![],
            Packet::AcquisitionStop => vec![],
            Packet::TechnicalStatus => vec![],
            Packet::LedsControl(p) => p.encode(),
            Packet::IsDevicePaired => vec![],
            Packet::IsDevicePairedResp(p) => p.encode(),
            Packet::LogGet(p) => p.encode(),
            Packet::LogFileResp(p) => p.encode(),
            Packet::DataResp(p) => p.encode(),
            Packet::Unknown(_, raw) => raw.clone(),
        }
    }

    /// Decode a payload given the header's `kind`. Unregistered kinds
    /// become [`Packet::Unknown`] rather than an error — the caller
    /// logs and moves on (see [`crate::psm`]).
    pub fn decode(kind: u16, buf: &[u8]) -> Result<Self> {
        Ok(match kind {
            kind::ACK => Packet::Ack(Ack::decode(buf)?),
            kind::SESSION_START => Packet::SessionStart(SessionStart::decode(buf)?),
            kind::SESSION_START_RESP => Packet::SessionStartResp(SessionStartResp::decode(buf)?),
            kind::CONFIG_GET => Packet::ConfigGet,
            kind::DEVICE_RESET => Packet::DeviceReset(DeviceReset::decode(buf)?),
            kind::SEND_STORED_DATA => Packet::SendStoredData,
            kind::ACQUISITION_STOP => Packet::AcquisitionStop,
            kind::TECHNICAL_STATUS => Packet::TechnicalStatus,
            kind::LEDS_CONTROL => Packet::LedsControl(LedsControl::decode(buf)?),
            kind::IS_DEVICE_PAIRED => Packet::IsDevicePaired,
            kind::IS_DEVICE_PAIRED_RESP => {
                Packet::IsDevicePairedResp(IsDevicePairedResp::decode(buf)?)
            }
            kind::LOG_GET => Packet::LogGet(LogGet::decode(buf)?),
            kind::LOG_FILE_RESP => Packet::LogFileResp(Chunk::decode(buf)?),
            kind::DATA_RESP => Packet::DataResp(Chunk::decode(buf)?),
            other => Packet::Unknown(other, buf.to_vec()),
        })
    }
}
