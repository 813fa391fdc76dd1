//! 24-byte frame header: packed little-endian, CRC-16/CCITT-FALSE over the
//! whole declared frame with the CRC slot zeroed.

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::{crc16, INITIAL};
use crate::error::{Error, Result};

/// Wire magic constant identifying a valid frame.
pub const MAGIC: u16 = 0xBBBB;

/// Size in bytes of the header alone.
pub const HEADER_LEN: usize = 24;

/// The 24-byte frame header. See module docs for layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: u16,
    pub timestamp: u64,
    pub seqno: u32,
    pub length: u16,
    pub response: u32,
    pub crc: u16,
}

impl Header {
    pub fn new(kind: u16, timestamp: u64, seqno: u32, length: u16, response: u32) -> Self {
        Self {
            kind,
            timestamp,
            seqno,
            length,
            response,
            crc: 0,
        }
    }

    /// Pack this header alone, little-endian, with the CRC slot zeroed
    /// (bytes 22-23). Used as the first 24 bytes of a full frame before
    /// the CRC over the whole frame is known.
    fn pack_zeroed(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u16(&mut buf[0..2], MAGIC);
        LittleEndian::write_u16(&mut buf[2..4], self.kind);
        LittleEndian::write_u64(&mut buf[4..12], self.timestamp);
        LittleEndian::write_u32(&mut buf[12..16], self.seqno);
        LittleEndian::write_u16(&mut buf[16..18], self.length);
        LittleEndian::write_u32(&mut buf[18..22], self.response);
        // bytes 22..24 left zero (crc slot)
        buf
    }

    /// Serialize the full frame (header + `payload`), computing and
    /// splicing in the CRC. `self.length` must already equal
    /// `HEADER_LEN + payload.len()`.
    pub fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.length as usize);
        frame.extend_from_slice(&self.pack_zeroed());
        frame.extend_from_slice(payload);

        let crc = crc16(&frame, INITIAL);
        LittleEndian::write_u16(&mut frame[22..24], crc);
        frame
    }

    /// Read the declared frame length without checking the CRC. Used
    /// while assembling a partial frame, where only a header-sized
    /// prefix is available.
    pub fn peek_length(buf: &[u8]) -> Result<u16> {
        if buf.len() < HEADER_LEN {
            return Err(Error::FrameTooShort);
        }
        if LittleEndian::read_u16(&buf[0..2]) != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let length = LittleEndian::read_u16(&buf[16..18]);
        if (length as usize) < HEADER_LEN {
            return Err(Error::FrameTooShort);
        }
        Ok(length)
    }

    /// Parse a complete frame (header + payload), verifying magic and
    /// CRC. `buf` must be exactly `length` bytes (the declared frame
    /// size); trailing bytes are not tolerated here — callers trim to
    /// `length` first.
    pub fn decode_frame(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < HEADER_LEN {
            return Err(Error::FrameTooShort);
        }
        if LittleEndian::read_u16(&buf[0..2]) != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let kind = LittleEndian::read_u16(&buf[2..4]);
        let timestamp = LittleEndian::read_u64(&buf[4..12]);
        let seqno = LittleEndian::read_u32(&buf[12..16]);
        let length = LittleEndian::read_u16(&buf[16..18]);
        let response = LittleEndian::read_u32(&buf[18..22]);
        let crc_received = LittleEndian::read_u16(&buf[22..24]);

        let mut scratch = buf[..length as usize].to_vec();
        LittleEndian::write_u16(&mut scratch[22..24], 0);
        let crc_computed = crc16(&scratch, INITIAL);

        if crc_received != crc_computed {
            return Err(Error::CrcMismatch(crc_received, crc_computed));
        }

        let header = Header {
            kind,
            timestamp,
            seqno,
            length,
            response,
            crc: crc_received,
        };
        Ok((header, &buf[HEADER_LEN..length as usize]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_with_crc_scenario() {
        let header = Header::new(0x2A, 0, 0, HEADER_LEN as u16, 0);
        let frame = header.encode_frame(&[]);
        assert_eq!(
            hex::encode(&frame),
            "bbbb2a000000000000000000000000001800000000006444"
        );

        let (decoded, payload) = Header::decode_frame(&frame).unwrap();
        assert_eq!(decoded.crc, 0x4464);
        assert!(payload.is_empty());
    }

    #[test]
    fn round_trip_any_fields() {
        for (kind, timestamp, seqno, response, payload_len) in [
            (0x01u16, 0u64, 1u32, 0u32, 0usize),
            (0x44, 0x9abc, 42, 7, 12),
            (0xffff, u64::MAX, u32::MAX, u32::MAX, 5),
        ] {
            let length = (HEADER_LEN + payload_len) as u16;
            let header = Header::new(kind, timestamp, seqno, length, response);
            let payload = vec![0xAB; payload_len];
            let frame = header.encode_frame(&payload);

            let (decoded, decoded_payload) = Header::decode_frame(&frame).unwrap();
            assert_eq!(decoded.kind, kind);
            assert_eq!(decoded.timestamp, timestamp);
            assert_eq!(decoded.seqno, seqno);
            assert_eq!(decoded.length, length);
            assert_eq!(decoded.response, response);
            assert_eq!(decoded_payload, payload.as_slice());
        }
    }

    #[test]
    fn invalid_magic_detected() {
        let header = Header::new(0x01, 0, 1, HEADER_LEN as u16, 0);
        let mut frame = header.encode_frame(&[]);
        frame[0] = 0x00;
        assert!(matches!(
            Header::decode_frame(&frame),
            Err(Error::InvalidMagic)
        ));
    }

    #[test]
    fn crc_mismatch_detected() {
        let header = Header::new(0x01, 0, 1, HEADER_LEN as u16, 0);
        let mut frame = header.encode_frame(&[]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            Header::decode_frame(&frame),
            Err(Error::CrcMismatch(_, _))
        ));
    }

    #[test]
    fn peek_length_bypasses_crc() {
        let header = Header::new(0x01, 0, 1, HEADER_LEN as u16 + 3, 0);
        let mut frame = header.encode_frame(&[1, 2, 3]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF; // corrupt the CRC
        assert_eq!(Header::peek_length(&frame).unwrap(), HEADER_LEN as u16 + 3);
    }
}
