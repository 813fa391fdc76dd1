//! Inbound parser ("packet state machine"): reassembles frames from a
//! stream of ≤20-byte BLE MTU chunks, tolerating noise and misaligned
//! buffers.
//!
//! Frames are assumed not to be concatenated within a single MTU chunk;
//! any bytes trailing a frame in its final chunk are discarded. This
//! matches observed device behavior. If a future firmware packs multiple
//! frames into one chunk, this parser needs a byte-wise resync instead of
//! the buffer-wise one implemented here.

use std::collections::VecDeque;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::header::{Header, HEADER_LEN};
use crate::packet::Packet;

/// A fully reassembled, CRC-verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub packet: Packet,
    /// The complete frame as it appeared on the wire, header included.
    /// The protocol machine needs this for `DATA_RESP` delivery.
    pub raw: Vec<u8>,
}

/// Events the parser can emit for one pushed chunk. Several may come out
/// of a single [`Psm::push_chunk`] call if more than one frame (or error)
/// was resolved by the new data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Frame(Frame),
    /// A complete frame was found but its CRC did not verify. The frame
    /// is still consumed (dropped) so parsing can resume.
    CrcMismatch { kind: u16, expected: u16, computed: u16 },
    /// A complete frame was found for a kind with no registered codec,
    /// or whose payload didn't match its kind's expected shape.
    MalformedPayload(u16),
}

enum Step {
    Parsed(usize, Frame),
    CrcMismatch(usize, u16, u16, u16),
    MalformedPayload(usize, u16),
    Resync,
    NeedMore,
}

/// Reassembles ≤20-byte BLE notification chunks into whole frames.
#[derive(Default)]
pub struct Psm {
    chunks: VecDeque<Vec<u8>>,
}

impl Psm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound MTU chunk. Returns every frame (or recoverable
    /// error) the new data resolved, in arrival order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.chunks.push_back(chunk.to_vec());

        let mut events = Vec::new();
        loop {
            match self.try_parse_one() {
                Step::Parsed(n, frame) => {
                    self.drain(n);
                    events.push(Event::Frame(frame));
                }
                Step::CrcMismatch(n, kind, expected, computed) => {
                    self.drain(n);
                    events.push(Event::CrcMismatch {
                        kind,
                        expected,
                        computed,
                    });
                }
                Step::MalformedPayload(n, kind) => {
                    self.drain(n);
                    events.push(Event::MalformedPayload(kind));
                }
                Step::Resync => {
                    self.chunks.pop_front();
                }
                Step::NeedMore => break,
            }
        }
        events
    }

    fn drain(&mut self, n: usize) {
        for _ in 0..n {
            self.chunks.pop_front();
        }
    }

    fn try_parse_one(&self) -> Step {
        // A single 20-byte chunk (or, after a resync, an even shorter
        // leftover one) can't hold a full 24-byte header: accumulate
        // chunks until we have one, or run out.
        let mut prefix = Vec::new();
        let mut consumed = 0;
        for chunk in &self.chunks {
            prefix.extend_from_slice(chunk);
            consumed += 1;
            if prefix.len() >= HEADER_LEN {
                break;
            }
        }
        if prefix.len() < HEADER_LEN {
            return Step::NeedMore;
        }

        let length = match Header::peek_length(&prefix) {
            Ok(length) => length as usize,
            // Bad magic, or a declared length too small to ever hold a
            // header: neither condition goes away with more data, so
            // drop one chunk and try again instead of wedging here.
            Err(Error::InvalidMagic) | Err(Error::FrameTooShort) => return Step::Resync,
            Err(_) => return Step::NeedMore,
        };

        let mut buf = prefix;
        while buf.len() < length && consumed < self.chunks.len() {
            buf.extend_from_slice(&self.chunks[consumed]);
            consumed += 1;
        }
        if buf.len() < length {
            return Step::NeedMore;
        }

        // Trailing bytes in the last consumed chunk beyond `length` are
        // discarded by construction: we only ever look at `buf[..length]`.
        let frame_buf = &buf[..length];

        match Header::decode_frame(frame_buf) {
            Ok((header, payload)) => match Packet::decode(header.kind, payload) {
                Ok(packet) => Step::Parsed(
                    consumed,
                    Frame {
                        header,
                        packet,
                        raw: frame_buf.to_vec(),
                    },
                ),
                Err(_) => Step::MalformedPayload(consumed, header.kind),
            },
            Err(Error::InvalidMagic) | Err(Error::FrameTooShort) => Step::Resync,
            Err(Error::CrcMismatch(expected, computed)) => {
                let kind = LittleEndian::read_u16(&frame_buf[2..4]);
                Step::CrcMismatch(consumed, kind, expected, computed)
            }
            Err(_) => Step::NeedMore,
        }
    }
}
