//! Outbound fragmenter: splits a serialized frame into ≤20-byte BLE MTU
//! chunks, keeps at most one write outstanding at the transport layer, and
//! purges the rest of a seqno's chunks if its write fails.

use std::collections::VecDeque;

/// Maximum BLE characteristic write size this protocol fragments to.
pub const MTU: usize = 20;

/// Tracks the transmit queue and in-flight write for one transport link.
#[derive(Default)]
pub struct Fragmenter {
    queue: VecDeque<(u32, Vec<u8>)>,
    write_pending: bool,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `frame` into ≤[`MTU`]-byte chunks tagged with `seqno` and
    /// append them to the transmit queue. All chunks from one frame are
    /// contiguous in the queue. Returns the chunk to write immediately if
    /// no write was already outstanding.
    pub fn enqueue(&mut self, seqno: u32, frame: &[u8]) -> Option<Vec<u8>> {
        for chunk in frame.chunks(MTU) {
            self.queue.push_back((seqno, chunk.to_vec()));
        }
        if self.write_pending {
            None
        } else {
            self.start_next()
        }
    }

    fn start_next(&mut self) -> Option<Vec<u8>> {
        match self.queue.front() {
            Some((_, chunk)) => {
                self.write_pending = true;
                Some(chunk.clone())
            }
            None => {
                self.write_pending = false;
                None
            }
        }
    }

    /// The transport reported the outstanding write succeeded. Pops that
    /// chunk and returns the next one to write, if any.
    pub fn on_write_succeeded(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front();
        self.write_pending = false;
        self.start_next()
    }

    /// The transport reported the outstanding write failed. Purges every
    /// remaining chunk for that seqno (abandoning the partial frame) and
    /// resumes with whatever other seqnos remain queued. Returns the
    /// purged seqno and the next chunk to write, if any.
    pub fn on_write_failed(&mut self) -> (u32, Option<Vec<u8>>) {
        let failing_seqno = self
            .queue
            .front()
            .map(|(seqno, _)| *seqno)
            .expect("write failed with no outstanding write");

        while matches!(self.queue.front(), Some((seqno, _)) if *seqno == failing_seqno) {
            self.queue.pop_front();
        }
        self.write_pending = false;

        (failing_seqno, self.start_next())
    }
}
