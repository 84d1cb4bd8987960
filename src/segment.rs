//! Segment buffers moved between the offload engine and the socket layer.

use std::fmt;

use bytes::{Buf, Bytes};

bitflags::bitflags! {
    /// Classification of a segment as reported by the offload engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SegmentFlags: u8 {
        const DATA = 0b0001;
        const FIN = 0b0010;
        const RST = 0b0100;
        /// The segment carries a whole packet that must take the slow path
        /// through the host stack.
        const FULL_PACKET = 0b1000;
    }
}

/// A byte-bearing unit with its position in the sequence space.
///
/// A segment is owned by exactly one queue (or one in-flight hardware
/// transfer) at a time. It is deliberately not `Clone`: handing it to
/// another queue is a move.
pub struct Segment {
    seq: u32,
    end_seq: u32,
    flags: SegmentFlags,
    payload: Bytes,
    charge: usize,
}

impl Segment {
    /// A plain data segment covering `[seq, seq + payload.len())`.
    pub fn data(seq: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            seq,
            end_seq: seq.wrapping_add(payload.len() as u32),
            flags: SegmentFlags::DATA,
            payload,
            charge: 0,
        }
    }

    /// A FIN packet. Consumes one sequence number.
    pub fn fin(seq: u32, packet: impl Into<Bytes>) -> Self {
        Self {
            seq,
            end_seq: seq.wrapping_add(1),
            flags: SegmentFlags::FIN | SegmentFlags::FULL_PACKET,
            payload: packet.into(),
            charge: 0,
        }
    }

    /// A RST packet. Occupies one slot in the reassembly order so it cannot
    /// be overtaken by data queued behind it.
    pub fn rst(seq: u32, packet: impl Into<Bytes>) -> Self {
        Self {
            seq,
            end_seq: seq.wrapping_add(1),
            flags: SegmentFlags::RST | SegmentFlags::FULL_PACKET,
            payload: packet.into(),
            charge: 0,
        }
    }

    pub fn from_parts(seq: u32, end_seq: u32, flags: SegmentFlags, payload: Bytes) -> Self {
        Self {
            seq,
            end_seq,
            flags,
            payload,
            charge: 0,
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn end_seq(&self) -> u32 {
        self.end_seq
    }

    pub fn flags(&self) -> SegmentFlags {
        self.flags
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Amount of sequence space covered.
    pub fn seq_len(&self) -> u32 {
        self.end_seq.wrapping_sub(self.seq)
    }

    pub fn is_full_packet(&self) -> bool {
        self.flags.contains(SegmentFlags::FULL_PACKET)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(SegmentFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(SegmentFlags::RST)
    }

    /// Bytes charged against the receive-side occupancy of the owning
    /// connection when this segment was queued.
    pub fn charge(&self) -> usize {
        self.charge
    }

    pub(crate) fn set_charge(&mut self, charge: usize) {
        self.charge = charge;
    }

    /// Drops `n` bytes from the front, advancing the start sequence.
    pub(crate) fn trim_head(&mut self, n: u32) {
        let n = (n as usize).min(self.payload.len());
        self.payload.advance(n);
        self.seq = self.seq.wrapping_add(n as u32);
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment [{} .. {}) {:?} {} bytes",
            self.seq,
            self.end_seq,
            self.flags,
            self.payload.len()
        )
    }
}

/// `lhs` lies strictly before `rhs` in the wrapping sequence space.
pub fn seq_before(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) < 0
}

/// `lhs` lies strictly after `rhs` in the wrapping sequence space.
pub fn seq_after(lhs: u32, rhs: u32) -> bool {
    seq_before(rhs, lhs)
}
