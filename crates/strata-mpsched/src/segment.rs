use bytes::Bytes;
use serde::Serialize;

use crate::path::PathId;

/// Set of subflows a segment has already been transmitted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathMask(u32);

impl PathMask {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, id: PathId) -> bool {
        self.0 & id.flag() != 0
    }

    pub fn insert(&mut self, id: PathId) {
        self.0 |= id.flag();
    }

    pub fn remove(&mut self, id: PathId) {
        self.0 &= !id.flag();
    }

    /// Forget every path so the segment may be sent anywhere again.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if `id` is the only path in the mask.
    pub fn is_only(&self, id: PathId) -> bool {
        self.0 == id.flag()
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// A contiguous range of connection-level data.
///
/// `seq` is the data sequence number of the first byte. A data-finished
/// segment occupies one extra sequence number past its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    seq: u64,
    payload: Bytes,
    data_fin: bool,
    pub path_mask: PathMask,
}

impl Segment {
    pub fn new(seq: u64, payload: Bytes) -> Self {
        Self {
            seq,
            payload,
            data_fin: false,
            path_mask: PathMask::empty(),
        }
    }

    /// An empty segment signalling the end of the data stream.
    pub fn data_fin(seq: u64) -> Self {
        Self {
            seq,
            payload: Bytes::new(),
            data_fin: true,
            path_mask: PathMask::empty(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_data_fin(&self) -> bool {
        self.data_fin
    }

    pub fn end_seq(&self) -> u64 {
        self.seq + self.payload.len() as u64 + u64::from(self.data_fin)
    }

    pub fn view(&self) -> SegmentView {
        SegmentView {
            seq: self.seq,
            len: self.payload.len(),
            data_fin: self.data_fin,
            path_mask: self.path_mask,
        }
    }

    /// Splits off the first `at` bytes as a new segment; `self` keeps the
    /// tail and the data-finished flag. Both halves keep the path-mask.
    pub(crate) fn split_to(&mut self, at: usize) -> Segment {
        let at = at.min(self.payload.len());
        let head = Segment {
            seq: self.seq,
            payload: self.payload.split_to(at),
            data_fin: false,
            path_mask: self.path_mask,
        };
        self.seq += at as u64;
        head
    }

    /// Copy of the first `len` bytes, keeping the data-finished flag only
    /// when the whole payload fits.
    pub(crate) fn prefix(&self, len: usize) -> Segment {
        if len >= self.payload.len() {
            return self.clone();
        }
        Segment {
            seq: self.seq,
            payload: self.payload.slice(..len),
            data_fin: false,
            path_mask: self.path_mask,
        }
    }

    pub(crate) fn covers(&self, seq: u64) -> bool {
        seq >= self.seq && seq < self.end_seq().max(self.seq + 1)
    }
}

/// Copy of the fields path selection reads from a candidate segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentView {
    pub seq: u64,
    pub len: usize,
    pub data_fin: bool,
    pub path_mask: PathMask,
}

impl SegmentView {
    pub fn carried_by(&self, id: PathId) -> bool {
        self.path_mask.contains(id)
    }
}

/// Where a candidate segment lives inside a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSlot {
    /// Head of the re-injection queue.
    Reinject,
    /// Head of the send queue (fresh data).
    SendHead,
    /// Oldest unacknowledged segment.
    Unacked,
}

/// Why a segment is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Fresh,
    Reinjected,
    /// Opportunistic resend of the oldest unacknowledged segment on an
    /// idle path.
    IdleRetransmit,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Fresh => "fresh",
            Origin::Reinjected => "reinjected",
            Origin::IdleRetransmit => "idle_retransmit",
        }
    }
}
