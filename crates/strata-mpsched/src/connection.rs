//! Connection-level state shared by every subflow of one logical connection.
//!
//! Holds the ordered subflow set, the three segment queues the scheduler
//! draws from, send-buffer accounting and the shutdown markers. The host
//! transport layer owns a `Connection` and serialises access to it; the
//! scheduler borrows it mutably for the duration of one decision.

use std::collections::VecDeque;

use anyhow::bail;
use bytes::Bytes;
use tracing::debug;

use crate::path::{PathId, Subflow};
use crate::segment::{Segment, SegmentSlot};

/// Send-buffer occupancy as the socket layer reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendBuffer {
    /// Configured send-buffer size in bytes.
    pub sndbuf: usize,
    /// Bytes currently charged to the buffer (queued plus unacknowledged).
    pub wmem_queued: usize,
    /// The writer hit a full buffer and is waiting for space.
    pub nospace: bool,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self {
            sndbuf: 4 * 1024 * 1024,
            wmem_queued: 0,
            nospace: false,
        }
    }
}

impl SendBuffer {
    pub fn memory_free(&self) -> bool {
        self.wmem_queued < self.sndbuf
    }

    pub fn wspace(&self) -> usize {
        self.sndbuf.saturating_sub(self.wmem_queued)
    }

    pub fn min_wspace(&self) -> usize {
        self.wmem_queued / 2
    }

    /// True back-pressure: the writer is blocked and the buffer is mostly
    /// occupied by unacknowledged data.
    pub fn back_pressured(&self) -> bool {
        self.nospace && self.wspace() < self.min_wspace()
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    subflows: Vec<Subflow>,
    send_queue: VecDeque<Segment>,
    reinject_queue: VecDeque<Segment>,
    unacked: VecDeque<Segment>,
    snd_una: u64,
    write_seq: u64,
    /// Single-path fallback: bypass multipath queues entirely.
    pub infinite_mapping: bool,
    /// The peer has finished sending (our receive side is shut down).
    pub rcv_shutdown: bool,
    /// Subflow that must carry a pending data-finished segment.
    pub data_fin_path: Option<PathId>,
    pub send_buffer: SendBuffer,
    /// Right edge of the connection-level send window (data sequence space).
    pub snd_wnd_end: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            subflows: Vec::new(),
            send_queue: VecDeque::new(),
            reinject_queue: VecDeque::new(),
            unacked: VecDeque::new(),
            snd_una: 0,
            write_seq: 0,
            infinite_mapping: false,
            rcv_shutdown: false,
            data_fin_path: None,
            send_buffer: SendBuffer::default(),
            snd_wnd_end: u64::MAX,
        }
    }

    // ─── Subflows ───────────────────────────────────────────────────────

    pub fn add_subflow(&mut self, subflow: Subflow) -> anyhow::Result<()> {
        if self.subflow(subflow.id).is_some() {
            bail!("Subflow {} already attached", subflow.id);
        }
        self.subflows.push(subflow);
        Ok(())
    }

    /// Detaches a subflow. Unacknowledged data that only this subflow
    /// carried is re-injected, and the path is erased from every path-mask.
    pub fn remove_subflow(&mut self, id: PathId) -> Option<Subflow> {
        let pos = self.subflows.iter().position(|sf| sf.id == id)?;
        let removed = self.subflows.remove(pos);

        let orphaned: Vec<Segment> = self
            .unacked
            .iter()
            .filter(|seg| seg.path_mask.is_only(id))
            .cloned()
            .collect();

        for seg in self
            .send_queue
            .iter_mut()
            .chain(self.reinject_queue.iter_mut())
            .chain(self.unacked.iter_mut())
        {
            seg.path_mask.remove(id);
        }

        let mut reinjected = 0usize;
        for mut seg in orphaned {
            seg.path_mask.remove(id);
            if !self.reinject_queue.iter().any(|r| r.seq() == seg.seq()) {
                self.reinject_queue.push_back(seg);
                reinjected += 1;
            }
        }

        if self.data_fin_path == Some(id) {
            self.data_fin_path = None;
        }

        debug!(path_id = %id, reinjected, "subflow removed");
        Some(removed)
    }

    pub fn subflows(&self) -> &[Subflow] {
        &self.subflows
    }

    pub fn subflows_mut(&mut self) -> &mut [Subflow] {
        &mut self.subflows
    }

    pub fn subflow(&self, id: PathId) -> Option<&Subflow> {
        self.subflows.iter().find(|sf| sf.id == id)
    }

    pub fn subflow_mut(&mut self, id: PathId) -> Option<&mut Subflow> {
        self.subflows.iter_mut().find(|sf| sf.id == id)
    }

    // ─── Application data ───────────────────────────────────────────────

    /// Appends application bytes to the send queue. Returns their data
    /// sequence number.
    pub fn push_data(&mut self, payload: Bytes) -> u64 {
        let seq = self.write_seq;
        self.write_seq += payload.len() as u64;
        self.send_buffer.wmem_queued += payload.len();
        self.send_queue.push_back(Segment::new(seq, payload));
        seq
    }

    /// Queues the end-of-stream marker.
    pub fn push_data_fin(&mut self) -> u64 {
        let seq = self.write_seq;
        self.write_seq += 1;
        self.send_queue.push_back(Segment::data_fin(seq));
        seq
    }

    pub fn snd_una(&self) -> u64 {
        self.snd_una
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    /// Sets the connection-level send window to `bytes` past `snd_una`.
    pub fn set_send_window(&mut self, bytes: u64) {
        self.snd_wnd_end = self.snd_una.saturating_add(bytes);
    }

    /// Copies the unacknowledged segment covering `seq` into the
    /// re-injection queue. Returns false if nothing covers `seq` or it is
    /// already queued.
    pub fn reinject(&mut self, seq: u64) -> bool {
        let Some(seg) = self.unacked.iter().find(|s| s.covers(seq)).cloned() else {
            return false;
        };
        if self.reinject_queue.iter().any(|r| r.seq() == seg.seq()) {
            return false;
        }
        self.reinject_queue.push_back(seg);
        true
    }

    /// Cumulative acknowledgement up to (not including) `data_ack`.
    pub fn acknowledge(&mut self, data_ack: u64) {
        if data_ack <= self.snd_una {
            return;
        }

        let mut freed = 0usize;
        while let Some(front) = self.unacked.front_mut() {
            if front.end_seq() <= data_ack {
                freed += front.len();
                self.unacked.pop_front();
            } else {
                if front.seq() < data_ack {
                    let acked = (data_ack - front.seq()) as usize;
                    freed += front.split_to(acked).len();
                }
                break;
            }
        }
        self.reinject_queue.retain(|s| s.end_seq() > data_ack);

        self.snd_una = data_ack;
        self.send_buffer.wmem_queued = self.send_buffer.wmem_queued.saturating_sub(freed);
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    pub fn reinject_queue_len(&self) -> usize {
        self.reinject_queue.len()
    }

    pub fn unacked(&self) -> impl Iterator<Item = &Segment> {
        self.unacked.iter()
    }

    /// Nothing queued, nothing awaiting acknowledgement.
    pub fn is_idle(&self) -> bool {
        self.send_queue.is_empty() && self.reinject_queue.is_empty() && self.unacked.is_empty()
    }

    // ─── Scheduler access ───────────────────────────────────────────────

    pub fn segment(&self, slot: SegmentSlot) -> Option<&Segment> {
        match slot {
            SegmentSlot::Reinject => self.reinject_queue.front(),
            SegmentSlot::SendHead => self.send_queue.front(),
            SegmentSlot::Unacked => self.unacked.front(),
        }
    }

    pub fn segment_mut(&mut self, slot: SegmentSlot) -> Option<&mut Segment> {
        match slot {
            SegmentSlot::Reinject => self.reinject_queue.front_mut(),
            SegmentSlot::SendHead => self.send_queue.front_mut(),
            SegmentSlot::Unacked => self.unacked.front_mut(),
        }
    }

    /// Whether the connection-level window admits the first `mss` bytes of
    /// the segment in `slot`.
    pub fn send_window_admits(&self, slot: SegmentSlot, mss: u32) -> bool {
        match self.segment(slot) {
            Some(seg) => {
                let first = seg.len().min(mss as usize) as u64;
                seg.seq().saturating_add(first) <= self.snd_wnd_end
            }
            None => false,
        }
    }

    /// Removes the first `limit` bytes of the segment in `slot` from its
    /// queue (or copies them, for the unacknowledged head) and records
    /// `path` as a carrier.
    pub(crate) fn commit(&mut self, slot: SegmentSlot, path: PathId, limit: usize) -> Option<Segment> {
        let mut sent = match slot {
            SegmentSlot::Reinject => {
                let split = limit < self.reinject_queue.front()?.len();
                let sent = if split {
                    self.reinject_queue.front_mut()?.split_to(limit)
                } else {
                    self.reinject_queue.pop_front()?
                };
                self.mark_unacked(sent.seq(), path);
                sent
            }
            SegmentSlot::SendHead => {
                let split = limit < self.send_queue.front()?.len();
                let mut sent = if split {
                    self.send_queue.front_mut()?.split_to(limit)
                } else {
                    self.send_queue.pop_front()?
                };
                sent.path_mask.insert(path);
                self.unacked.push_back(sent.clone());
                sent
            }
            SegmentSlot::Unacked => {
                let head = self.unacked.front_mut()?;
                head.path_mask.insert(path);
                head.prefix(limit)
            }
        };
        sent.path_mask.insert(path);

        if let Some(sf) = self.subflow_mut(path) {
            sf.second_packet = true;
            sf.last_end_data_seq = sent.end_seq();
        }
        Some(sent)
    }

    fn mark_unacked(&mut self, seq: u64, path: PathId) {
        if let Some(seg) = self.unacked.iter_mut().find(|s| s.covers(seq)) {
            seg.path_mask.insert(path);
        }
    }
}
