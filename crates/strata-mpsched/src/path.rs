use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Identifier of a subflow within one connection.
///
/// Valid indices are `1..=32`; each maps to one bit of a segment's
/// [`PathMask`](crate::segment::PathMask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PathId(u8);

impl PathId {
    pub const MAX_INDEX: u8 = 32;

    pub fn new(index: u8) -> Option<Self> {
        if (1..=Self::MAX_INDEX).contains(&index) {
            Some(Self(index))
        } else {
            None
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub(crate) fn flag(self) -> u32 {
        1u32 << (self.0 - 1)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a subflow.
///
/// ```text
/// Connecting → Established → CloseWait → Closing → Closed
/// ```
///
/// Only `Established` and `CloseWait` may carry data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubflowState {
    #[default]
    Connecting,
    Established,
    CloseWait,
    Closing,
    Closed,
}

impl SubflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubflowState::Connecting => "connecting",
            SubflowState::Established => "established",
            SubflowState::CloseWait => "close_wait",
            SubflowState::Closing => "closing",
            SubflowState::Closed => "closed",
        }
    }
}

/// Congestion-avoidance state reported by the congestion controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaState {
    #[default]
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
}

/// Snapshot of one subflow as seen by the scheduler.
///
/// Window, RTT and loss fields are owned by the congestion-control
/// collaborator and read here; the scheduler only writes `snd_cwnd` and
/// `snd_ssthresh` when the idle-hiding optimizer penalizes a slow path.
/// Sequence cursors are byte offsets in the subflow's own sequence space.
#[derive(Debug, Clone)]
pub struct Subflow {
    pub id: PathId,
    pub state: SubflowState,
    /// Handshake not yet acknowledged end to end.
    pub pre_established: bool,
    /// Handshake fully confirmed; before this, data must go out in order.
    pub fully_established: bool,
    /// Path flagged as potentially failed.
    pub potentially_failed: bool,
    pub sack_enabled: bool,
    pub ca_state: CaState,

    // ─── Sequence cursors ───
    pub snd_una: u64,
    pub snd_nxt: u64,
    pub write_seq: u64,
    /// `snd_nxt` at the last retransmission timeout.
    pub high_seq: u64,
    /// Right edge of the peer's advertised receive window.
    pub snd_wnd_end: u64,

    // ─── Handshake ordering ───
    /// At least one data segment has already been mapped onto this subflow.
    pub second_packet: bool,
    /// Connection-level end sequence of the last data mapped here.
    pub last_end_data_seq: u64,

    // ─── Congestion state (segments) ───
    pub packets_in_flight: u32,
    pub snd_cwnd: u32,
    pub snd_ssthresh: u32,
    pub mss_cache: u32,
    /// Maximum segments per hardware offload batch; 0 means unsupported.
    pub gso_max_segs: u16,

    // ─── Measurements ───
    /// Smoothed RTT in microseconds.
    pub srtt_us: u32,
    pub lost: u32,
    pub data_segs_out: u32,
}

impl Subflow {
    /// An established subflow with a 10-segment initial window and no RTT
    /// sample yet.
    pub fn new(id: PathId) -> Self {
        Self {
            id,
            state: SubflowState::Established,
            pre_established: false,
            fully_established: true,
            potentially_failed: false,
            sack_enabled: true,
            ca_state: CaState::Open,
            snd_una: 0,
            snd_nxt: 0,
            write_seq: 0,
            high_seq: 0,
            snd_wnd_end: 64 * 1024,
            second_packet: false,
            last_end_data_seq: 0,
            packets_in_flight: 0,
            snd_cwnd: 10,
            snd_ssthresh: 0x7fff_ffff,
            mss_cache: 1460,
            gso_max_segs: 1,
            srtt_us: 0,
            lost: 0,
            data_segs_out: 0,
        }
    }

    pub fn with_srtt(mut self, srtt: Duration) -> Self {
        self.srtt_us = srtt.as_micros().min(u32::MAX as u128) as u32;
        self
    }

    pub fn with_cwnd(mut self, cwnd: u32) -> Self {
        self.snd_cwnd = cwnd;
        self
    }

    pub fn with_mss(mut self, mss: u32) -> Self {
        self.mss_cache = mss;
        self
    }

    pub fn with_gso_max_segs(mut self, segs: u16) -> Self {
        self.gso_max_segs = segs;
        self
    }

    pub fn can_send(&self) -> bool {
        matches!(
            self.state,
            SubflowState::Established | SubflowState::CloseWait
        )
    }

    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt_us as u64)
    }

    /// Bytes written to the subflow but not yet transmitted.
    pub fn queued_bytes(&self) -> u64 {
        self.write_seq.saturating_sub(self.snd_nxt)
    }

    /// Free congestion-window slots, in segments.
    pub fn cwnd_headroom(&self) -> u32 {
        self.snd_cwnd.saturating_sub(self.packets_in_flight)
    }

    /// Bytes the peer's receive window still admits past `write_seq`.
    pub fn send_window_remaining(&self) -> u64 {
        self.snd_wnd_end.saturating_sub(self.write_seq)
    }

    /// Lost segments per thousand sent; 0 before anything was sent.
    pub fn loss_rate_per_mille(&self) -> u32 {
        if self.data_segs_out == 0 {
            return 0;
        }
        ((self.lost as u64 * 1000) / self.data_segs_out as u64).min(u32::MAX as u64) as u32
    }
}
