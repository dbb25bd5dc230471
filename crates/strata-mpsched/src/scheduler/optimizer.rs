//! # Idle-hiding retransmission
//!
//! When the connection stalls on the application or on the peer's receive
//! window, the oldest unacknowledged segment may be resent on an idle,
//! faster subflow so the receiver is not left waiting on a slow one.
//!
//! Two parts:
//!
//! 1. **Penalty**: slower subflows still carrying the segment get their
//!    congestion window halved, at most once per RTT of the fast subflow.
//! 2. **Resend verdict**: decides whether the fast subflow should carry a
//!    copy, based on how constrained or how slow the current carriers are.

use std::collections::HashMap;

use quanta::{Clock, Instant};
use tracing::debug;

use crate::config::IdleRetransmitConfig;
use crate::connection::Connection;
use crate::path::{CaState, PathId, Subflow};
use crate::segment::{SegmentSlot, SegmentView};

use super::availability::is_available;

pub struct IdleRetransmit {
    config: IdleRetransmitConfig,
    clock: Clock,
    /// Last time each subflow penalized its slower peers.
    last_penalty: HashMap<PathId, Instant>,
    penalties: u64,
    retransmits: u64,
}

impl IdleRetransmit {
    pub fn new(config: IdleRetransmitConfig, clock: Clock) -> Self {
        Self {
            config,
            clock,
            last_penalty: HashMap::new(),
            penalties: 0,
            retransmits: 0,
        }
    }

    /// Starts the penalty rate limit for a newly attached subflow.
    pub fn register_path(&mut self, id: PathId) {
        self.last_penalty.insert(id, self.clock.now());
    }

    pub fn remove_path(&mut self, id: PathId) {
        self.last_penalty.remove(&id);
    }

    /// Number of slow subflows whose window was halved.
    pub fn penalties(&self) -> u64 {
        self.penalties
    }

    /// Number of idle retransmissions handed out.
    pub fn retransmits(&self) -> u64 {
        self.retransmits
    }

    /// Returns the slot of the oldest unacknowledged segment if it should be
    /// resent on `path`.
    ///
    /// With `penalize` false and free send-buffer memory the call is a pure
    /// best-effort fill and slower subflows are left alone.
    pub fn candidate(
        &mut self,
        conn: &mut Connection,
        path: PathId,
        penalize: bool,
    ) -> Option<SegmentSlot> {
        let head = conn.segment(SegmentSlot::Unacked)?.view();
        let local = conn.subflow(path)?.clone();

        if penalize || !conn.send_buffer.memory_free() {
            self.penalize_slower(conn, &local, &head);
        }

        if head.carried_by(path) {
            return None;
        }

        if !self.resend_verdict(conn, &local, &head) {
            return None;
        }

        if !is_available(&local, Some(&head), false, true) {
            return None;
        }

        self.retransmits += 1;
        debug!(
            path_id = %path,
            seq = head.seq,
            len = head.len,
            "idle retransmission of oldest unacked segment"
        );
        Some(SegmentSlot::Unacked)
    }

    fn penalize_slower(&mut self, conn: &mut Connection, local: &Subflow, head: &SegmentView) {
        let now = self.clock.now();
        let last = *self.last_penalty.entry(local.id).or_insert(now);
        if now.saturating_duration_since(last) < local.srtt() {
            return;
        }

        let mut penalized = false;
        for other in conn.subflows_mut() {
            if other.id == local.id || !head.carried_by(other.id) {
                continue;
            }
            if local.srtt_us >= other.srtt_us || other.ca_state != CaState::Open {
                continue;
            }

            let prior_cwnd = other.snd_cwnd;
            other.snd_cwnd = (other.snd_cwnd >> 1).max(1);
            // Slow start keeps its threshold.
            if prior_cwnd >= other.snd_ssthresh {
                other.snd_ssthresh = (other.snd_ssthresh >> 1).max(2);
            }

            self.penalties += 1;
            penalized = true;
            debug!(
                path_id = %other.id,
                by = %local.id,
                cwnd = other.snd_cwnd,
                ssthresh = other.snd_ssthresh,
                "halved cwnd of slower carrier"
            );
        }

        if penalized {
            self.last_penalty.insert(local.id, now);
        }
    }

    /// Scans the other carriers of `head` in subflow order. The scan stops
    /// at the first carrier that settles the question: a constrained one
    /// (cwnd at or below `min_trusted_cwnd`) allows the resend, one that is
    /// not more than `rtt_factor` times slower than `local` denies it. A
    /// carrier that is decisively slower allows provisionally and the scan
    /// continues. No other carrier means no resend.
    fn resend_verdict(&self, conn: &Connection, local: &Subflow, head: &SegmentView) -> bool {
        let factor = u64::from(self.config.rtt_factor);
        let local_rtt = u64::from(local.srtt_us);
        let mut verdict = false;

        for other in conn.subflows() {
            if other.id == local.id || !head.carried_by(other.id) {
                continue;
            }
            if other.snd_cwnd <= self.config.min_trusted_cwnd {
                return true;
            }
            if factor * local_rtt >= u64::from(other.srtt_us) {
                return false;
            }
            verdict = true;
        }

        verdict
    }
}
