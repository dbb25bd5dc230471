//! # Quota-burst round robin
//!
//! Every subflow may send `burst_length` MSS-sized segments per round before
//! the scheduler rotates away from it. The subflow with the most burst room
//! left is served first; once every eligible subflow has used its burst, all
//! quotas reset together and a new round begins. A burst length of 0 takes
//! a subflow out of rotation entirely.

use std::collections::HashMap;

use tracing::debug;

use crate::config::SchedulerConfig;
use crate::connection::Connection;
use crate::path::{PathId, Subflow};
use crate::segment::{Origin, SegmentSlot, SegmentView};

use super::availability::{data_fin_path, is_available};
use super::{unsupported_signal, PathSignal, Scheduler, SchedulerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathQuota {
    /// Segments charged this round.
    pub quota: u32,
    pub burst_length: u8,
}

impl PathQuota {
    fn new(burst_length: u8) -> Self {
        Self {
            quota: 0,
            burst_length,
        }
    }

    /// Segments left in this round's burst.
    pub fn room(&self) -> u32 {
        u32::from(self.burst_length).saturating_sub(self.quota)
    }
}

pub struct QuotaBurstScheduler {
    default_burst_length: u8,
    respect_cwnd_fill: bool,
    paths: HashMap<PathId, PathQuota>,
    quota_resets: u64,
    path_mask_resets: u64,
}

impl QuotaBurstScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            default_burst_length: config.burst_length,
            respect_cwnd_fill: config.respect_cwnd_fill,
            paths: HashMap::new(),
            quota_resets: 0,
            path_mask_resets: 0,
        }
    }

    pub fn quota(&self, id: PathId) -> PathQuota {
        self.paths
            .get(&id)
            .copied()
            .unwrap_or(PathQuota::new(self.default_burst_length))
    }

    fn state(&mut self, id: PathId) -> &mut PathQuota {
        let burst = self.default_burst_length;
        self.paths.entry(id).or_insert_with(|| PathQuota::new(burst))
    }
}

/// Outcome of one pass over the subflows.
#[derive(Default)]
struct Scan {
    best: Option<(PathId, u32)>,
    backup: Option<PathId>,
    eligible: Vec<PathId>,
    full: usize,
}

impl QuotaBurstScheduler {
    fn scan(
        &mut self,
        conn: &Connection,
        view: Option<&SegmentView>,
        zero_window_test: bool,
    ) -> Scan {
        let mut scan = Scan::default();
        let cwnd_test = self.respect_cwnd_fill;

        for sf in conn.subflows() {
            let state = *self.state(sf.id);
            if state.burst_length == 0 {
                continue;
            }
            if !is_available(sf, view, zero_window_test, cwnd_test) {
                continue;
            }
            if view.is_some_and(|v| v.carried_by(sf.id)) {
                scan.backup = Some(sf.id);
                continue;
            }

            scan.eligible.push(sf.id);
            let room = state.room();
            if room == 0 {
                scan.full += 1;
                continue;
            }
            if scan.best.map_or(true, |(_, best)| room > best) {
                scan.best = Some((sf.id, room));
            }
        }

        scan
    }
}

impl Scheduler for QuotaBurstScheduler {
    fn name(&self) -> &'static str {
        "quota_burst"
    }

    fn init_path(&mut self, subflow: &Subflow) {
        self.paths
            .insert(subflow.id, PathQuota::new(self.default_burst_length));
    }

    fn remove_path(&mut self, id: PathId) {
        self.paths.remove(&id);
    }

    fn select_path(
        &mut self,
        conn: &mut Connection,
        slot: Option<SegmentSlot>,
        zero_window_test: bool,
    ) -> Option<PathId> {
        let view = slot.and_then(|s| conn.segment(s)).map(|seg| seg.view());

        if let Some(id) = data_fin_path(conn, view.as_ref(), zero_window_test) {
            return Some(id);
        }

        let mut backup = None;
        // A reset leaves every eligible subflow with room, so the second
        // pass always settles.
        for pass in 0..2 {
            let scan = self.scan(conn, view.as_ref(), zero_window_test);
            if let Some((id, _)) = scan.best {
                return Some(id);
            }
            backup = scan.backup;

            if pass > 0 || scan.eligible.is_empty() || scan.full < scan.eligible.len() {
                break;
            }
            for id in &scan.eligible {
                self.state(*id).quota = 0;
            }
            self.quota_resets += 1;
            debug!(subflows = scan.eligible.len(), "all bursts used, quotas reset");
        }

        let id = backup?;
        if let Some(seg) = slot.and_then(|s| conn.segment_mut(s)) {
            if !seg.path_mask.is_empty() {
                seg.path_mask.clear();
                self.path_mask_resets += 1;
                debug!(path_id = %id, seq = seg.seq(), "only carriers left, path-mask reset");
            }
        }
        Some(id)
    }

    /// Fresh data is capped to the burst room left on the subflow and
    /// charged against its quota. The subflow must have cwnd room even when
    /// selection ignored it.
    fn admit(
        &mut self,
        subflow: &Subflow,
        segment: &SegmentView,
        origin: Origin,
        limit: usize,
    ) -> Option<usize> {
        if origin != Origin::Fresh {
            return Some(limit);
        }
        if !is_available(subflow, Some(segment), false, true) {
            return None;
        }

        let mss = subflow.mss_cache.max(1) as usize;
        let state = self.state(subflow.id);
        let cap = state.room().max(1) as usize * mss;
        let limit = limit.min(cap);
        let charged = limit.div_ceil(mss).max(1);
        state.quota = state.quota.saturating_add(charged as u32);
        Some(limit)
    }

    fn signal_path(&mut self, id: PathId, signal: PathSignal) -> bool {
        match signal {
            PathSignal::BurstLength(value) => {
                debug!(path_id = %id, burst_length = value, "burst length updated");
                self.state(id).burst_length = value;
                true
            }
            PathSignal::Preference(_) => unsupported_signal(self.name(), id, signal),
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            quota_resets: self.quota_resets,
            path_mask_resets: self.path_mask_resets,
            ..SchedulerStats::default()
        }
    }
}
