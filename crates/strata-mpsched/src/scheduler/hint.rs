//! # Hint-biased scheduler
//!
//! An external decision process nominates subflows through
//! [`PathSignal::Preference`]. Nominated ("hinted") subflows take all the
//! traffic they can; the rest only carry data when no hinted subflow is
//! available.
//!
//! Each subflow starts with the configured `burst_length` as its
//! preference, so with the default of 1 every subflow is hinted until told
//! otherwise.

use std::collections::HashMap;

use quanta::Clock;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::connection::Connection;
use crate::path::{PathId, Subflow};
use crate::segment::SegmentSlot;

use super::availability::{data_fin_path, is_available};
use super::optimizer::IdleRetransmit;
use super::{unsupported_signal, PathSignal, Scheduler, SchedulerStats};

pub struct HintBiasedScheduler {
    default_preference: u8,
    preference: HashMap<PathId, u8>,
    optimizer: IdleRetransmit,
    path_mask_resets: u64,
}

impl HintBiasedScheduler {
    pub fn new(config: &SchedulerConfig, clock: Clock) -> Self {
        Self {
            default_preference: config.burst_length,
            preference: HashMap::new(),
            optimizer: IdleRetransmit::new(config.idle_retransmit, clock),
            path_mask_resets: 0,
        }
    }

    fn is_hinted(&self, id: PathId) -> bool {
        self.preference
            .get(&id)
            .copied()
            .unwrap_or(self.default_preference)
            != 0
    }
}

impl Scheduler for HintBiasedScheduler {
    fn name(&self) -> &'static str {
        "hint_biased"
    }

    fn init_path(&mut self, subflow: &Subflow) {
        self.preference.insert(subflow.id, self.default_preference);
        self.optimizer.register_path(subflow.id);
    }

    fn remove_path(&mut self, id: PathId) {
        self.preference.remove(&id);
        self.optimizer.remove_path(id);
    }

    /// Last eligible hinted subflow in subflow order wins. Without one, the
    /// last eligible non-hinted subflow is used and the segment's path-mask
    /// is cleared so it may be sent again anywhere.
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

        let mut best = None;
        let mut backup = None;
        for sf in conn.subflows() {
            if !is_available(sf, view.as_ref(), zero_window_test, true) {
                continue;
            }
            if view.is_some_and(|v| v.carried_by(sf.id)) {
                continue;
            }
            if self.is_hinted(sf.id) {
                best = Some(sf.id);
            } else {
                backup = Some(sf.id);
            }
        }

        if best.is_some() {
            return best;
        }

        let id = backup?;
        if let Some(seg) = slot.and_then(|s| conn.segment_mut(s)) {
            if !seg.path_mask.is_empty() {
                seg.path_mask.clear();
                self.path_mask_resets += 1;
                debug!(path_id = %id, seq = seg.seq(), "no hinted subflow, path-mask reset");
            }
        }
        Some(id)
    }

    fn signal_path(&mut self, id: PathId, signal: PathSignal) -> bool {
        match signal {
            PathSignal::Preference(value) => {
                debug!(path_id = %id, preference = value, "preference updated");
                self.preference.insert(id, value);
                true
            }
            PathSignal::BurstLength(_) => unsupported_signal(self.name(), id, signal),
        }
    }

    fn idle_retransmit(&mut self) -> Option<&mut IdleRetransmit> {
        Some(&mut self.optimizer)
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            path_mask_resets: self.path_mask_resets,
            idle_retransmits: self.optimizer.retransmits(),
            penalties: self.optimizer.penalties(),
            ..SchedulerStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerKind;
    use bytes::Bytes;

    fn path(index: u8) -> PathId {
        PathId::new(index).unwrap()
    }

    fn setup(n: u8) -> (HintBiasedScheduler, Connection) {
        let (clock, _mock) = Clock::mock();
        let mut sched =
            HintBiasedScheduler::new(&SchedulerConfig::for_kind(SchedulerKind::HintBiased), clock);
        let mut conn = Connection::new();
        for i in 1..=n {
            let sf = Subflow::new(path(i)).with_mss(1000);
            sched.init_path(&sf);
            conn.add_subflow(sf).unwrap();
        }
        (sched, conn)
    }

    #[test]
    fn last_hinted_subflow_wins() {
        let (mut sched, mut conn) = setup(3);
        conn.push_data(Bytes::from_static(b"abc"));
        assert_eq!(
            sched.select_path(&mut conn, Some(SegmentSlot::SendHead), false),
            Some(path(3))
        );
    }

    #[test]
    fn hinted_subflow_preferred_over_later_non_hinted() {
        let (mut sched, mut conn) = setup(3);
        assert!(sched.signal_path(path(2), PathSignal::Preference(0)));
        assert!(sched.signal_path(path(3), PathSignal::Preference(0)));
        conn.push_data(Bytes::from_static(b"abc"));
        assert_eq!(
            sched.select_path(&mut conn, Some(SegmentSlot::SendHead), false),
            Some(path(1))
        );
        assert_eq!(sched.stats().path_mask_resets, 0);
    }

    #[test]
    fn congested_subflow_is_skipped() {
        let (mut sched, mut conn) = setup(2);
        if let Some(sf) = conn.subflow_mut(path(2)) {
            sf.packets_in_flight = sf.snd_cwnd;
        }
        if let Some(sf) = conn.subflow_mut(path(1)) {
            sf.packets_in_flight = sf.snd_cwnd - 1;
        }
        conn.push_data(Bytes::from_static(b"abc"));
        assert_eq!(
            sched.select_path(&mut conn, Some(SegmentSlot::SendHead), false),
            Some(path(1))
        );
    }

    #[test]
    fn carriers_are_skipped() {
        let (mut sched, mut conn) = setup(2);
        conn.push_data(Bytes::from_static(b"abc"));
        conn.commit(SegmentSlot::SendHead, path(2), 3).unwrap();
        assert!(conn.reinject(0));

        assert_eq!(
            sched.select_path(&mut conn, Some(SegmentSlot::Reinject), false),
            Some(path(1))
        );
    }

    #[test]
    fn fallback_to_non_hinted_clears_path_mask() {
        let (mut sched, mut conn) = setup(2);
        sched.signal_path(path(1), PathSignal::Preference(0));
        conn.push_data(Bytes::from_static(b"abc"));
        conn.commit(SegmentSlot::SendHead, path(2), 3).unwrap();
        assert!(conn.reinject(0));

        // Path 2 already carries it, path 1 is not hinted.
        assert_eq!(
            sched.select_path(&mut conn, Some(SegmentSlot::Reinject), false),
            Some(path(1))
        );
        let seg = conn.segment(SegmentSlot::Reinject).unwrap();
        assert!(seg.path_mask.is_empty());
        assert_eq!(sched.stats().path_mask_resets, 1);
    }

    #[test]
    fn last_non_hinted_is_the_fallback() {
        let (mut sched, mut conn) = setup(3);
        for i in 1..=3 {
            sched.signal_path(path(i), PathSignal::Preference(0));
        }
        assert_eq!(sched.select_path(&mut conn, None, false), Some(path(3)));
    }

    #[test]
    fn no_available_subflow_yields_none() {
        let (mut sched, mut conn) = setup(2);
        for sf in conn.subflows_mut() {
            sf.potentially_failed = true;
        }
        assert_eq!(sched.select_path(&mut conn, None, false), None);
    }

    #[test]
    fn data_fin_goes_to_designated_subflow() {
        let (mut sched, mut conn) = setup(3);
        conn.rcv_shutdown = true;
        conn.data_fin_path = Some(path(1));
        conn.push_data_fin();
        assert_eq!(
            sched.select_path(&mut conn, Some(SegmentSlot::SendHead), false),
            Some(path(1))
        );
    }

    #[test]
    fn zero_window_test_is_forwarded() {
        let (mut sched, mut conn) = setup(2);
        if let Some(sf) = conn.subflow_mut(path(2)) {
            sf.snd_wnd_end = sf.write_seq;
        }
        assert_eq!(sched.select_path(&mut conn, None, false), Some(path(2)));
        assert_eq!(sched.select_path(&mut conn, None, true), Some(path(1)));
    }

    #[test]
    fn removed_path_reverts_to_default_preference() {
        let (mut sched, _conn) = setup(1);
        sched.signal_path(path(1), PathSignal::Preference(0));
        assert!(!sched.is_hinted(path(1)));
        sched.remove_path(path(1));
        assert!(sched.is_hinted(path(1)));
    }
}
