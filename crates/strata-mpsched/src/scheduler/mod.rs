//! # Path scheduling
//!
//! A [`Scheduler`] decides, once per send opportunity, which segment goes out
//! next, on which subflow, and how many bytes of it. Three policies share the
//! same pipeline:
//!
//! 1. **Source**: re-injections first, then fresh data, then (under send
//!    buffer back-pressure) an idle-hiding retransmission.
//! 2. **Path**: the policy's own `select_path`.
//! 3. **Limit**: how much of the segment the chosen subflow can take now.
//!
//! The policy is picked once per connection through [`create_scheduler`].

pub mod availability;
pub mod hint;
pub mod limit;
pub mod optimizer;
pub mod quota;
pub mod round;
mod source;

use quanta::Clock;
use serde::Serialize;
use tracing::{trace, warn};

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::connection::Connection;
use crate::path::{PathId, Subflow};
use crate::segment::{Origin, Segment, SegmentSlot, SegmentView};

pub use availability::is_available;
pub use hint::HintBiasedScheduler;
pub use limit::segment_limit;
pub use optimizer::IdleRetransmit;
pub use quota::QuotaBurstScheduler;
pub use round::RateRoundScheduler;

/// One scheduling decision, already committed on the connection.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// The bytes to hand to the subflow's send engine.
    pub segment: Segment,
    pub path: PathId,
    pub origin: Origin,
    /// Byte limit granted for this turn. Equals `segment.len()`.
    pub limit: usize,
}

/// Out-of-band per-path input from a collaborator outside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSignal {
    /// Nonzero marks the path as externally favoured.
    Preference(u8),
    /// Segments per quota round; 0 excludes the path.
    BurstLength(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub rounds_started: u64,
    pub quota_resets: u64,
    pub path_mask_resets: u64,
    pub idle_retransmits: u64,
    pub penalties: u64,
}

/// A path-selection policy.
///
/// Implementations keep their per-path state keyed by [`PathId`] and must
/// tolerate paths they have not seen through [`Scheduler::init_path`] yet.
pub trait Scheduler: Send {
    fn name(&self) -> &'static str;

    /// Sets up policy state for a newly attached subflow.
    fn init_path(&mut self, subflow: &Subflow);

    /// Drops policy state of a detached subflow.
    fn remove_path(&mut self, id: PathId);

    /// Chooses a subflow for the segment in `slot`, or for any segment when
    /// `slot` is `None`.
    fn select_path(
        &mut self,
        conn: &mut Connection,
        slot: Option<SegmentSlot>,
        zero_window_test: bool,
    ) -> Option<PathId>;

    /// Picks, sizes and commits the next segment to send.
    fn next_segment(&mut self, conn: &mut Connection) -> Option<Dispatch> {
        dispatch(self, conn)
    }

    /// Handles an external per-path signal. Returns false when the policy
    /// does not use that kind of signal.
    fn signal_path(&mut self, id: PathId, signal: PathSignal) -> bool {
        unsupported_signal(self.name(), id, signal)
    }

    /// The policy's idle-hiding retransmission optimizer, if it has one.
    fn idle_retransmit(&mut self) -> Option<&mut IdleRetransmit> {
        None
    }

    /// Final say on the byte limit of a dispatch of `segment` on `subflow`.
    /// Returning `None` cancels the dispatch.
    fn admit(
        &mut self,
        _subflow: &Subflow,
        _segment: &SegmentView,
        _origin: Origin,
        limit: usize,
    ) -> Option<usize> {
        Some(limit)
    }

    fn stats(&self) -> SchedulerStats;
}

/// Builds the policy named by `config`.
pub fn create_scheduler(config: &SchedulerConfig, clock: Clock) -> Box<dyn Scheduler> {
    match config.kind {
        SchedulerKind::HintBiased => Box::new(HintBiasedScheduler::new(config, clock)),
        SchedulerKind::RateRound => Box::new(RateRoundScheduler::new(config, clock)),
        SchedulerKind::QuotaBurst => Box::new(QuotaBurstScheduler::new(config)),
    }
}

pub(crate) fn unsupported_signal(scheduler: &str, id: PathId, signal: PathSignal) -> bool {
    warn!(scheduler, path_id = %id, ?signal, "signal not supported by scheduler");
    false
}

/// Source, then path, then limit. Shared body of [`Scheduler::next_segment`].
pub(crate) fn dispatch<S: Scheduler + ?Sized>(
    scheduler: &mut S,
    conn: &mut Connection,
) -> Option<Dispatch> {
    let source = source::select_source(scheduler, conn)?;
    let mut slot = source.slot;
    let mut origin = source.origin;

    let path = match source.path {
        Some(path) => path,
        None => scheduler.select_path(conn, Some(slot), false)?,
    };

    let mss = conn.subflow(path)?.mss_cache;
    if origin == Origin::Fresh && !conn.send_window_admits(slot, mss) {
        // Receive-window limited: try to unblock the peer instead.
        slot = scheduler.idle_retransmit()?.candidate(conn, path, true)?;
        origin = Origin::IdleRetransmit;
    }

    let view = conn.segment(slot)?.view();
    let subflow = conn.subflow(path)?;
    let limit = segment_limit(view.len, subflow)?;
    let limit = scheduler.admit(subflow, &view, origin, limit)?;
    let segment = conn.commit(slot, path, limit)?;

    trace!(
        scheduler = scheduler.name(),
        path_id = %path,
        origin = origin.as_str(),
        seq = segment.seq(),
        len = segment.len(),
        "dispatch"
    );

    Some(Dispatch {
        limit: segment.len(),
        segment,
        path,
        origin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn path(index: u8) -> PathId {
        PathId::new(index).unwrap()
    }

    fn scheduler(kind: SchedulerKind, conn: &Connection) -> Box<dyn Scheduler> {
        let (clock, _mock) = Clock::mock();
        let mut sched = create_scheduler(&SchedulerConfig::for_kind(kind), clock);
        for sf in conn.subflows() {
            sched.init_path(sf);
        }
        sched
    }

    fn conn_with(subflows: Vec<Subflow>) -> Connection {
        let mut conn = Connection::new();
        for sf in subflows {
            conn.add_subflow(sf).unwrap();
        }
        conn
    }

    const ALL_KINDS: [SchedulerKind; 3] = [
        SchedulerKind::HintBiased,
        SchedulerKind::RateRound,
        SchedulerKind::QuotaBurst,
    ];

    #[test]
    fn factory_builds_requested_policy() {
        let conn = Connection::new();
        assert_eq!(scheduler(SchedulerKind::HintBiased, &conn).name(), "hint_biased");
        assert_eq!(scheduler(SchedulerKind::RateRound, &conn).name(), "rate_round");
        assert_eq!(scheduler(SchedulerKind::QuotaBurst, &conn).name(), "quota_burst");
    }

    #[test]
    fn nothing_to_send_yields_none() {
        for kind in ALL_KINDS {
            let mut conn = conn_with(vec![Subflow::new(path(1))]);
            let mut sched = scheduler(kind, &conn);
            assert!(sched.next_segment(&mut conn).is_none(), "{kind}");
        }
    }

    #[test]
    fn small_fresh_segment_goes_whole() {
        for kind in ALL_KINDS {
            let mut conn = conn_with(vec![Subflow::new(path(1)).with_mss(1500)]);
            let mut sched = scheduler(kind, &conn);
            conn.push_data(Bytes::from(vec![7u8; 1000]));

            let d = sched.next_segment(&mut conn).unwrap();
            assert_eq!(d.path, path(1), "{kind}");
            assert_eq!(d.origin, Origin::Fresh);
            assert_eq!(d.limit, 1000);
            assert_eq!(d.segment.len(), 1000);
            assert_eq!(conn.send_queue_len(), 0);
            assert_eq!(conn.unacked().count(), 1);
        }
    }

    #[test]
    fn reinjection_goes_before_fresh_data() {
        for kind in ALL_KINDS {
            let mut conn = conn_with(vec![
                Subflow::new(path(1)).with_mss(1000),
                Subflow::new(path(2)).with_mss(1000),
            ]);
            let mut sched = scheduler(kind, &conn);
            conn.push_data(Bytes::from(vec![0u8; 500]));
            sched.next_segment(&mut conn).unwrap();
            conn.push_data(Bytes::from(vec![1u8; 500]));
            assert!(conn.reinject(0));

            let d = sched.next_segment(&mut conn).unwrap();
            assert_eq!(d.origin, Origin::Reinjected, "{kind}");
            assert_eq!(d.segment.seq(), 0);

            let d = sched.next_segment(&mut conn).unwrap();
            assert_eq!(d.origin, Origin::Fresh, "{kind}");
            assert_eq!(d.segment.seq(), 500);
        }
    }

    #[test]
    fn large_segment_is_split_and_tail_stays_queued() {
        let mut conn = conn_with(vec![Subflow::new(path(1))
            .with_mss(1000)
            .with_gso_max_segs(2)]);
        let mut sched = scheduler(SchedulerKind::HintBiased, &conn);
        conn.push_data(Bytes::from(vec![0u8; 5000]));

        let d = sched.next_segment(&mut conn).unwrap();
        assert_eq!(d.limit, 2000);
        let rest = conn.segment(SegmentSlot::SendHead).unwrap();
        assert_eq!(rest.seq(), 2000);
        assert_eq!(rest.len(), 3000);
    }

    #[test]
    fn closed_connection_window_falls_back_to_idle_retransmit() {
        let mut slow = Subflow::new(path(2))
            .with_srtt(Duration::from_millis(100))
            .with_mss(1000);
        slow.packets_in_flight = slow.snd_cwnd;
        let mut conn = conn_with(vec![
            Subflow::new(path(1))
                .with_srtt(Duration::from_millis(10))
                .with_mss(1000),
            slow,
        ]);
        conn.push_data(Bytes::from(vec![0u8; 1000]));
        conn.commit(SegmentSlot::SendHead, path(2), 1000).unwrap();
        conn.push_data(Bytes::from(vec![1u8; 1000]));
        conn.set_send_window(1000);

        let mut sched = scheduler(SchedulerKind::HintBiased, &conn);
        let d = sched.next_segment(&mut conn).unwrap();
        assert_eq!(d.origin, Origin::IdleRetransmit);
        assert_eq!(d.path, path(1));
        assert_eq!(d.segment.seq(), 0);
        assert_eq!(sched.stats().idle_retransmits, 1);
        // Fresh data is still waiting for window.
        assert_eq!(conn.segment(SegmentSlot::SendHead).unwrap().seq(), 1000);
    }

    #[test]
    fn quota_burst_sends_nothing_when_window_closed() {
        let mut conn = conn_with(vec![Subflow::new(path(1)).with_mss(1000)]);
        conn.push_data(Bytes::from(vec![0u8; 1000]));
        conn.set_send_window(0);
        let mut sched = scheduler(SchedulerKind::QuotaBurst, &conn);
        assert!(sched.next_segment(&mut conn).is_none());
        assert_eq!(conn.send_queue_len(), 1);
    }

    #[test]
    fn unsupported_signal_is_rejected() {
        let conn = Connection::new();
        let mut round = scheduler(SchedulerKind::RateRound, &conn);
        assert!(!round.signal_path(path(1), PathSignal::Preference(1)));
        assert!(!round.signal_path(path(1), PathSignal::BurstLength(3)));

        let mut hint = scheduler(SchedulerKind::HintBiased, &conn);
        assert!(!hint.signal_path(path(1), PathSignal::BurstLength(3)));

        let mut quota = scheduler(SchedulerKind::QuotaBurst, &conn);
        assert!(!quota.signal_path(path(1), PathSignal::Preference(1)));
    }
}
