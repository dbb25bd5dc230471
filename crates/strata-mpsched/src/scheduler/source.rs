use tracing::trace;

use crate::connection::Connection;
use crate::path::PathId;
use crate::segment::{Origin, SegmentSlot};

use super::Scheduler;

/// Where the next segment comes from.
pub(crate) struct Source {
    pub slot: SegmentSlot,
    pub origin: Origin,
    /// Set when the source already settled the path.
    pub path: Option<PathId>,
}

impl Source {
    fn queued(slot: SegmentSlot, origin: Origin) -> Self {
        Self {
            slot,
            origin,
            path: None,
        }
    }
}

/// Picks the segment to schedule this turn and tags where it came from.
///
/// Re-injections always go before fresh data. With nothing queued and the
/// writer blocked on a full send buffer, the policy's idle-hiding optimizer
/// (if any) may offer the oldest unacknowledged segment instead; that offer
/// is bound to the subflow it was vetted for.
pub(crate) fn select_source<S: Scheduler + ?Sized>(
    scheduler: &mut S,
    conn: &mut Connection,
) -> Option<Source> {
    if conn.infinite_mapping {
        return conn
            .segment(SegmentSlot::SendHead)
            .map(|_| Source::queued(SegmentSlot::SendHead, Origin::Fresh));
    }

    if conn.segment(SegmentSlot::Reinject).is_some() {
        return Some(Source::queued(SegmentSlot::Reinject, Origin::Reinjected));
    }

    if conn.segment(SegmentSlot::SendHead).is_some() {
        return Some(Source::queued(SegmentSlot::SendHead, Origin::Fresh));
    }

    if !conn.send_buffer.back_pressured() {
        return None;
    }

    let path = scheduler.select_path(conn, None, false)?;
    let slot = scheduler.idle_retransmit()?.candidate(conn, path, false)?;
    trace!(path_id = %path, "send buffer blocked, offering idle retransmission");
    Some(Source {
        slot,
        origin: Origin::IdleRetransmit,
        path: Some(path),
    })
}
