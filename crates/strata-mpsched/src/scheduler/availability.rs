//! Subflow availability gate.
//!
//! Every policy funnels its candidate paths through [`is_available`] before
//! handing one back; it is the check that keeps the scheduler from
//! violating per-path windows or handshake ordering.

use crate::connection::Connection;
use crate::path::{CaState, PathId, Subflow};
use crate::segment::SegmentView;

/// May `subflow` accept `segment` right now?
///
/// `cwnd_test` requires a free congestion-window slot and that the bytes
/// already queued on the subflow fit in the remaining window.
/// `zero_window_test` requires the peer's receive window to still be open.
pub fn is_available(
    subflow: &Subflow,
    segment: Option<&SegmentView>,
    zero_window_test: bool,
    cwnd_test: bool,
) -> bool {
    if !subflow.can_send() {
        return false;
    }

    if subflow.pre_established {
        return false;
    }

    if subflow.potentially_failed {
        return false;
    }

    // Without SACK, loss recovery does not end until something above
    // high_seq is acknowledged, so nothing new may be pushed past it.
    if subflow.ca_state == CaState::Loss {
        if subflow.sack_enabled || subflow.snd_una != subflow.high_seq {
            return false;
        }
    }

    if !subflow.fully_established {
        if let Some(seg) = segment {
            if subflow.second_packet && subflow.last_end_data_seq != seg.seq {
                return false;
            }
        }
    }

    if cwnd_test {
        let in_flight = subflow.packets_in_flight;
        if in_flight >= subflow.snd_cwnd {
            return false;
        }

        let space = u64::from(subflow.snd_cwnd - in_flight) * u64::from(subflow.mss_cache);
        if subflow.queued_bytes() > space {
            return false;
        }
    }

    if zero_window_test && subflow.write_seq >= subflow.snd_wnd_end {
        return false;
    }

    true
}

/// The designated subflow for a pending data-finished segment, when the
/// connection is shutting down and that subflow can take it.
pub(crate) fn data_fin_path(
    conn: &Connection,
    segment: Option<&SegmentView>,
    zero_window_test: bool,
) -> Option<PathId> {
    let seg = segment?;
    if !(conn.rcv_shutdown && seg.data_fin) {
        return None;
    }
    let id = conn.data_fin_path?;
    let subflow = conn.subflow(id)?;
    if is_available(subflow, Some(seg), zero_window_test, true) {
        Some(id)
    } else {
        None
    }
}
