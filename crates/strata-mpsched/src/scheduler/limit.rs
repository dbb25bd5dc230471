use crate::path::Subflow;

/// Bytes `subflow` may send of a `len`-byte segment this turn.
///
/// A segment that fits in one MSS goes out whole. Larger segments are
/// bounded by the offload batch size and the free cwnd slots; when a full
/// offload batch is smaller than the segment the batch size wins even if it
/// slightly overruns the live window, so batches are not fragmented.
/// Returns `None` when nothing can be sent.
pub fn segment_limit(len: usize, subflow: &Subflow) -> Option<usize> {
    let mss = subflow.mss_cache.max(1) as usize;
    if len <= mss {
        return Some(len);
    }

    let gso_max_segs = u32::from(subflow.gso_max_segs.max(1));
    let max_segs = subflow.cwnd_headroom().min(gso_max_segs) as usize;
    if max_segs == 0 {
        return None;
    }

    let max_len = max_segs * mss;
    if max_len < len {
        return Some(max_len);
    }

    let window = usize::try_from(subflow.send_window_remaining()).unwrap_or(usize::MAX);
    match len.min(window) {
        0 => None,
        limit => Some(limit),
    }
}
