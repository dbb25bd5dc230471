//! # Rate-proportional rounds
//!
//! Time is cut into rounds. At the start of a round the subflow with the
//! highest smoothed RTT becomes the *master* and may send a full congestion
//! window; every other subflow gets a loss-discounted allowance
//! `cwnd × (1000 − loss‰) / 1000`. Within a round the fastest subflow with
//! allowance left sends. Non-master subflows that run dry get their
//! allowance refilled while the round (half the master's RTT) lasts, so
//! fast paths keep going while the slow path drains its window.

use std::collections::HashMap;

use quanta::{Clock, Instant};
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::connection::Connection;
use crate::path::{PathId, Subflow};
use crate::segment::SegmentSlot;

use super::availability::{data_fin_path, is_available};
use super::optimizer::IdleRetransmit;
use super::{Scheduler, SchedulerStats};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathAllowance {
    /// Segments the subflow may still send this round.
    pub remaining: i64,
    pub master: bool,
}

#[derive(Debug, Clone, Copy)]
struct Round {
    ends_at: Instant,
    master: PathId,
}

/// Loss-discounted allowance for a subflow that is not master.
fn discounted_allowance(subflow: &Subflow) -> i64 {
    let loss = subflow.loss_rate_per_mille();
    if loss > 1000 {
        return 0;
    }
    i64::from(subflow.snd_cwnd) * i64::from(1000 - loss) / 1000
}

pub struct RateRoundScheduler {
    clock: Clock,
    allowance: HashMap<PathId, PathAllowance>,
    round: Option<Round>,
    optimizer: IdleRetransmit,
    rounds_started: u64,
}

impl RateRoundScheduler {
    pub fn new(config: &SchedulerConfig, clock: Clock) -> Self {
        Self {
            optimizer: IdleRetransmit::new(config.idle_retransmit, clock.clone()),
            clock,
            allowance: HashMap::new(),
            round: None,
            rounds_started: 0,
        }
    }

    pub fn allowance(&self, id: PathId) -> PathAllowance {
        self.allowance.get(&id).copied().unwrap_or_default()
    }

    /// Current master subflow, if a round has been started.
    pub fn master(&self) -> Option<PathId> {
        self.round.map(|r| r.master)
    }

    fn round_active(&self, now: Instant) -> bool {
        self.round.is_some_and(|r| now < r.ends_at)
    }

    /// Lowest-RTT subflow that can send and has allowance left, refilling
    /// drained non-master allowances while the round lasts.
    fn pick(&mut self, conn: &Connection) -> Option<PathId> {
        let active = self.round_active(self.clock.now());
        let mut best: Option<(PathId, u32)> = None;

        for sf in conn.subflows() {
            let state = self.allowance.entry(sf.id).or_default();
            if state.remaining <= 0 && !state.master && active {
                state.remaining = discounted_allowance(sf);
            }

            if !sf.can_send() || state.remaining <= 0 {
                continue;
            }
            if best.map_or(true, |(_, rtt)| sf.srtt_us < rtt) {
                best = Some((sf.id, sf.srtt_us));
            }
        }

        best.map(|(id, _)| id)
    }

    fn start_round(&mut self, conn: &Connection) {
        let Some(master) = conn
            .subflows()
            .iter()
            .reduce(|best, sf| if sf.srtt_us > best.srtt_us { sf } else { best })
        else {
            return;
        };

        for sf in conn.subflows() {
            let is_master = sf.id == master.id;
            let remaining = if is_master {
                i64::from(sf.snd_cwnd)
            } else {
                discounted_allowance(sf)
            };
            self.allowance.insert(
                sf.id,
                PathAllowance {
                    remaining,
                    master: is_master,
                },
            );
        }

        let ends_at = self.clock.now() + master.srtt() / 2;
        self.round = Some(Round {
            ends_at,
            master: master.id,
        });
        self.rounds_started += 1;
        debug!(
            master = %master.id,
            master_rtt_us = master.srtt_us,
            allowance = master.snd_cwnd,
            "new round"
        );
    }
}

impl Scheduler for RateRoundScheduler {
    fn name(&self) -> &'static str {
        "rate_round"
    }

    fn init_path(&mut self, subflow: &Subflow) {
        self.allowance.insert(subflow.id, PathAllowance::default());
        self.optimizer.register_path(subflow.id);
    }

    fn remove_path(&mut self, id: PathId) {
        self.allowance.remove(&id);
        self.optimizer.remove_path(id);
        if self.round.is_some_and(|r| r.master == id) {
            // Next selection elects a new master.
            self.round = None;
        }
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

        let picked = match self.pick(conn) {
            Some(id) => id,
            None => {
                self.start_round(conn);
                self.pick(conn)?
            }
        };

        let sf = conn.subflow(picked)?;
        if !is_available(sf, view.as_ref(), zero_window_test, true) {
            return None;
        }

        if let Some(state) = self.allowance.get_mut(&picked) {
            state.remaining -= 1;
        }
        Some(picked)
    }

    fn idle_retransmit(&mut self) -> Option<&mut IdleRetransmit> {
        Some(&mut self.optimizer)
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            rounds_started: self.rounds_started,
            idle_retransmits: self.optimizer.retransmits(),
            penalties: self.optimizer.penalties(),
            ..SchedulerStats::default()
        }
    }
}
