//! Tick-driven send engine.
//!
//! Stands in for the transport layer around a scheduler: it feeds
//! application data into the connection, asks the scheduler for segments
//! every tick, flies them over the simulated subflows and feeds
//! acknowledgements, losses and path failures back.
//!
//! Congestion control is minimal: +1 segment per delivered
//! flight up to `max_cwnd`, halving on loss. A lost flight is delivered
//! one RTT later by the subflow itself, so the scheduler only sees its
//! effect through cwnd, in-flight and loss counters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quanta::{Clock, Mock};
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use strata_mpsched::{
    create_scheduler, Connection, Dispatch, Origin, PathId, PathSignal, Scheduler,
    SchedulerStats, Subflow,
};

use crate::scenario::{PathScenarioConfig, ScenarioConfig};

/// Upper bound on dispatches per tick, in case a policy keeps returning
/// zero-length work.
const MAX_DISPATCH_PER_TICK: usize = 100_000;

#[derive(Debug, Clone, Copy)]
struct Flight {
    path: PathId,
    seq: u64,
    end_seq: u64,
    bytes: u64,
    segments: u32,
    due: Duration,
    /// Already lost once; the subflow's retransmission always arrives.
    retransmitted: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OriginCounters {
    pub fresh: u64,
    pub reinjected: u64,
    pub idle_retransmit: u64,
}

impl OriginCounters {
    fn add(&mut self, origin: Origin, n: u64) {
        match origin {
            Origin::Fresh => self.fresh += n,
            Origin::Reinjected => self.reinjected += n,
            Origin::IdleRetransmit => self.idle_retransmit += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.fresh + self.reinjected + self.idle_retransmit
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PathReport {
    pub path_id: PathId,
    pub failed: bool,
    pub bytes: OriginCounters,
    pub dispatches: OriginCounters,
    pub losses: u64,
    pub final_cwnd: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub scheduler: &'static str,
    pub completed: bool,
    pub elapsed_ms: u64,
    pub payload_bytes: u64,
    pub acked_bytes: u64,
    pub paths: Vec<PathReport>,
    pub stats: SchedulerStats,
}

pub struct Simulation {
    config: ScenarioConfig,
    mock: Arc<Mock>,
    rng: StdRng,
    conn: Connection,
    scheduler: Box<dyn Scheduler>,
    flights: Vec<Flight>,
    /// Delivered ranges above the cumulative acknowledgement.
    delivered: BTreeMap<u64, u64>,
    cum_ack: u64,
    pushed: usize,
    fin_queued: bool,
    now: Duration,
    reports: BTreeMap<PathId, PathReport>,
}

impl Simulation {
    pub fn new(config: ScenarioConfig) -> anyhow::Result<Self> {
        let (clock, mock) = Clock::mock();
        let mut scheduler = create_scheduler(&config.scheduler, clock);
        let mut conn = Connection::new();
        conn.send_buffer.sndbuf = config.send_buffer_bytes;
        conn.rcv_shutdown = true;
        if let Some(window) = config.receive_window_bytes {
            conn.set_send_window(window);
        }

        let mut reports = BTreeMap::new();
        for (i, path) in config.paths.iter().enumerate() {
            let id = PathId::new(i as u8 + 1)
                .ok_or_else(|| anyhow::anyhow!("path index {} out of range", i + 1))?;
            let subflow = build_subflow(id, path);
            scheduler.init_path(&subflow);
            conn.add_subflow(subflow)?;

            if let Some(value) = path.signal_preference {
                scheduler.signal_path(id, PathSignal::Preference(value));
            }
            if let Some(value) = path.signal_burst_length {
                scheduler.signal_path(id, PathSignal::BurstLength(value));
            }

            reports.insert(
                id,
                PathReport {
                    path_id: id,
                    failed: false,
                    bytes: OriginCounters::default(),
                    dispatches: OriginCounters::default(),
                    losses: 0,
                    final_cwnd: path.cwnd,
                },
            );
        }
        // The shutdown marker answers on the first subflow.
        conn.data_fin_path = PathId::new(1);

        info!(
            scheduler = scheduler.name(),
            paths = config.paths.len(),
            payload_bytes = config.payload_bytes,
            seed = config.seed,
            "simulation starting"
        );

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            mock,
            conn,
            scheduler,
            flights: Vec::new(),
            delivered: BTreeMap::new(),
            cum_ack: 0,
            pushed: 0,
            fin_queued: false,
            now: Duration::ZERO,
            reports,
        })
    }

    /// Runs until everything is acknowledged or the scenario times out.
    pub fn run(mut self) -> SimReport {
        while self.now < self.config.duration && !self.completed() {
            self.step();
        }
        self.report()
    }

    /// Advances one tick.
    pub fn step(&mut self) {
        self.now += self.config.tick;
        self.mock.increment(self.config.tick);

        self.resolve_flights();
        self.fail_paths();
        self.feed_application();
        self.dispatch();
    }

    pub fn completed(&self) -> bool {
        self.fin_queued && self.conn.is_idle()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn path_config(&self, id: PathId) -> Option<&PathScenarioConfig> {
        self.config.paths.get(usize::from(id.index()) - 1)
    }

    // ─── Acknowledgements and losses ────────────────────────────────────

    fn resolve_flights(&mut self) {
        let now = self.now;
        let (due, pending): (Vec<_>, Vec<_>) =
            self.flights.drain(..).partition(|f| f.due <= now);
        self.flights = pending;

        for mut flight in due {
            let Some(cfg) = self.path_config(flight.path).cloned() else {
                continue;
            };
            let lost = !flight.retransmitted
                && cfg.loss_percent > 0.0
                && self.rng.random::<f64>() * 100.0 < cfg.loss_percent;
            let Some(sf) = self.conn.subflow_mut(flight.path) else {
                continue;
            };

            if lost {
                sf.snd_cwnd = (sf.snd_cwnd / 2).max(1);
                sf.snd_ssthresh = sf.snd_cwnd.max(2);
                sf.lost += flight.segments;
                if let Some(report) = self.reports.get_mut(&flight.path) {
                    report.losses += u64::from(flight.segments);
                }
                debug!(path_id = %flight.path, seq = flight.seq, cwnd = sf.snd_cwnd, "flight lost");
                flight.due = now + cfg.rtt;
                flight.retransmitted = true;
                self.flights.push(flight);
                continue;
            }

            sf.packets_in_flight = sf.packets_in_flight.saturating_sub(flight.segments);
            sf.snd_una += flight.bytes;
            sf.snd_wnd_end = sf.snd_una + cfg.receive_window_bytes;
            if sf.snd_cwnd < cfg.max_cwnd {
                sf.snd_cwnd += 1;
            }
            self.record_delivery(flight.seq, flight.end_seq);
        }

        self.conn.acknowledge(self.cum_ack);
        if let Some(window) = self.config.receive_window_bytes {
            self.conn.set_send_window(window);
        }
    }

    fn record_delivery(&mut self, seq: u64, end_seq: u64) {
        if end_seq <= self.cum_ack {
            return;
        }
        let entry = self.delivered.entry(seq).or_insert(end_seq);
        *entry = (*entry).max(end_seq);

        while let Some((&start, &end)) = self.delivered.first_key_value() {
            if start > self.cum_ack {
                break;
            }
            self.cum_ack = self.cum_ack.max(end);
            self.delivered.remove(&start);
        }
    }

    // ─── Path failures ──────────────────────────────────────────────────

    fn fail_paths(&mut self) {
        let failing: Vec<PathId> = self
            .conn
            .subflows()
            .iter()
            .filter(|sf| {
                self.path_config(sf.id)
                    .and_then(|cfg| cfg.fail_at)
                    .is_some_and(|at| self.now >= at)
            })
            .map(|sf| sf.id)
            .collect();

        for id in failing {
            self.conn.remove_subflow(id);
            self.scheduler.remove_path(id);
            self.flights.retain(|f| f.path != id);
            if let Some(report) = self.reports.get_mut(&id) {
                report.failed = true;
            }
            warn!(path_id = %id, at_ms = self.now.as_millis() as u64, "path failed");

            if self.conn.data_fin_path.is_none() {
                self.conn.data_fin_path = self.conn.subflows().first().map(|sf| sf.id);
            }
        }
    }

    // ─── Application ────────────────────────────────────────────────────

    fn feed_application(&mut self) {
        let segment = self.config.segment_bytes;
        let mut blocked = false;

        while self.pushed < self.config.payload_bytes {
            let len = segment.min(self.config.payload_bytes - self.pushed);
            if self.conn.send_buffer.wspace() < len {
                blocked = true;
                break;
            }
            self.conn.push_data(Bytes::from(vec![0u8; len]));
            self.pushed += len;
        }
        self.conn.send_buffer.nospace = blocked;

        if self.pushed >= self.config.payload_bytes && !self.fin_queued {
            self.conn.push_data_fin();
            self.fin_queued = true;
        }
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    fn dispatch(&mut self) {
        for _ in 0..MAX_DISPATCH_PER_TICK {
            let Some(d) = self.scheduler.next_segment(&mut self.conn) else {
                return;
            };
            self.fly(d);
        }
        warn!("dispatch limit reached within one tick");
    }

    fn fly(&mut self, d: Dispatch) {
        let Some(cfg) = self.path_config(d.path).cloned() else {
            return;
        };
        let Some(sf) = self.conn.subflow_mut(d.path) else {
            return;
        };

        let bytes = d.segment.len() as u64;
        let segments = (d.segment.len().div_ceil(sf.mss_cache.max(1) as usize)).max(1) as u32;
        sf.packets_in_flight += segments;
        sf.data_segs_out += segments;
        sf.write_seq += bytes;
        sf.snd_nxt += bytes;

        if let Some(report) = self.reports.get_mut(&d.path) {
            report.bytes.add(d.origin, bytes);
            report.dispatches.add(d.origin, 1);
        }

        self.flights.push(Flight {
            path: d.path,
            seq: d.segment.seq(),
            end_seq: d.segment.end_seq(),
            bytes,
            segments,
            due: self.now + cfg.rtt,
            retransmitted: false,
        });
    }

    pub fn report(&self) -> SimReport {
        let paths = self
            .reports
            .values()
            .map(|r| {
                let mut r = r.clone();
                if let Some(sf) = self.conn.subflow(r.path_id) {
                    r.final_cwnd = sf.snd_cwnd;
                }
                r
            })
            .collect();

        SimReport {
            scheduler: self.scheduler.name(),
            completed: self.completed(),
            elapsed_ms: self.now.as_millis() as u64,
            payload_bytes: self.config.payload_bytes as u64,
            acked_bytes: self.conn.snd_una().min(self.config.payload_bytes as u64),
            paths,
            stats: self.scheduler.stats(),
        }
    }
}

fn build_subflow(id: PathId, cfg: &PathScenarioConfig) -> Subflow {
    let mut sf = Subflow::new(id)
        .with_srtt(cfg.rtt)
        .with_cwnd(cfg.cwnd)
        .with_mss(cfg.mss)
        .with_gso_max_segs(cfg.gso_max_segs);
    sf.snd_wnd_end = cfg.receive_window_bytes;
    sf
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_mpsched::SchedulerKind;

    fn scenario(kind: &str, paths: &str) -> ScenarioConfig {
        let toml = format!(
            "seed = 3\nduration_ms = 20000\npayload_bytes = 100000\nsegment_bytes = 1000\n\
             [scheduler]\nkind = \"{kind}\"\n{paths}"
        );
        ScenarioConfig::from_toml_str(&toml).unwrap()
    }

    const TWO_PATHS: &str = "[[paths]]\nrtt_ms = 10\nmss = 1000\n[[paths]]\nrtt_ms = 50\nmss = 1000\n";

    #[test]
    fn every_policy_delivers_the_payload() {
        for kind in ["hint_biased", "rate_round", "quota_burst"] {
            let report = Simulation::new(scenario(kind, TWO_PATHS)).unwrap().run();
            assert!(report.completed, "{kind} did not complete");
            assert_eq!(report.acked_bytes, 100_000);
            let sent: u64 = report.paths.iter().map(|p| p.bytes.fresh).sum();
            assert_eq!(sent, 100_000, "{kind}");
        }
    }

    #[test]
    fn runs_are_deterministic_for_a_seed() {
        let paths = "[[paths]]\nrtt_ms = 10\nloss_percent = 5.0\n[[paths]]\nrtt_ms = 30\nloss_percent = 2.0\n";
        let a = Simulation::new(scenario("rate_round", paths)).unwrap().run();
        let b = Simulation::new(scenario("rate_round", paths)).unwrap().run();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert!(a.paths.iter().any(|p| p.losses > 0));
    }

    #[test]
    fn quota_burst_respects_excluded_path() {
        let paths = "[[paths]]\nrtt_ms = 10\n[[paths]]\nrtt_ms = 10\nsignal_burst_length = 0\n";
        let report = Simulation::new(scenario("quota_burst", paths)).unwrap().run();
        assert!(report.completed);
        assert_eq!(report.paths[1].bytes.total(), 0);
        assert!(report.stats.quota_resets > 0);
    }

    #[test]
    fn failed_path_data_is_reinjected() {
        // Everything starts on the hinted slow path, which dies before its
        // first acknowledgement.
        let paths = "[[paths]]\nrtt_ms = 10\nsignal_preference = 0\n\
                     [[paths]]\nrtt_ms = 200\nfail_at_ms = 150\n";
        let report = Simulation::new(scenario("hint_biased", paths)).unwrap().run();
        assert!(report.completed);
        assert!(report.paths[1].failed);
        assert!(report.paths[0].bytes.reinjected > 0);
    }

    #[test]
    fn blocked_sender_uses_idle_retransmissions() {
        let toml = "seed = 9\nduration_ms = 20000\npayload_bytes = 60000\nsegment_bytes = 1000\n\
                    send_buffer_bytes = 8000\n\
                    [[paths]]\nrtt_ms = 5\ncwnd = 4\nmax_cwnd = 4\nmss = 1000\n\
                    [[paths]]\nrtt_ms = 300\ncwnd = 8\nmss = 1000\n";
        let cfg = ScenarioConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.scheduler.kind, SchedulerKind::HintBiased);
        let report = Simulation::new(cfg).unwrap().run();
        assert!(report.completed);
        assert!(report.stats.idle_retransmits > 0);
        assert!(report.paths[0].bytes.idle_retransmit > 0);
    }
}
