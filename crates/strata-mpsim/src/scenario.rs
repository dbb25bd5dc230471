//! Scenario description for a simulation run.
//!
//! Loaded from TOML the same way scheduler configuration is: a lenient
//! `*Input` layer with serde defaults, resolved into a validated config.

use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use strata_mpsched::config::SchedulerConfigInput;
use strata_mpsched::SchedulerConfig;

const DEFAULT_SEED: u64 = 1;
const DEFAULT_TICK_MS: u64 = 1;
const DEFAULT_DURATION_MS: u64 = 10_000;
const DEFAULT_PAYLOAD_BYTES: usize = 1_000_000;
const DEFAULT_SEGMENT_BYTES: usize = 1_400;
const DEFAULT_SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScenarioInput {
    pub seed: Option<u64>,
    pub tick_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub payload_bytes: Option<usize>,
    pub segment_bytes: Option<usize>,
    pub send_buffer_bytes: Option<usize>,
    /// Connection-level receive window. Unlimited when absent.
    pub receive_window_bytes: Option<u64>,
    pub scheduler: SchedulerConfigInput,
    pub paths: Vec<PathScenarioInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathScenarioInput {
    pub rtt_ms: Option<u64>,
    pub cwnd: Option<u32>,
    pub max_cwnd: Option<u32>,
    pub mss: Option<u32>,
    pub loss_percent: Option<f64>,
    pub gso_max_segs: Option<u16>,
    pub receive_window_bytes: Option<u64>,
    pub signal_preference: Option<u8>,
    pub signal_burst_length: Option<u8>,
    pub fail_at_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub seed: u64,
    pub tick: Duration,
    pub duration: Duration,
    pub payload_bytes: usize,
    pub segment_bytes: usize,
    pub send_buffer_bytes: usize,
    pub receive_window_bytes: Option<u64>,
    pub scheduler: SchedulerConfig,
    pub paths: Vec<PathScenarioConfig>,
}

/// One simulated subflow.
#[derive(Debug, Clone, PartialEq)]
pub struct PathScenarioConfig {
    pub rtt: Duration,
    pub cwnd: u32,
    pub max_cwnd: u32,
    pub mss: u32,
    /// Chance, in percent, that a flight is lost on first delivery.
    pub loss_percent: f64,
    pub gso_max_segs: u16,
    pub receive_window_bytes: u64,
    pub signal_preference: Option<u8>,
    pub signal_burst_length: Option<u8>,
    pub fail_at: Option<Duration>,
}

impl Default for PathScenarioConfig {
    fn default() -> Self {
        Self {
            rtt: Duration::from_millis(40),
            cwnd: 10,
            max_cwnd: 256,
            mss: 1_400,
            loss_percent: 0.0,
            gso_max_segs: 1,
            receive_window_bytes: 4 * 1024 * 1024,
            signal_preference: None,
            signal_burst_length: None,
            fail_at: None,
        }
    }
}

impl ScenarioConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let parsed: ScenarioInput = toml::from_str(input).context("Invalid scenario TOML")?;
        parsed.resolve()
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}

impl ScenarioInput {
    pub fn resolve(self) -> anyhow::Result<ScenarioConfig> {
        let tick_ms = self.tick_ms.unwrap_or(DEFAULT_TICK_MS);
        if tick_ms == 0 {
            bail!("tick_ms must be positive");
        }
        let segment_bytes = self.segment_bytes.unwrap_or(DEFAULT_SEGMENT_BYTES);
        if segment_bytes == 0 {
            bail!("segment_bytes must be positive");
        }
        let send_buffer_bytes = self.send_buffer_bytes.unwrap_or(DEFAULT_SEND_BUFFER_BYTES);
        if send_buffer_bytes < segment_bytes {
            bail!(
                "send_buffer_bytes ({}) must hold at least one segment ({})",
                send_buffer_bytes,
                segment_bytes
            );
        }
        if self.paths.is_empty() {
            bail!("Scenario needs at least one [[paths]] entry");
        }
        if self.paths.len() > 32 {
            bail!("At most 32 paths are supported, got {}", self.paths.len());
        }

        let paths = self
            .paths
            .into_iter()
            .enumerate()
            .map(|(i, p)| p.resolve().with_context(|| format!("paths[{i}]")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ScenarioConfig {
            seed: self.seed.unwrap_or(DEFAULT_SEED),
            tick: Duration::from_millis(tick_ms),
            duration: Duration::from_millis(self.duration_ms.unwrap_or(DEFAULT_DURATION_MS)),
            payload_bytes: self.payload_bytes.unwrap_or(DEFAULT_PAYLOAD_BYTES),
            segment_bytes,
            send_buffer_bytes,
            receive_window_bytes: self.receive_window_bytes,
            scheduler: self.scheduler.resolve()?,
            paths,
        })
    }
}

impl PathScenarioInput {
    pub fn resolve(self) -> anyhow::Result<PathScenarioConfig> {
        let defaults = PathScenarioConfig::default();

        let cwnd = self.cwnd.unwrap_or(defaults.cwnd);
        if cwnd == 0 {
            bail!("cwnd must be positive");
        }
        let max_cwnd = self.max_cwnd.unwrap_or(defaults.max_cwnd.max(cwnd));
        if max_cwnd < cwnd {
            bail!("max_cwnd ({}) is below cwnd ({})", max_cwnd, cwnd);
        }
        let mss = self.mss.unwrap_or(defaults.mss);
        if mss == 0 {
            bail!("mss must be positive");
        }
        let loss_percent = self.loss_percent.unwrap_or(defaults.loss_percent);
        if !(0.0..=100.0).contains(&loss_percent) {
            bail!("loss_percent must be within 0..=100, got {}", loss_percent);
        }

        Ok(PathScenarioConfig {
            rtt: self.rtt_ms.map(Duration::from_millis).unwrap_or(defaults.rtt),
            cwnd,
            max_cwnd,
            mss,
            loss_percent,
            gso_max_segs: self.gso_max_segs.unwrap_or(defaults.gso_max_segs),
            receive_window_bytes: self
                .receive_window_bytes
                .unwrap_or(defaults.receive_window_bytes),
            signal_preference: self.signal_preference,
            signal_burst_length: self.signal_burst_length,
            fail_at: self.fail_at_ms.map(Duration::from_millis),
        })
    }
}
