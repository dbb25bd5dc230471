use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

/// Which path selection policy a connection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Prefer externally nominated paths, fall back to any capable path.
    #[default]
    HintBiased,
    /// Time rounds with loss-discounted per-path allowances and a master path.
    RateRound,
    /// Fixed burst per path, quotas reset together once all are spent.
    QuotaBurst,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::HintBiased => "hint_biased",
            SchedulerKind::RateRound => "rate_round",
            SchedulerKind::QuotaBurst => "quota_burst",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "hint_biased" => Ok(SchedulerKind::HintBiased),
            "rate_round" => Ok(SchedulerKind::RateRound),
            "quota_burst" => Ok(SchedulerKind::QuotaBurst),
            other => Err(anyhow!("Unknown scheduler kind {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub version: u32,
    pub kind: Option<SchedulerKind>,
    pub burst_length: Option<u8>,
    pub respect_cwnd_fill: Option<bool>,
    pub idle_retransmit: IdleRetransmitConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdleRetransmitConfigInput {
    pub rtt_factor: Option<u32>,
    pub min_trusted_cwnd: Option<u32>,
}

/// Thresholds for the idle-hiding retransmission optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleRetransmitConfig {
    /// A carrying path must be more than this many times slower than the
    /// candidate before a resend on the candidate is worthwhile.
    pub rtt_factor: u32,
    /// A carrying path whose cwnd is at or below this is too constrained
    /// to be trusted with the segment.
    pub min_trusted_cwnd: u32,
}

impl Default for IdleRetransmitConfig {
    fn default() -> Self {
        Self {
            rtt_factor: 4,
            min_trusted_cwnd: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub version: u32,
    pub kind: SchedulerKind,
    /// Initial per-path burst length (quota-burst) or preference (hint-biased).
    pub burst_length: u8,
    /// Quota-burst: require congestion-window headroom during selection.
    pub respect_cwnd_fill: bool,
    pub idle_retransmit: IdleRetransmitConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            kind: SchedulerKind::default(),
            burst_length: 1,
            respect_cwnd_fill: true,
            idle_retransmit: IdleRetransmitConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration for the given policy.
    pub fn for_kind(kind: SchedulerKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(SchedulerConfig::default());
        }
        let parsed: SchedulerConfigInput =
            toml::from_str(input).context("Invalid scheduler config TOML")?;
        parsed.resolve()
    }
}

impl SchedulerConfigInput {
    pub fn resolve(self) -> anyhow::Result<SchedulerConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("Unsupported config version {}", version);
        }

        let defaults = SchedulerConfig::default();
        let idle_defaults = IdleRetransmitConfig::default();

        let rtt_factor = self
            .idle_retransmit
            .rtt_factor
            .unwrap_or(idle_defaults.rtt_factor);
        if rtt_factor == 0 {
            bail!("idle_retransmit.rtt_factor must be at least 1");
        }

        Ok(SchedulerConfig {
            version,
            kind: self.kind.unwrap_or(defaults.kind),
            burst_length: self.burst_length.unwrap_or(defaults.burst_length),
            respect_cwnd_fill: self
                .respect_cwnd_fill
                .unwrap_or(defaults.respect_cwnd_fill),
            idle_retransmit: IdleRetransmitConfig {
                rtt_factor,
                min_trusted_cwnd: self
                    .idle_retransmit
                    .min_trusted_cwnd
                    .unwrap_or(idle_defaults.min_trusted_cwnd),
            },
        })
    }
}
