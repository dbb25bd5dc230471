//! Deterministic send-engine simulator for `strata-mpsched`.
//!
//! Drives a [`Connection`](strata_mpsched::Connection) and one scheduler
//! policy against modelled subflows (fixed RTT, window growth, random
//! loss, scheduled failure) on a mock clock. A run is fully reproducible
//! from its scenario and seed.

pub mod engine;
pub mod scenario;

pub use engine::{OriginCounters, PathReport, SimReport, Simulation};
pub use scenario::{PathScenarioConfig, ScenarioConfig};
