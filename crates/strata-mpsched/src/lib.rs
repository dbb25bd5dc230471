//! # strata-mpsched
//!
//! Multipath segment scheduler for a logical connection spread over several
//! subflows. For every send opportunity it decides which subflow carries the
//! next segment, how many bytes that subflow may send this turn, and whether
//! the segment is fresh data, a re-injection, or an idle-hiding
//! retransmission.
//!
//! ## Crate structure
//!
//! - [`path`]: Subflow data model (windows, RTT, loss counters, flags)
//! - [`segment`]: Segment descriptors, path-masks, queue slots, origins
//! - [`connection`]: Connection queues, send buffer and shutdown markers
//! - [`scheduler`]: Strategy trait, shared pipeline and the three policies
//! - [`config`]: TOML-backed scheduler configuration
//!
//! Scheduling runs synchronously under whatever lock the host already holds
//! for the connection; nothing here blocks or performs I/O.

pub mod config;
pub mod connection;
pub mod path;
pub mod scheduler;
pub mod segment;

pub use config::{SchedulerConfig, SchedulerKind};
pub use connection::Connection;
pub use path::{PathId, Subflow};
pub use scheduler::{create_scheduler, Dispatch, PathSignal, Scheduler, SchedulerStats};
pub use segment::{Origin, Segment, SegmentSlot};
