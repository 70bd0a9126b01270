//! kwatch sessions: per-resource-type watch lifecycle and the supervisor that
//! runs one session per type.

#![forbid(unsafe_code)]

mod config;
mod dispatch;
mod observers;
mod session;
mod supervisor;

pub use config::WatchConfig;
pub use observers::{EventTally, Fanout};
pub use session::{EventCounts, SessionPhase, SessionReport, StopReason, WatchSession};
pub use supervisor::{SessionOutcome, Supervisor, SupervisorReport};
