//! The orchestration engine.
//!
//! Contains:
//! - The cycle state machine (`Orchestrator`, `CyclePhase`)
//! - Scheduling seams: ticker, clock, shutdown signal, run limits
//! - The execution venue boundary and the paper venue
//! - Per-cycle telemetry reports

mod execution;
mod orchestrator;
mod phase;
mod scheduler;
mod telemetry;

pub use execution::{ExecutionVenue, PaperVenue, PositionMark, VenueError};
pub use orchestrator::{CycleOutcome, Orchestrator, OrchestratorSettings, RunSummary, SkipReason};
pub use phase::CyclePhase;
pub use scheduler::{Clock, IntervalTicker, ManualClock, ManualTicker, RunLimit, ShutdownSignal, SystemClock, Ticker};
pub use telemetry::{CycleReport, LogTelemetry, MemoryTelemetry, TelemetrySink};
