//! Per-cycle metrics reports.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::risk::RejectionReason;

/// Portfolio and source metrics at the end of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub active_position_count: usize,
    pub exposure_fraction: Decimal,
    /// Net realised profit across all sources since start
    pub total_profit: Decimal,
    pub opportunities_found: usize,
    pub positions_opened: usize,
    pub positions_closed: usize,
    pub rejections: BTreeMap<RejectionReason, u64>,
    pub win_rate_per_source: BTreeMap<String, Decimal>,
    pub rank_per_source: BTreeMap<String, Decimal>,
}

impl CycleReport {
    pub fn rejection_count(&self, reason: RejectionReason) -> u64 {
        self.rejections.get(&reason).copied().unwrap_or(0)
    }
}

/// Receives one report per completed cycle.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, report: &CycleReport);
}

/// Emits reports as JSON on the `cycle_report` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn emit(&self, report: &CycleReport) {
        let json = serde_json::to_string(report).unwrap_or_default();
        info!(target: "cycle_report", "CYCLE_REPORT: {}", json);
    }
}

/// Keeps reports in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetry {
    reports: Arc<Mutex<Vec<CycleReport>>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<CycleReport> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn last(&self) -> Option<CycleReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn emit(&self, report: &CycleReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}
