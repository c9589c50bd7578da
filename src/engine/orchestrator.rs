//! The orchestration control loop.
//!
//! Each cycle runs its phases strictly in sequence:
//! - FETCHING: one snapshot from the feed; failure or timeout skips the cycle
//! - ANALYZING: every idle active source on the blocking pool, panics isolated
//! - PRIORITIZING: merge, drop HOLD signals, stable sort by priority score
//! - EXECUTING: risk checks and venue opens until the concurrency limit
//! - MANAGING_POSITIONS: mark open positions, close on stop/target/expiry
//! - REPORTING: recompute rankings, optional rebalance, emit a report
//!
//! The stop signal is honoured between phases only. SHUTTING_DOWN
//! force-closes every open position and records its outcome.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use super::execution::{ExecutionVenue, PositionMark};
use super::phase::CyclePhase;
use super::scheduler::{Clock, RunLimit, ShutdownSignal, SystemClock, Ticker};
use super::telemetry::{CycleReport, TelemetrySink};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::feed::{Snapshot, SnapshotFeed};
use crate::risk::{CloseReason, PortfolioState, Position, RejectionReason, RiskDecision, RiskGovernor, RiskLimits};
use crate::strategy::{BuiltSource, CapitalAllocation, Opportunity, OpportunitySource, Ranking, Registry};

/// Timing and weighting knobs for the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Budget for fetching and analyzing one snapshot
    pub cycle_deadline: Duration,
    /// Budget for each venue call
    pub venue_timeout: Duration,
    pub priority_profit_weight: Decimal,
    pub priority_win_rate_weight: Decimal,
    pub rebalance_every_cycles: Option<u64>,
    pub max_position_age: Option<Duration>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cycle_deadline: Duration::from_millis(config.engine.cycle_deadline_ms),
            venue_timeout: Duration::from_millis(config.engine.venue_timeout_ms),
            priority_profit_weight: config.ranking.priority_profit_weight,
            priority_win_rate_weight: config.ranking.priority_win_rate_weight,
            rebalance_every_cycles: config.allocation.rebalance_every_cycles,
            max_position_age: config.risk.max_position_age_secs.map(Duration::from_secs),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a cycle was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    FetchFailed(String),
    /// The deadline ran out during this phase
    DeadlineExceeded(CyclePhase),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchFailed(error) => write!(f, "fetch failed: {error}"),
            Self::DeadlineExceeded(phase) => write!(f, "deadline exceeded in {phase}"),
        }
    }
}

/// How one cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
    /// Stop requested before `before` started
    Interrupted { before: CyclePhase },
}

/// Totals for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub positions_opened: u64,
    /// Every close, including forced ones
    pub positions_closed: u64,
    pub forced_closes: u64,
    pub net_profit: Decimal,
    pub rankings: Vec<Ranking>,
}

#[derive(Debug, Default)]
struct RunTotals {
    cycles_completed: u64,
    cycles_skipped: u64,
    positions_opened: u64,
    positions_closed: u64,
    forced_closes: u64,
}

#[derive(Debug, Default)]
struct CycleCounters {
    opportunities_found: usize,
    positions_opened: usize,
    positions_closed: usize,
    rejections: BTreeMap<RejectionReason, u64>,
}

impl CycleCounters {
    fn reject(&mut self, reason: RejectionReason) {
        *self.rejections.entry(reason).or_insert(0) += 1;
    }
}

struct Candidate {
    opportunity: Opportunity,
    priority: Decimal,
}

type Analysis = Vec<(Arc<dyn OpportunitySource>, Vec<Opportunity>)>;

/// Sources whose analysis is still running on the blocking pool.
///
/// A timed-out cycle cannot stop a blocking task, so a source stays here
/// until its `analyze` call returns and is left out of later cycles until then.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    fn ids(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn contains(&self, source_id: &str) -> bool {
        self.ids().contains(source_id)
    }

    /// Mark `source_id` as running until the returned guard drops.
    fn start(&self, source_id: &str) -> InFlightGuard {
        self.ids().insert(source_id.to_string());
        InFlightGuard {
            in_flight: self.clone(),
            source_id: source_id.to_string(),
        }
    }
}

struct InFlightGuard {
    in_flight: InFlight,
    source_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.ids().remove(&self.source_id);
    }
}

/// Owns the registry, allocation, governor and open positions, and drives
/// them through the cycle state machine.
pub struct Orchestrator {
    registry: Registry,
    allocation: CapitalAllocation,
    /// Share of capital redistributed by rank rebalancing
    allocation_budget: Decimal,
    governor: RiskGovernor,
    portfolio: PortfolioState,
    feed: Box<dyn SnapshotFeed>,
    venue: Box<dyn ExecutionVenue>,
    telemetry: Box<dyn TelemetrySink>,
    clock: Box<dyn Clock>,
    shutdown: ShutdownSignal,
    settings: OrchestratorSettings,
    phase: CyclePhase,
    cycle: u64,
    last_snapshot: Option<Arc<Snapshot>>,
    in_flight: InFlight,
    totals: RunTotals,
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        allocation: CapitalAllocation,
        governor: RiskGovernor,
        feed: Box<dyn SnapshotFeed>,
        venue: Box<dyn ExecutionVenue>,
        telemetry: Box<dyn TelemetrySink>,
        settings: OrchestratorSettings,
    ) -> Self {
        let portfolio = PortfolioState::new(allocation.total_capital());
        let allocation_budget = allocation.total_fraction();
        Self {
            registry,
            allocation,
            allocation_budget,
            governor,
            portfolio,
            feed,
            venue,
            telemetry,
            clock: Box::new(SystemClock),
            shutdown: ShutdownSignal::new(),
            settings,
            phase: CyclePhase::Idle,
            cycle: 0,
            last_snapshot: None,
            in_flight: InFlight::default(),
            totals: RunTotals::default(),
        }
    }

    /// Validate `config`, register `sources` and wire everything together.
    pub fn from_config(
        config: &Config,
        sources: Vec<BuiltSource>,
        feed: Box<dyn SnapshotFeed>,
        venue: Box<dyn ExecutionVenue>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Result<Self> {
        config.validate()?;

        let mut registry = Registry::new(config.ranking.clone());
        for built in sources {
            registry.register(built.source, built.initial_rank)?;
        }
        let allocation = CapitalAllocation::new(
            config.engine.total_capital,
            &config.allocation.percentages,
            &registry.ids(),
        )?;
        let governor = RiskGovernor::new(RiskLimits::from(&config.risk));

        Ok(Self::new(
            registry,
            allocation,
            governor,
            feed,
            venue,
            telemetry,
            OrchestratorSettings::from_config(config),
        ))
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that stops this orchestrator at the next phase boundary.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Between cycles only, e.g. to reset or re-enable a source.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn allocation(&self) -> &CapitalAllocation {
        &self.allocation
    }

    /// Replace allocation shares between cycles.
    pub fn rebalance(&mut self, percentages: &BTreeMap<String, Decimal>) -> Result<()> {
        self.allocation.rebalance(percentages)?;
        self.allocation_budget = self.allocation.total_fraction();
        Ok(())
    }

    pub fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Number of the last cycle started.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Run cycles until the limit, a stop request or a fatal error, then
    /// shut down. Positions are always force-closed before returning.
    pub async fn run(&mut self, limit: RunLimit, ticker: &mut dyn Ticker) -> Result<RunSummary> {
        let started = self.clock.now();
        let mut cycles = 0u64;
        info!(
            sources = self.registry.len(),
            capital = %self.portfolio.total_capital(),
            ?limit,
            "Orchestrator starting"
        );

        let outcome = loop {
            if self.shutdown.is_triggered() {
                info!(cycles, "Stop requested");
                break Ok(());
            }
            if limit.reached(cycles, self.clock.now() - started) {
                info!(cycles, "Run limit reached");
                break Ok(());
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.wait() => {
                    info!(cycles, "Stop requested while waiting for next cycle");
                    break Ok(());
                }
            }

            cycles += 1;
            match self.run_cycle().await {
                Ok(CycleOutcome::Interrupted { before }) => {
                    info!(cycle = self.cycle, %before, "Cycle interrupted by stop request");
                    break Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    error!(cycle = self.cycle, error = %e, "Halting on fatal error");
                    break Err(e);
                }
            }
        };

        let shutdown = self.shut_down().await;
        outcome?;
        shutdown?;
        Ok(self.summary())
    }

    /// Run one full cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.cycle += 1;
        let cycle = self.cycle;
        let started = Instant::now();
        let deadline = self.settings.cycle_deadline;

        if !self.begin(CyclePhase::Fetching) {
            return Ok(CycleOutcome::Interrupted { before: CyclePhase::Fetching });
        }
        let snapshot = match timeout(deadline, self.feed.fetch()).await {
            Ok(Ok(snapshot)) => Arc::new(snapshot),
            Ok(Err(e)) => {
                warn!(cycle, feed = %self.feed.name(), error = %format!("{e:#}"), "Snapshot fetch failed, skipping cycle");
                return Ok(self.skip(SkipReason::FetchFailed(format!("{e:#}"))));
            }
            Err(_) => {
                warn!(cycle, feed = %self.feed.name(), ?deadline, "Snapshot fetch timed out, skipping cycle");
                return Ok(self.skip(SkipReason::DeadlineExceeded(CyclePhase::Fetching)));
            }
        };
        self.last_snapshot = Some(Arc::clone(&snapshot));

        if !self.begin(CyclePhase::Analyzing) {
            return Ok(CycleOutcome::Interrupted { before: CyclePhase::Analyzing });
        }
        let sources = self.idle_sources(cycle);
        let remaining = deadline.saturating_sub(started.elapsed());
        let analysis = match timeout(remaining, analyze(sources, Arc::clone(&snapshot), cycle, &self.in_flight)).await {
            Ok(analysis) => analysis,
            Err(_) => {
                warn!(cycle, ?deadline, "Analysis overran the cycle deadline, abandoning cycle");
                return Ok(self.skip(SkipReason::DeadlineExceeded(CyclePhase::Analyzing)));
            }
        };

        let mut counters = CycleCounters::default();
        for (source, opportunities) in &analysis {
            self.registry.note_opportunities(source.id(), opportunities)?;
            counters.opportunities_found += opportunities.len();
        }

        if !self.begin(CyclePhase::Prioritizing) {
            return Ok(CycleOutcome::Interrupted { before: CyclePhase::Prioritizing });
        }
        let candidates = self.prioritize(analysis, &mut counters);

        if !self.begin(CyclePhase::Executing) {
            return Ok(CycleOutcome::Interrupted { before: CyclePhase::Executing });
        }
        self.execute(candidates, cycle, &mut counters).await?;
        self.check_invariants()?;

        if !self.begin(CyclePhase::ManagingPositions) {
            return Ok(CycleOutcome::Interrupted { before: CyclePhase::ManagingPositions });
        }
        self.manage(&snapshot, cycle, &mut counters).await?;

        if !self.begin(CyclePhase::Reporting) {
            return Ok(CycleOutcome::Interrupted { before: CyclePhase::Reporting });
        }
        let report = self.report(cycle, counters)?;
        self.telemetry.emit(&report);
        self.totals.cycles_completed += 1;

        debug!(
            cycle,
            opened = report.positions_opened,
            closed = report.positions_closed,
            active = report.active_position_count,
            "Cycle complete"
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Active sources, minus those still busy with an earlier snapshot.
    fn idle_sources(&self, cycle: u64) -> Vec<Arc<dyn OpportunitySource>> {
        self.registry
            .active_sources()
            .into_iter()
            .filter(|source| {
                let busy = self.in_flight.contains(source.id());
                if busy {
                    warn!(cycle, source = %source.id(), "Previous analysis still running, skipping source this cycle");
                }
                !busy
            })
            .collect()
    }

    /// Enter `phase` unless a stop was requested.
    fn begin(&mut self, phase: CyclePhase) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        trace!(cycle = self.cycle, %phase, "Entering phase");
        self.phase = phase;
        true
    }

    fn skip(&mut self, reason: SkipReason) -> CycleOutcome {
        self.totals.cycles_skipped += 1;
        self.phase = CyclePhase::Idle;
        CycleOutcome::Skipped(reason)
    }

    /// Merge every source's findings, keep EXECUTE signals and order them by
    /// priority. Equal priorities keep discovery order.
    fn prioritize(&self, analysis: Analysis, counters: &mut CycleCounters) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        for (source, opportunities) in analysis {
            let id = source.id();
            let rank = self.registry.rank_score(id).unwrap_or(Decimal::ZERO);
            let win_rate = self.registry.win_rate(id).unwrap_or(Decimal::ZERO);

            for opportunity in opportunities {
                let signal = source.signal(&opportunity);
                if !signal.is_execute() {
                    trace!(source = %id, confidence = %signal.confidence, "Holding low-confidence opportunity");
                    counters.reject(RejectionReason::LowConfidence);
                    continue;
                }

                let Some(priority) = self.priority_of(rank, win_rate, &opportunity) else {
                    warn!(
                        source = %id,
                        %rank,
                        profit = %opportunity.estimated_profit_fraction,
                        "Priority out of range, dropping opportunity"
                    );
                    continue;
                };
                candidates.push(Candidate { opportunity, priority });
            }
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
    }

    fn priority_of(&self, rank: Decimal, win_rate: Decimal, opportunity: &Opportunity) -> Option<Decimal> {
        let profit_term = self
            .settings
            .priority_profit_weight
            .checked_mul(opportunity.estimated_profit_fraction)?;
        let win_rate_term = self.settings.priority_win_rate_weight.checked_mul(win_rate)?;
        rank.checked_add(profit_term)?.checked_add(win_rate_term)
    }

    async fn execute(&mut self, candidates: Vec<Candidate>, cycle: u64, counters: &mut CycleCounters) -> Result<()> {
        let max_positions = self.governor.limits().max_concurrent_positions;

        for candidate in candidates {
            if self.portfolio.len() >= max_positions {
                debug!(cycle, max_positions, "Concurrency limit reached, not scanning further");
                break;
            }

            let opportunity = candidate.opportunity;
            let allocated = self.allocation.allocated_capital(&opportunity.source_id);
            let now = self.clock.now();

            let position = match self.governor.evaluate(&opportunity, allocated, &self.portfolio, now) {
                RiskDecision::Accepted(position) => position,
                RiskDecision::Rejected(rejection) => {
                    counters.reject(rejection.reason);
                    continue;
                }
            };

            match timeout(self.settings.venue_timeout, self.venue.open(&position)).await {
                Ok(Ok(())) => {
                    info!(
                        cycle,
                        source = %position.source_id,
                        position = %position.id,
                        capital = %position.capital_committed,
                        priority = %candidate.priority,
                        "Opened position"
                    );
                    self.portfolio.open(position)?;
                    counters.positions_opened += 1;
                    self.totals.positions_opened += 1;
                }
                Ok(Err(e)) => {
                    warn!(cycle, source = %position.source_id, error = %e, "Venue refused open, discarding candidate");
                }
                Err(_) => {
                    warn!(cycle, source = %position.source_id, "Venue open timed out, discarding candidate");
                }
            }
        }
        Ok(())
    }

    /// Exposure and concurrency must hold after every EXECUTING phase.
    fn check_invariants(&self) -> Result<()> {
        let limits = self.governor.limits();
        self.portfolio.check_exposure(limits.max_exposure_fraction)?;
        if self.portfolio.len() > limits.max_concurrent_positions {
            return Err(EngineError::invariant(
                "concurrency_within_limit",
                format!(
                    "{} positions open, limit {}",
                    self.portfolio.len(),
                    limits.max_concurrent_positions
                ),
            ));
        }
        Ok(())
    }

    async fn manage(&mut self, snapshot: &Snapshot, cycle: u64, counters: &mut CycleCounters) -> Result<()> {
        let now = self.clock.now();
        let positions: Vec<Position> = self.portfolio.positions().cloned().collect();

        for position in positions {
            let mark = match timeout(self.settings.venue_timeout, self.venue.mark(&position, snapshot)).await {
                Ok(Ok(mark)) => mark,
                Ok(Err(e)) => {
                    warn!(cycle, position = %position.id, error = %e, "Mark failed, keeping position");
                    continue;
                }
                Err(_) => {
                    warn!(cycle, position = %position.id, "Mark timed out, keeping position");
                    continue;
                }
            };

            let Some(reason) = self.close_reason(&position, &mark, now) else {
                trace!(position = %position.id, return_fraction = %mark.return_fraction, "Holding position");
                continue;
            };

            match timeout(self.settings.venue_timeout, self.venue.close(&position, mark.return_fraction)).await {
                Ok(Ok(())) => {
                    self.settle(&position.id, mark.return_fraction, reason)?;
                    counters.positions_closed += 1;
                }
                Ok(Err(e)) => {
                    warn!(cycle, position = %position.id, %reason, error = %e, "Close failed, retrying next cycle");
                }
                Err(_) => {
                    warn!(cycle, position = %position.id, %reason, "Close timed out, retrying next cycle");
                }
            }
        }
        Ok(())
    }

    fn close_reason(&self, position: &Position, mark: &PositionMark, now: DateTime<Utc>) -> Option<CloseReason> {
        if mark.closed_externally {
            Some(CloseReason::External)
        } else if position.hits_stop_loss(mark.return_fraction) {
            Some(CloseReason::StopLoss)
        } else if position.hits_take_profit(mark.return_fraction) {
            Some(CloseReason::TakeProfit)
        } else if self
            .settings
            .max_position_age
            .is_some_and(|max_age| position.age(now) >= max_age)
        {
            Some(CloseReason::Expired)
        } else {
            None
        }
    }

    /// Remove a position and record its outcome, with no await in between.
    fn settle(&mut self, position_id: &str, return_fraction: Decimal, reason: CloseReason) -> Result<Option<Decimal>> {
        let Some(position) = self.portfolio.close(position_id) else {
            return Ok(None);
        };

        let profit = position.profit_at(return_fraction);
        let won = profit > Decimal::ZERO;
        self.registry.record_outcome(&position.source_id, profit, won)?;
        self.totals.positions_closed += 1;

        info!(
            source = %position.source_id,
            position = %position.id,
            %reason,
            %return_fraction,
            %profit,
            won,
            "Closed position"
        );
        Ok(Some(profit))
    }

    fn report(&mut self, cycle: u64, counters: CycleCounters) -> Result<CycleReport> {
        self.registry.recompute_rankings();

        if let Some(every) = self.settings.rebalance_every_cycles {
            if every > 0 && cycle % every == 0 {
                self.allocation.rebalance_by_rank(&self.registry, self.allocation_budget)?;
            }
        }

        let rankings = self.registry.rankings();
        Ok(CycleReport {
            timestamp: self.clock.now(),
            cycle,
            active_position_count: self.portfolio.len(),
            exposure_fraction: self.portfolio.exposure_fraction(),
            total_profit: self.registry.summary().net_profit,
            opportunities_found: counters.opportunities_found,
            positions_opened: counters.positions_opened,
            positions_closed: counters.positions_closed,
            rejections: counters.rejections,
            win_rate_per_source: rankings.iter().map(|r| (r.source_id.clone(), r.win_rate)).collect(),
            rank_per_source: rankings.iter().map(|r| (r.source_id.clone(), r.rank_score)).collect(),
        })
    }

    /// Force-close every open position at its current mark and record the
    /// outcome. A position whose mark fails is closed at entry value; a
    /// failed venue close is logged and the outcome recorded anyway.
    pub async fn shut_down(&mut self) -> Result<usize> {
        self.phase = CyclePhase::ShuttingDown;
        let positions: Vec<Position> = self.portfolio.positions().cloned().collect();
        if positions.is_empty() {
            info!("Shutdown complete, no open positions");
            return Ok(0);
        }

        warn!(count = positions.len(), "Force-closing open positions");
        let snapshot = self
            .last_snapshot
            .clone()
            .unwrap_or_else(|| Arc::new(Snapshot::empty()));
        let venue_timeout = self.settings.venue_timeout;

        for position in &positions {
            let return_fraction = match timeout(venue_timeout, self.venue.mark(position, &snapshot)).await {
                Ok(Ok(mark)) => mark.return_fraction,
                Ok(Err(e)) => {
                    warn!(position = %position.id, error = %e, "Mark failed during shutdown, closing at entry value");
                    Decimal::ZERO
                }
                Err(_) => {
                    warn!(position = %position.id, "Mark timed out during shutdown, closing at entry value");
                    Decimal::ZERO
                }
            };

            match timeout(venue_timeout, self.venue.close(position, return_fraction)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(position = %position.id, error = %e, "Venue close failed during shutdown"),
                Err(_) => error!(position = %position.id, "Venue close timed out during shutdown"),
            }

            self.settle(&position.id, return_fraction, CloseReason::Shutdown)?;
            self.totals.forced_closes += 1;
        }

        self.registry.recompute_rankings();
        info!(closed = positions.len(), "Shutdown complete");
        Ok(positions.len())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            cycles_completed: self.totals.cycles_completed,
            cycles_skipped: self.totals.cycles_skipped,
            positions_opened: self.totals.positions_opened,
            positions_closed: self.totals.positions_closed,
            forced_closes: self.totals.forced_closes,
            net_profit: self.registry.summary().net_profit,
            rankings: self.registry.rankings(),
        }
    }
}

/// Run every source on the blocking pool and collect findings in source
/// order. A panicking source contributes nothing; opportunities that are
/// malformed or carry another source's id are dropped.
///
/// Each source stays in `in_flight` until its task ends, even if this
/// future is dropped first.
async fn analyze(
    sources: Vec<Arc<dyn OpportunitySource>>,
    snapshot: Arc<Snapshot>,
    cycle: u64,
    in_flight: &InFlight,
) -> Analysis {
    let tasks: Vec<_> = sources
        .iter()
        .map(|source| {
            let source = Arc::clone(source);
            let snapshot = Arc::clone(&snapshot);
            let guard = in_flight.start(source.id());
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                source.analyze(&snapshot)
            })
        })
        .collect();
    let results = join_all(tasks).await;

    sources
        .into_iter()
        .zip(results)
        .map(|(source, result)| {
            let opportunities = match result {
                Ok(found) => found
                    .into_iter()
                    .filter(|o| {
                        let keep = o.is_well_formed() && o.source_id == source.id();
                        if !keep {
                            warn!(
                                cycle,
                                source = %source.id(),
                                reported_by = %o.source_id,
                                confidence = %o.confidence,
                                profit = %o.estimated_profit_fraction,
                                "Dropping malformed opportunity"
                            );
                        }
                        keep
                    })
                    .collect(),
                Err(e) => {
                    error!(cycle, source = %source.id(), error = %e, "Source failed during analysis, contribution dropped");
                    Vec::new()
                }
            };
            (source, opportunities)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::execution::{MockExecutionVenue, PaperVenue, VenueError};
    use crate::engine::scheduler::{ManualClock, ManualTicker};
    use crate::engine::telemetry::MemoryTelemetry;
    use crate::strategy::OpportunityKind;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    // =========================================================================
    // Fixtures
    // =========================================================================

    struct FixedSource {
        id: &'static str,
        min_confidence: Decimal,
        found: Vec<(Decimal, Decimal)>,
    }

    impl OpportunitySource for FixedSource {
        fn id(&self) -> &str {
            self.id
        }

        fn kind(&self) -> OpportunityKind {
            OpportunityKind::Custom("fixed".into())
        }

        fn min_confidence(&self) -> Decimal {
            self.min_confidence
        }

        fn analyze(&self, _snapshot: &Snapshot) -> Vec<Opportunity> {
            self.found
                .iter()
                .map(|(profit, confidence)| {
                    Opportunity::new(self.id, self.kind(), *profit, *confidence, json!({"from": self.id}))
                })
                .collect()
        }
    }

    struct PanickingSource;

    impl OpportunitySource for PanickingSource {
        fn id(&self) -> &str {
            "panicky"
        }

        fn kind(&self) -> OpportunityKind {
            OpportunityKind::Custom("panicky".into())
        }

        fn min_confidence(&self) -> Decimal {
            Decimal::ZERO
        }

        fn analyze(&self, _snapshot: &Snapshot) -> Vec<Opportunity> {
            panic!("malformed snapshot");
        }
    }

    /// Blocks its worker on the first call only.
    struct SlowOnceSource {
        delay: Duration,
        slept: AtomicBool,
    }

    impl SlowOnceSource {
        fn built(delay: Duration) -> BuiltSource {
            BuiltSource {
                source: Arc::new(Self {
                    delay,
                    slept: AtomicBool::new(false),
                }),
                initial_rank: dec!(10),
            }
        }
    }

    impl OpportunitySource for SlowOnceSource {
        fn id(&self) -> &str {
            "slow"
        }

        fn kind(&self) -> OpportunityKind {
            OpportunityKind::Custom("slow".into())
        }

        fn min_confidence(&self) -> Decimal {
            dec!(0.5)
        }

        fn analyze(&self, _snapshot: &Snapshot) -> Vec<Opportunity> {
            if !self.slept.swap(true, Ordering::SeqCst) {
                std::thread::sleep(self.delay);
            }
            vec![Opportunity::new("slow", self.kind(), dec!(0.04), dec!(0.9), json!({}))]
        }
    }

    /// Hangs on the first fetch, then answers immediately.
    struct StallingFeed {
        stall: Duration,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl SnapshotFeed for StallingFeed {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn fetch(&self) -> anyhow::Result<Snapshot> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(self.stall).await;
            }
            Ok(Snapshot::empty())
        }
    }

    /// Serves queued results, then empty snapshots.
    #[derive(Default)]
    struct ScriptedFeed {
        queue: Mutex<VecDeque<anyhow::Result<Snapshot>>>,
    }

    impl ScriptedFeed {
        fn with(results: Vec<anyhow::Result<Snapshot>>) -> Self {
            Self {
                queue: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl SnapshotFeed for ScriptedFeed {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self) -> anyhow::Result<Snapshot> {
            let next = self.queue.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(Snapshot::empty()))
        }
    }

    fn fixed(id: &'static str, profit: Decimal, confidence: Decimal) -> BuiltSource {
        BuiltSource {
            source: Arc::new(FixedSource {
                id,
                min_confidence: dec!(0.5),
                found: vec![(profit, confidence)],
            }),
            initial_rank: dec!(10),
        }
    }

    fn config(max_concurrent: usize, allocations: &[(&str, Decimal)]) -> Config {
        let mut config = Config::default();
        config.engine.total_capital = dec!(100000);
        config.risk.max_concurrent_positions = max_concurrent;
        config.allocation.percentages = allocations
            .iter()
            .map(|(id, share)| (id.to_string(), *share))
            .collect();
        config
    }

    fn quiet_venue() -> Box<PaperVenue> {
        Box::new(PaperVenue::new(1).with_volatility(Decimal::ZERO))
    }

    fn build(
        config: &Config,
        sources: Vec<BuiltSource>,
        venue: Box<dyn ExecutionVenue>,
        telemetry: &MemoryTelemetry,
    ) -> Orchestrator {
        Orchestrator::from_config(
            config,
            sources,
            Box::new(ScriptedFeed::default()),
            venue,
            Box::new(telemetry.clone()),
        )
        .unwrap()
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {other:?}"),
        }
    }

    // =========================================================================
    // Prioritization and execution
    // =========================================================================

    #[tokio::test]
    async fn test_higher_priority_wins_single_slot() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[("a", dec!(0.6)), ("b", dec!(0.4))]);
        let sources = vec![fixed("a", dec!(0.02), dec!(0.8)), fixed("b", dec!(0.05), dec!(0.9))];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);

        let report = completed(orchestrator.run_cycle().await.unwrap());

        assert_eq!(report.positions_opened, 1);
        assert_eq!(report.opportunities_found, 2);
        let open: Vec<&Position> = orchestrator.portfolio().positions().collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].source_id, "b");
        // 40% allocation x 10% max position, not the allocation itself
        assert_eq!(open[0].capital_committed, dec!(4000));
        assert_eq!(orchestrator.portfolio().exposure_fraction(), dec!(0.04));
        assert_eq!(report.exposure_fraction, dec!(0.04));
        // The scan stopped at the limit; A was never sent to the governor
        assert_eq!(report.rejection_count(RejectionReason::RejectedConcurrency), 0);
    }

    #[tokio::test]
    async fn test_equal_priorities_keep_discovery_order() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        let sources = vec![fixed("first", dec!(0.03), dec!(0.8)), fixed("second", dec!(0.03), dec!(0.8))];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);

        orchestrator.run_cycle().await.unwrap();
        let open: Vec<&Position> = orchestrator.portfolio().positions().collect();
        assert_eq!(open[0].source_id, "first");
    }

    #[tokio::test]
    async fn test_low_confidence_is_held() {
        let telemetry = MemoryTelemetry::new();
        let config = config(4, &[]);
        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.05), dec!(0.5))], quiet_venue(), &telemetry);

        // Confidence equal to the minimum is not enough
        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.positions_opened, 0);
        assert_eq!(report.rejection_count(RejectionReason::LowConfidence), 1);
        assert!(orchestrator.portfolio().is_empty());
    }

    #[tokio::test]
    async fn test_governor_rejections_are_reported() {
        let telemetry = MemoryTelemetry::new();
        let mut config = config(4, &[]);
        config.risk.stop_loss_fraction = dec!(0.10);
        config.risk.take_profit_fraction = dec!(0.15);
        config.risk.min_risk_reward_ratio = dec!(2.0);
        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.05), dec!(0.9))], quiet_venue(), &telemetry);

        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.rejection_count(RejectionReason::RejectedRiskReward), 1);
        assert!(orchestrator.portfolio().is_empty());
    }

    // =========================================================================
    // Isolation and skipped cycles
    // =========================================================================

    #[tokio::test]
    async fn test_panicking_source_is_isolated() {
        let telemetry = MemoryTelemetry::new();
        let config = config(4, &[]);
        let sources = vec![
            BuiltSource {
                source: Arc::new(PanickingSource),
                initial_rank: dec!(10),
            },
            fixed("b", dec!(0.05), dec!(0.9)),
        ];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);

        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.positions_opened, 1);
        assert_eq!(report.opportunities_found, 1);
        assert!(report.rank_per_source.contains_key("panicky"));
    }

    #[tokio::test]
    async fn test_malformed_opportunities_are_dropped() {
        let telemetry = MemoryTelemetry::new();
        let config = config(4, &[]);
        let source = BuiltSource {
            source: Arc::new(FixedSource {
                id: "a",
                min_confidence: dec!(0.5),
                found: vec![(dec!(0.05), dec!(1.5)), (dec!(-0.01), dec!(0.9)), (dec!(0.02), dec!(0.9))],
            }),
            initial_rank: dec!(10),
        };
        let mut orchestrator = build(&config, vec![source], quiet_venue(), &telemetry);

        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.opportunities_found, 1);
        assert_eq!(report.positions_opened, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_cycle() {
        let telemetry = MemoryTelemetry::new();
        let config = config(4, &[]);
        let feed = ScriptedFeed::with(vec![Err(anyhow::anyhow!("upstream 503")), Ok(Snapshot::empty())]);
        let mut orchestrator = Orchestrator::from_config(
            &config,
            vec![fixed("a", dec!(0.05), dec!(0.9))],
            Box::new(feed),
            quiet_venue(),
            Box::new(telemetry.clone()),
        )
        .unwrap();

        let outcome = orchestrator.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::FetchFailed(ref e)) if e.contains("upstream 503")));
        assert!(telemetry.is_empty());
        assert!(orchestrator.portfolio().is_empty());

        completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(telemetry.len(), 1);
        assert_eq!(orchestrator.summary().cycles_skipped, 1);
    }

    #[tokio::test]
    async fn test_oversized_profit_is_dropped_without_halting() {
        let telemetry = MemoryTelemetry::new();
        let config = config(4, &[]);
        let sources = vec![
            fixed("bad", dec!(1000000000000000000000000000), dec!(0.9)),
            fixed("good", dec!(0.05), dec!(0.9)),
        ];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);

        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.opportunities_found, 1);
        assert_eq!(report.positions_opened, 1);
        let open: Vec<&Position> = orchestrator.portfolio().positions().collect();
        assert_eq!(open[0].source_id, "good");

        assert_eq!(orchestrator.shut_down().await.unwrap(), 1);
        assert_eq!(orchestrator.registry().record("good").unwrap().total_trades, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_priority_drops_candidate() {
        let telemetry = MemoryTelemetry::new();
        let config = config(4, &[]);
        let huge = BuiltSource {
            source: Arc::new(FixedSource {
                id: "huge",
                min_confidence: dec!(0.5),
                found: vec![(dec!(0.05), dec!(0.9))],
            }),
            initial_rank: Decimal::MAX,
        };
        let sources = vec![huge, fixed("good", dec!(0.02), dec!(0.9))];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);

        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.opportunities_found, 2);
        assert_eq!(report.positions_opened, 1);
        let open: Vec<&Position> = orchestrator.portfolio().positions().collect();
        assert_eq!(open[0].source_id, "good");
        assert_eq!(report.rank_per_source["huge"], Decimal::MAX);
    }

    #[tokio::test]
    async fn test_fetch_deadline_skips_cycle() {
        let telemetry = MemoryTelemetry::new();
        let mut config = config(4, &[]);
        config.engine.cycle_deadline_ms = 200;
        let feed = StallingFeed {
            stall: Duration::from_secs(5),
            stalled: AtomicBool::new(false),
        };
        let mut orchestrator = Orchestrator::from_config(
            &config,
            vec![fixed("a", dec!(0.05), dec!(0.9))],
            Box::new(feed),
            quiet_venue(),
            Box::new(telemetry.clone()),
        )
        .unwrap();

        let outcome = orchestrator.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Skipped(SkipReason::DeadlineExceeded(CyclePhase::Fetching))
        );
        assert_eq!(orchestrator.phase(), CyclePhase::Idle);
        assert!(telemetry.is_empty());
        assert_eq!(orchestrator.summary().cycles_skipped, 1);

        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.positions_opened, 1);
        let summary = orchestrator.summary();
        assert_eq!(summary.cycles_skipped, 1);
        assert_eq!(summary.cycles_completed, 1);
    }

    #[tokio::test]
    async fn test_slow_source_overruns_deadline_and_sits_out_until_done() {
        let telemetry = MemoryTelemetry::new();
        let mut config = config(4, &[]);
        config.engine.cycle_deadline_ms = 200;
        let sources = vec![
            SlowOnceSource::built(Duration::from_millis(1500)),
            fixed("fast", dec!(0.05), dec!(0.9)),
        ];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);

        let outcome = orchestrator.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Skipped(SkipReason::DeadlineExceeded(CyclePhase::Analyzing))
        );
        assert!(orchestrator.portfolio().is_empty());
        assert!(telemetry.is_empty());

        // Still blocked on the first snapshot, so left out of this cycle
        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.opportunities_found, 1);
        let open: Vec<&Position> = orchestrator.portfolio().positions().collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].source_id, "fast");

        tokio::time::sleep(Duration::from_millis(2000)).await;
        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.opportunities_found, 2);
        assert_eq!(orchestrator.summary().cycles_skipped, 1);
    }

    // =========================================================================
    // Venue failures
    // =========================================================================

    #[tokio::test]
    async fn test_failed_open_discards_candidate() {
        let telemetry = MemoryTelemetry::new();
        let config = config(4, &[]);
        let mut venue = MockExecutionVenue::new();
        venue
            .expect_open()
            .times(1)
            .returning(|_| Err(VenueError::Unavailable("maintenance".into())));
        venue.expect_mark().never();

        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.05), dec!(0.9))], Box::new(venue), &telemetry);
        let report = completed(orchestrator.run_cycle().await.unwrap());

        assert_eq!(report.positions_opened, 0);
        assert!(orchestrator.portfolio().is_empty());
        assert_eq!(orchestrator.registry().record("a").unwrap().total_trades, 0);
    }

    #[tokio::test]
    async fn test_failed_mark_keeps_position() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        let mut venue = MockExecutionVenue::new();
        venue.expect_open().returning(|_| Ok(()));
        venue
            .expect_mark()
            .returning(|_, _| Err(VenueError::Timeout(Duration::from_secs(2))));
        venue.expect_close().returning(|_, _| Ok(()));

        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.05), dec!(0.9))], Box::new(venue), &telemetry);
        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.active_position_count, 1);
        assert_eq!(report.positions_closed, 0);

        // Shutdown still closes it, at entry value
        assert_eq!(orchestrator.shut_down().await.unwrap(), 1);
        let record = orchestrator.registry().record("a").unwrap();
        assert_eq!(record.total_trades, 1);
        assert_eq!(record.winning_trades, 0);
        assert_eq!(record.cumulative_profit, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_failed_close_retries_next_cycle() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        let mut venue = MockExecutionVenue::new();
        venue.expect_open().returning(|_| Ok(()));
        venue
            .expect_mark()
            .returning(|_, _| Ok(PositionMark::open(dec!(0.06))));
        let mut seq = mockall::Sequence::new();
        venue
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(VenueError::Unavailable("busy".into())));
        venue
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.05), dec!(0.9))], Box::new(venue), &telemetry);

        let first = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(first.positions_closed, 0);
        assert_eq!(first.active_position_count, 1);

        let second = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(second.positions_closed, 1);
        assert_eq!(orchestrator.registry().record("a").unwrap().winning_trades, 1);
    }

    // =========================================================================
    // Position management
    // =========================================================================

    #[tokio::test]
    async fn test_take_profit_records_one_outcome() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        // Quiet paper venue drifts a quarter of the expected profit per mark
        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.20), dec!(0.9))], quiet_venue(), &telemetry);

        let report = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(report.positions_opened, 1);
        assert_eq!(report.positions_closed, 1);

        let record = orchestrator.registry().record("a").unwrap();
        assert_eq!(record.total_trades, 1);
        assert_eq!(record.winning_trades, 1);
        // 100k x 10% committed, closed at +5%
        assert_eq!(record.cumulative_profit, dec!(500));
        assert_eq!(report.total_profit, dec!(500));
        assert_eq!(report.win_rate_per_source["a"], Decimal::ONE);
    }

    #[tokio::test]
    async fn test_stop_loss_and_external_close() {
        let telemetry = MemoryTelemetry::new();
        let config = config(2, &[]);
        let mut venue = MockExecutionVenue::new();
        venue.expect_open().returning(|_| Ok(()));
        venue.expect_mark().returning(|position, _| {
            if position.source_id == "a" {
                Ok(PositionMark::open(dec!(-0.03)))
            } else {
                Ok(PositionMark {
                    return_fraction: dec!(0.01),
                    closed_externally: true,
                })
            }
        });
        venue.expect_close().returning(|_, _| Ok(()));

        let sources = vec![fixed("a", dec!(0.05), dec!(0.9)), fixed("b", dec!(0.04), dec!(0.9))];
        let mut orchestrator = build(&config, sources, Box::new(venue), &telemetry);
        let report = completed(orchestrator.run_cycle().await.unwrap());

        assert_eq!(report.positions_closed, 2);
        let a = orchestrator.registry().record("a").unwrap();
        assert_eq!((a.total_trades, a.winning_trades), (1, 0));
        let b = orchestrator.registry().record("b").unwrap();
        assert_eq!((b.total_trades, b.winning_trades), (1, 1));
    }

    #[tokio::test]
    async fn test_old_positions_expire() {
        let telemetry = MemoryTelemetry::new();
        let mut config = config(1, &[]);
        config.risk.max_position_age_secs = Some(30);
        let clock = ManualClock::new(Utc::now());
        let mut orchestrator =
            build(&config, vec![fixed("a", dec!(0.04), dec!(0.9))], quiet_venue(), &telemetry).with_clock(clock.clone());

        let first = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(first.positions_closed, 0);

        clock.advance(Duration::from_secs(31));
        let second = completed(orchestrator.run_cycle().await.unwrap());
        assert_eq!(second.positions_closed, 1);
        assert_eq!(second.positions_opened, 0);
    }

    // =========================================================================
    // Run control and shutdown
    // =========================================================================

    #[tokio::test]
    async fn test_run_force_closes_on_exit() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.04), dec!(0.9))], quiet_venue(), &telemetry);

        let summary = orchestrator
            .run(RunLimit::cycles(1), &mut ManualTicker::new())
            .await
            .unwrap();

        assert_eq!(summary.cycles_completed, 1);
        assert_eq!(summary.positions_opened, 1);
        assert_eq!(summary.forced_closes, 1);
        assert_eq!(summary.positions_closed, 1);
        assert!(orchestrator.portfolio().is_empty());
        assert_eq!(orchestrator.phase(), CyclePhase::ShuttingDown);
        // Exactly one ledger update for the one position
        assert_eq!(orchestrator.registry().record("a").unwrap().total_trades, 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_runs_nothing() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        let shutdown = ShutdownSignal::new();
        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.04), dec!(0.9))], quiet_venue(), &telemetry)
            .with_shutdown(shutdown.clone());

        shutdown.trigger();
        let summary = orchestrator
            .run(RunLimit::unbounded(), &mut ManualTicker::new())
            .await
            .unwrap();
        assert_eq!(summary.cycles_completed, 0);
        assert!(telemetry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_between_phases_interrupts_cycle() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        let mut orchestrator = build(&config, vec![fixed("a", dec!(0.04), dec!(0.9))], quiet_venue(), &telemetry);
        orchestrator.run_cycle().await.unwrap();
        assert_eq!(orchestrator.portfolio().len(), 1);

        orchestrator.shutdown_signal().trigger();
        let outcome = orchestrator.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Interrupted { before: CyclePhase::Fetching });

        assert_eq!(orchestrator.shut_down().await.unwrap(), 1);
        assert!(orchestrator.portfolio().is_empty());
        assert_eq!(orchestrator.registry().record("a").unwrap().total_trades, 1);
    }

    #[tokio::test]
    async fn test_duration_limit_uses_clock() {
        let telemetry = MemoryTelemetry::new();
        let config = config(1, &[]);
        let clock = ManualClock::new(Utc::now());
        let mut ticker = ManualTicker::advancing(clock.clone(), Duration::from_secs(10));
        let mut orchestrator =
            build(&config, vec![fixed("a", dec!(0.04), dec!(0.9))], quiet_venue(), &telemetry).with_clock(clock);

        let summary = orchestrator
            .run(RunLimit::duration(Duration::from_secs(25)), &mut ticker)
            .await
            .unwrap();
        // Limit checked at 0s, 0s, 10s, 20s, then 30s stops
        assert_eq!(summary.cycles_completed, 4);
        assert_eq!(telemetry.len(), 4);
    }

    #[tokio::test]
    async fn test_rankings_stable_without_new_outcomes() {
        let telemetry = MemoryTelemetry::new();
        let config = config(2, &[]);
        let sources = vec![fixed("a", dec!(0.04), dec!(0.9)), fixed("b", dec!(0.02), dec!(0.9))];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);
        orchestrator.run(RunLimit::cycles(3), &mut ManualTicker::new()).await.unwrap();

        let first = orchestrator.registry_mut().recompute_rankings();
        let before = orchestrator.registry().rankings();
        orchestrator.registry_mut().recompute_rankings();
        assert!(first.is_empty());
        assert_eq!(orchestrator.registry().rankings(), before);
    }

    #[tokio::test]
    async fn test_rank_rebalance_keeps_budget() {
        let telemetry = MemoryTelemetry::new();
        let mut config = config(2, &[("a", dec!(0.5)), ("b", dec!(0.3))]);
        config.allocation.rebalance_every_cycles = Some(1);
        let sources = vec![fixed("a", dec!(0.04), dec!(0.9)), fixed("b", dec!(0.02), dec!(0.9))];
        let mut orchestrator = build(&config, sources, quiet_venue(), &telemetry);

        completed(orchestrator.run_cycle().await.unwrap());
        let allocation = orchestrator.allocation();
        assert!(allocation.total_fraction() <= dec!(0.8));
        // a reported the better opportunity, so it now ranks higher
        assert!(allocation.share("a") > allocation.share("b"));
    }

    #[test]
    fn test_invalid_config_refuses_to_start() {
        let mut config = config(1, &[("a", dec!(0.7)), ("b", dec!(0.5))]);
        config.engine.total_capital = dec!(1000);
        let result = Orchestrator::from_config(
            &config,
            vec![fixed("a", dec!(0.04), dec!(0.9)), fixed("b", dec!(0.04), dec!(0.9))],
            Box::new(ScriptedFeed::default()),
            quiet_venue(),
            Box::new(MemoryTelemetry::new()),
        );
        let err = result.err().unwrap();
        assert_eq!(err.invariant_name(), Some("allocation_sum_le_one"));
    }

    #[test]
    fn test_duplicate_sources_refuse_to_start() {
        let result = Orchestrator::from_config(
            &config(1, &[]),
            vec![fixed("a", dec!(0.04), dec!(0.9)), fixed("a", dec!(0.04), dec!(0.9))],
            Box::new(ScriptedFeed::default()),
            quiet_venue(),
            Box::new(MemoryTelemetry::new()),
        );
        assert_eq!(result.err().unwrap(), EngineError::DuplicateSource("a".into()));
    }
}
