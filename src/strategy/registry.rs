//! Source registry and per-source performance ledger.
//!
//! The registry owns every registered source together with its
//! [`PerformanceRecord`]. Rank scores are a pure function of the records:
//!
//! `rank = base_rank + profit_weight * best_recent_profit + win_rate_weight * win_rate`
//!
//! so identical histories always rank identically and recomputing without new
//! outcomes changes nothing.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::source::{Opportunity, OpportunitySource};
use crate::config::RankingConfig;
use crate::error::{EngineError, Result};
use crate::utils::safe_div;

/// Outcome history of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceRecord {
    pub base_rank: Decimal,
    pub total_trades: u64,
    pub winning_trades: u64,
    /// Net realized profit in capital units
    pub cumulative_profit: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    /// Highest profit fraction reported in the latest analysis (0 when none)
    pub best_recent_profit_fraction: Decimal,
    pub rank_score: Decimal,
    pub enabled: bool,
}

impl PerformanceRecord {
    fn new(base_rank: Decimal) -> Self {
        Self {
            base_rank,
            total_trades: 0,
            winning_trades: 0,
            cumulative_profit: Decimal::ZERO,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            best_recent_profit_fraction: Decimal::ZERO,
            rank_score: base_rank,
            enabled: true,
        }
    }

    /// Winning over total trades; 0 before the first trade.
    pub fn win_rate(&self) -> Decimal {
        if self.total_trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.winning_trades) / Decimal::from(self.total_trades)
    }

    /// Gross profit over gross loss; 0 without losses.
    pub fn profit_factor(&self) -> Decimal {
        safe_div(self.gross_profit, self.gross_loss)
    }
}

/// A source and its position in the ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    pub source_id: String,
    pub rank_score: Decimal,
    pub win_rate: Decimal,
    pub enabled: bool,
}

/// Aggregate figures across all sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySummary {
    pub sources: usize,
    pub enabled: usize,
    pub total_trades: u64,
    pub net_profit: Decimal,
    pub overall_win_rate: Decimal,
}

struct Entry {
    source: Arc<dyn OpportunitySource>,
    record: PerformanceRecord,
}

/// Registered sources in registration order.
pub struct Registry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    config: RankingConfig,
}

impl Registry {
    pub fn new(config: RankingConfig) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            config,
        }
    }

    /// Add a source with its starting rank.
    pub fn register(&mut self, source: Arc<dyn OpportunitySource>, initial_rank: Decimal) -> Result<()> {
        let id = source.id().to_string();
        if self.index.contains_key(&id) {
            return Err(EngineError::DuplicateSource(id));
        }

        debug!(source = %id, %initial_rank, "Registered source");
        self.index.insert(id, self.entries.len());
        self.entries.push(Entry {
            source,
            record: PerformanceRecord::new(initial_rank),
        });
        Ok(())
    }

    fn entry_mut(&mut self, source_id: &str) -> Result<&mut Entry> {
        let idx = *self
            .index
            .get(source_id)
            .ok_or_else(|| EngineError::UnknownSource(source_id.to_string()))?;
        Ok(&mut self.entries[idx])
    }

    fn entry(&self, source_id: &str) -> Option<&Entry> {
        self.index.get(source_id).map(|&idx| &self.entries[idx])
    }

    /// Record one closed position.
    pub fn record_outcome(&mut self, source_id: &str, profit: Decimal, won: bool) -> Result<()> {
        let record = &mut self.entry_mut(source_id)?.record;
        record.total_trades += 1;
        if won {
            record.winning_trades += 1;
        }
        record.cumulative_profit = record.cumulative_profit.saturating_add(profit);
        if profit > Decimal::ZERO {
            record.gross_profit = record.gross_profit.saturating_add(profit);
        } else {
            record.gross_loss = record.gross_loss.saturating_sub(profit);
        }
        Ok(())
    }

    /// Remember the best profit fraction a source reported this cycle.
    pub fn note_opportunities(&mut self, source_id: &str, opportunities: &[Opportunity]) -> Result<()> {
        let best = opportunities
            .iter()
            .map(|o| o.estimated_profit_fraction)
            .max()
            .unwrap_or(Decimal::ZERO);
        self.entry_mut(source_id)?.record.best_recent_profit_fraction = best;
        Ok(())
    }

    /// `None` if the weighted sum does not fit in a Decimal.
    fn rank_of(&self, record: &PerformanceRecord) -> Option<Decimal> {
        let profit_term = self.config.profit_weight.checked_mul(record.best_recent_profit_fraction)?;
        let win_rate_term = self.config.win_rate_weight.checked_mul(record.win_rate())?;
        record.base_rank.checked_add(profit_term)?.checked_add(win_rate_term)
    }

    /// Recompute every rank score and apply adaptive suppression.
    ///
    /// Returns the ids of sources disabled by this call.
    pub fn recompute_rankings(&mut self) -> Vec<String> {
        let scores: Vec<Option<Decimal>> = self.entries.iter().map(|e| self.rank_of(&e.record)).collect();
        let min_trades = self.config.disable_min_trades;
        let floor = self.config.disable_win_rate_floor;

        let mut disabled = Vec::new();
        for (entry, score) in self.entries.iter_mut().zip(scores) {
            let record = &mut entry.record;
            match score {
                Some(score) => record.rank_score = score,
                None => warn!(
                    source = %entry.source.id(),
                    best_recent = %record.best_recent_profit_fraction,
                    "Rank score out of range, keeping previous score"
                ),
            }

            if record.enabled && record.total_trades >= min_trades && record.win_rate() < floor {
                record.enabled = false;
                warn!(
                    source = %entry.source.id(),
                    win_rate = %record.win_rate(),
                    trades = record.total_trades,
                    %floor,
                    "Disabling underperforming source"
                );
                disabled.push(entry.source.id().to_string());
            }
        }
        disabled
    }

    /// Sources by rank score, highest first; ties by id.
    pub fn top_n(&self, n: usize) -> Vec<Ranking> {
        let mut rankings: Vec<Ranking> = self
            .entries
            .iter()
            .map(|e| Ranking {
                source_id: e.source.id().to_string(),
                rank_score: e.record.rank_score,
                win_rate: e.record.win_rate(),
                enabled: e.record.enabled,
            })
            .collect();
        rankings.sort_by(|a, b| {
            b.rank_score
                .cmp(&a.rank_score)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        rankings.truncate(n);
        rankings
    }

    /// Full ranking table.
    pub fn rankings(&self) -> Vec<Ranking> {
        self.top_n(self.entries.len())
    }

    /// Enabled sources to analyze this cycle, in registration order,
    /// limited to the top `max_active_sources` by rank when configured.
    pub fn active_sources(&self) -> Vec<Arc<dyn OpportunitySource>> {
        let enabled = self.entries.iter().filter(|e| e.record.enabled);

        match self.config.max_active_sources {
            None => enabled.map(|e| e.source.clone()).collect(),
            Some(limit) => {
                let allowed: Vec<String> = self
                    .rankings()
                    .into_iter()
                    .filter(|r| r.enabled)
                    .take(limit)
                    .map(|r| r.source_id)
                    .collect();
                enabled
                    .filter(|e| allowed.iter().any(|id| id == e.source.id()))
                    .map(|e| e.source.clone())
                    .collect()
            }
        }
    }

    pub fn source(&self, source_id: &str) -> Option<Arc<dyn OpportunitySource>> {
        self.entry(source_id).map(|e| e.source.clone())
    }

    pub fn record(&self, source_id: &str) -> Option<&PerformanceRecord> {
        self.entry(source_id).map(|e| &e.record)
    }

    pub fn rank_score(&self, source_id: &str) -> Option<Decimal> {
        self.record(source_id).map(|r| r.rank_score)
    }

    pub fn win_rate(&self, source_id: &str) -> Option<Decimal> {
        self.record(source_id).map(PerformanceRecord::win_rate)
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.index.contains_key(source_id)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.source.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear a source's history and re-enable it, keeping its base rank.
    pub fn reset(&mut self, source_id: &str) -> Result<()> {
        let entry = self.entry_mut(source_id)?;
        entry.record = PerformanceRecord::new(entry.record.base_rank);
        info!(source = %source_id, "Reset performance record");
        Ok(())
    }

    pub fn set_enabled(&mut self, source_id: &str, enabled: bool) -> Result<()> {
        self.entry_mut(source_id)?.record.enabled = enabled;
        Ok(())
    }

    pub fn summary(&self) -> RegistrySummary {
        let total_trades: u64 = self.entries.iter().map(|e| e.record.total_trades).sum();
        let winning: u64 = self.entries.iter().map(|e| e.record.winning_trades).sum();
        let net_profit: Decimal = self.entries.iter().map(|e| e.record.cumulative_profit).sum();

        RegistrySummary {
            sources: self.entries.len(),
            enabled: self.entries.iter().filter(|e| e.record.enabled).count(),
            total_trades,
            net_profit,
            overall_win_rate: safe_div(Decimal::from(winning), Decimal::from(total_trades)),
        }
    }
}
