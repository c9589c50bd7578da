//! Open positions and the exposure they add up to.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::strategy::{Opportunity, OpportunityKind};
use crate::utils::safe_div;

/// A committed, capital-backed trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    /// `{source_id}-{opened_at millis}-{sequence}`
    pub id: String,
    pub source_id: String,
    pub kind: OpportunityKind,
    pub capital_committed: Decimal,
    /// Profit the source expected when it reported the opportunity
    pub expected_profit_fraction: Decimal,
    pub entry_context: Value,
    pub stop_loss_fraction: Decimal,
    pub take_profit_fraction: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Loss at or beyond the stop-loss bound.
    pub fn hits_stop_loss(&self, return_fraction: Decimal) -> bool {
        return_fraction <= -self.stop_loss_fraction
    }

    /// Gain at or beyond the take-profit bound.
    pub fn hits_take_profit(&self, return_fraction: Decimal) -> bool {
        return_fraction >= self.take_profit_fraction
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.opened_at).to_std().unwrap_or_default()
    }

    /// Clamp a mark to what a position can realise: at most a total loss,
    /// at most the largest profit an opportunity may claim.
    pub fn bounded_return(return_fraction: Decimal) -> Decimal {
        return_fraction.clamp(-Decimal::ONE, Opportunity::MAX_PROFIT_FRACTION)
    }

    /// Realised profit when closed at `return_fraction`.
    pub fn profit_at(&self, return_fraction: Decimal) -> Decimal {
        self.capital_committed
            .saturating_mul(Self::bounded_return(return_fraction))
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    /// The venue reported it closed
    External,
    /// Held longer than the configured maximum age
    Expired,
    /// Force-closed during shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::External => "external",
            Self::Expired => "expired",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Capital under management and the positions committed against it.
///
/// Positions are keyed by id; iteration order is by id.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioState {
    total_capital: Decimal,
    active_positions: BTreeMap<String, Position>,
}

impl PortfolioState {
    pub fn new(total_capital: Decimal) -> Self {
        Self {
            total_capital,
            active_positions: BTreeMap::new(),
        }
    }

    pub fn total_capital(&self) -> Decimal {
        self.total_capital
    }

    /// Sum of capital committed to open positions.
    pub fn committed_capital(&self) -> Decimal {
        self.active_positions.values().map(|p| p.capital_committed).sum()
    }

    /// Committed capital over total capital.
    pub fn exposure_fraction(&self) -> Decimal {
        safe_div(self.committed_capital(), self.total_capital)
    }

    /// Add a position. Ids must be unique.
    pub fn open(&mut self, position: Position) -> Result<()> {
        if self.active_positions.contains_key(&position.id) {
            return Err(EngineError::invariant(
                "position_id_unique",
                format!("position '{}' is already open", position.id),
            ));
        }
        self.active_positions.insert(position.id.clone(), position);
        Ok(())
    }

    /// Remove and return a position.
    pub fn close(&mut self, position_id: &str) -> Option<Position> {
        self.active_positions.remove(position_id)
    }

    pub fn get(&self, position_id: &str) -> Option<&Position> {
        self.active_positions.get(position_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.active_positions.values()
    }

    pub fn len(&self) -> usize {
        self.active_positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_positions.is_empty()
    }

    /// Fail if committed capital is over the ceiling.
    pub fn check_exposure(&self, max_exposure_fraction: Decimal) -> Result<()> {
        let exposure = self.exposure_fraction();
        if exposure > max_exposure_fraction {
            return Err(EngineError::invariant(
                "exposure_within_ceiling",
                format!("exposure {exposure} exceeds max {max_exposure_fraction}"),
            ));
        }
        Ok(())
    }
}
