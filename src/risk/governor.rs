//! Position sizing and admission control.
//!
//! The governor sizes a candidate from its source's allocation and admits it
//! only if the portfolio can carry it. Checks run in a fixed order:
//! - Concurrency (cheapest, before any sizing)
//! - Zero size (source has no allocation)
//! - Exposure ceiling
//! - Risk-reward ratio
//! - Per-trade loss budget (optional)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use super::portfolio::{PortfolioState, Position};
use crate::config::RiskConfig;
use crate::strategy::Opportunity;
use crate::utils::safe_div;

/// Static limits the governor enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_position_fraction: Decimal,
    pub max_exposure_fraction: Decimal,
    pub max_concurrent_positions: usize,
    pub min_risk_reward_ratio: Decimal,
    pub stop_loss_fraction: Decimal,
    pub take_profit_fraction: Decimal,
    pub max_loss_fraction_per_trade: Option<Decimal>,
}

impl From<&RiskConfig> for RiskLimits {
    fn from(config: &RiskConfig) -> Self {
        Self {
            max_position_fraction: config.max_position_fraction,
            max_exposure_fraction: config.max_exposure_fraction,
            max_concurrent_positions: config.max_concurrent_positions,
            min_risk_reward_ratio: config.min_risk_reward_ratio,
            stop_loss_fraction: config.stop_loss_fraction,
            take_profit_fraction: config.take_profit_fraction,
            max_loss_fraction_per_trade: config.max_loss_fraction_per_trade,
        }
    }
}

/// Why a candidate was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Source signalled HOLD
    LowConfidence,
    RejectedConcurrency,
    RejectedZeroSize,
    RejectedExposure,
    RejectedRiskReward,
    RejectedRiskBudget,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::RejectedConcurrency => "REJECTED_CONCURRENCY",
            Self::RejectedZeroSize => "REJECTED_ZERO_SIZE",
            Self::RejectedExposure => "REJECTED_EXPOSURE",
            Self::RejectedRiskReward => "REJECTED_RISK_REWARD",
            Self::RejectedRiskBudget => "REJECTED_RISK_BUDGET",
        };
        f.write_str(name)
    }
}

/// A declined candidate, logged for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RiskRejection {
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub reason: RejectionReason,
    pub detail: String,
    pub metrics: BTreeMap<String, Decimal>,
}

impl RiskRejection {
    pub fn new(source_id: &str, reason: RejectionReason, detail: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            source_id: source_id.to_string(),
            reason,
            detail,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: Decimal) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Emit as structured log for external parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        info!(target: "risk_rejection", "RISK_REJECTION: {}", json);
    }
}

/// Outcome of a governor check.
#[derive(Debug, Clone)]
pub enum RiskDecision {
    /// A fully specified position, not yet opened
    Accepted(Position),
    Rejected(RiskRejection),
}

impl RiskDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected(rejection) => Some(rejection.reason),
        }
    }
}

/// Sizes and admits candidate opportunities.
#[derive(Debug)]
pub struct RiskGovernor {
    limits: RiskLimits,
    sequence: u64,
}

impl RiskGovernor {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits, sequence: 0 }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Capital a position from this allocation would commit.
    pub fn position_size(&self, allocated_capital: Decimal) -> Decimal {
        allocated_capital * self.limits.max_position_fraction
    }

    /// Check a candidate against the portfolio.
    ///
    /// Rejections are emitted on the `risk_rejection` target. On acceptance
    /// the returned position carries a fresh id; the caller opens it.
    pub fn evaluate(
        &mut self,
        opportunity: &Opportunity,
        allocated_capital: Decimal,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        let decision = self.check(opportunity, allocated_capital, portfolio, now);
        match &decision {
            RiskDecision::Rejected(rejection) => rejection.emit(),
            RiskDecision::Accepted(position) => debug!(
                source = %position.source_id,
                position = %position.id,
                capital = %position.capital_committed,
                "Risk check passed"
            ),
        }
        decision
    }

    fn check(
        &mut self,
        opportunity: &Opportunity,
        allocated_capital: Decimal,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        let limits = &self.limits;
        let source_id = opportunity.source_id.as_str();
        let reject = |reason, detail: String| RiskRejection::new(source_id, reason, detail, now);

        if portfolio.len() >= limits.max_concurrent_positions {
            return RiskDecision::Rejected(
                reject(
                    RejectionReason::RejectedConcurrency,
                    format!("{} positions open, limit {}", portfolio.len(), limits.max_concurrent_positions),
                )
                .with_metric("active_positions", Decimal::from(portfolio.len())),
            );
        }

        let position_size = allocated_capital * limits.max_position_fraction;
        if position_size <= Decimal::ZERO {
            return RiskDecision::Rejected(reject(
                RejectionReason::RejectedZeroSize,
                format!("allocation {allocated_capital} yields no position"),
            ));
        }

        let total_capital = portfolio.total_capital();
        let projected = safe_div(portfolio.committed_capital() + position_size, total_capital);
        if projected > limits.max_exposure_fraction {
            return RiskDecision::Rejected(
                reject(
                    RejectionReason::RejectedExposure,
                    format!("exposure would reach {projected}, max {}", limits.max_exposure_fraction),
                )
                .with_metric("projected_exposure", projected)
                .with_metric("position_size", position_size),
            );
        }

        let risk_reward = safe_div(limits.take_profit_fraction, limits.stop_loss_fraction);
        if risk_reward < limits.min_risk_reward_ratio {
            return RiskDecision::Rejected(
                reject(
                    RejectionReason::RejectedRiskReward,
                    format!("risk-reward {risk_reward} below {}", limits.min_risk_reward_ratio),
                )
                .with_metric("risk_reward", risk_reward),
            );
        }

        if let Some(budget) = limits.max_loss_fraction_per_trade {
            let at_risk = safe_div(position_size * limits.stop_loss_fraction, total_capital);
            if at_risk > budget {
                return RiskDecision::Rejected(
                    reject(
                        RejectionReason::RejectedRiskBudget,
                        format!("trade risks {at_risk} of capital, budget {budget}"),
                    )
                    .with_metric("loss_at_stop", at_risk),
                );
            }
        }

        self.sequence += 1;
        RiskDecision::Accepted(Position {
            id: format!("{}-{}-{}", source_id, now.timestamp_millis(), self.sequence),
            source_id: source_id.to_string(),
            kind: opportunity.kind.clone(),
            capital_committed: position_size,
            expected_profit_fraction: opportunity.estimated_profit_fraction,
            entry_context: opportunity.raw_context.clone(),
            stop_loss_fraction: limits.stop_loss_fraction,
            take_profit_fraction: limits.take_profit_fraction,
            opened_at: now,
        })
    }
}
