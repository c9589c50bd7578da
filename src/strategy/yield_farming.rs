//! Yield optimization across lending and farming protocols.
//!
//! Reads `yield_protocols: [{name, apy, tvl, risk_score}]`. APY is discounted
//! by protocol risk and boosted by depth, then converted into the profit
//! expected over the configured holding period.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

use super::source::{Opportunity, OpportunityKind, OpportunitySource};
use crate::config::YieldConfig;
use crate::feed::snapshot::{number, text};
use crate::feed::Snapshot;
use crate::utils::clamp_unit;

const DEFAULT_RISK_SCORE: Decimal = dec!(0.5);

pub struct YieldOptimizerSource {
    id: String,
    config: YieldConfig,
}

impl YieldOptimizerSource {
    pub const ID: &'static str = "yield_optimizer";

    pub fn new(config: YieldConfig) -> Self {
        Self {
            id: Self::ID.to_string(),
            config,
        }
    }

    /// APY after up to 70% risk haircut, scaled by TVL (capped at 1.2x past $100M).
    /// `None` if the quoted APY is too large to scale.
    pub fn risk_adjusted_apy(apy: Decimal, risk_score: Decimal, tvl: Decimal) -> Option<Decimal> {
        let tvl_factor = (tvl / dec!(100000000)).min(dec!(1.2));
        apy.checked_mul(Decimal::ONE - risk_score * dec!(0.7))?
            .checked_mul(tvl_factor)
    }

    fn score(risk_adjusted_apy: Decimal, tvl: Decimal, risk_score: Decimal) -> Option<Decimal> {
        risk_adjusted_apy.checked_mul(dec!(60))?.checked_add(
            (Decimal::ONE - risk_score) * dec!(25) + (tvl / dec!(10000000)).min(Decimal::ONE) * dec!(15),
        )
    }

    fn evaluate(&self, protocol: &Value) -> Option<(Decimal, Opportunity)> {
        let name = text(protocol, "name")?;
        let apy = number(protocol, "apy")?;
        let tvl = number(protocol, "tvl").unwrap_or(Decimal::ZERO);
        let risk = number(protocol, "risk_score").unwrap_or(DEFAULT_RISK_SCORE);

        if apy < self.config.min_apy || risk > self.config.max_protocol_risk || risk < Decimal::ZERO {
            return None;
        }

        let adjusted = Self::risk_adjusted_apy(apy, risk, tvl)?;
        let horizon = Decimal::from(self.config.holding_period_days) / dec!(365);
        let profit = adjusted.checked_mul(horizon)?;
        if profit <= Decimal::ZERO {
            return None;
        }

        let score = Self::score(adjusted, tvl, risk)?;
        let context = json!({
            "protocol": name,
            "apy": apy,
            "risk_adjusted_apy": adjusted.round_dp(6),
            "tvl": tvl,
            "risk_score": risk,
            "score": score.round_dp(4),
        });
        Some((
            score,
            Opportunity::new(
                &self.id,
                OpportunityKind::YieldOptimization,
                profit,
                clamp_unit(score / dec!(50)),
                context,
            ),
        ))
    }
}

impl OpportunitySource for YieldOptimizerSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> OpportunityKind {
        OpportunityKind::YieldOptimization
    }

    fn min_confidence(&self) -> Decimal {
        self.config.min_confidence
    }

    fn analyze(&self, snapshot: &Snapshot) -> Vec<Opportunity> {
        let mut found: Vec<(Decimal, Opportunity)> = snapshot
            .array("yield_protocols")
            .iter()
            .filter_map(|p| self.evaluate(p))
            .collect();

        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, o)| o).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> YieldOptimizerSource {
        YieldOptimizerSource::new(YieldConfig::default())
    }

    #[test]
    fn test_risk_adjusted_apy() {
        // 20% APY, risk 0.5 -> 65% kept, $200M TVL -> 1.2x
        assert_eq!(
            YieldOptimizerSource::risk_adjusted_apy(dec!(0.20), dec!(0.5), dec!(200000000)),
            Some(dec!(0.156))
        );
        assert_eq!(
            YieldOptimizerSource::risk_adjusted_apy(Decimal::MAX, Decimal::ZERO, dec!(200000000)),
            None
        );
    }

    #[test]
    fn test_filters_and_ranks_protocols() {
        let snap = Snapshot::empty().with_field(
            "yield_protocols",
            json!([
                {"name": "LowApy", "apy": 0.05, "tvl": 500_000_000, "risk_score": 0.1},
                {"name": "Risky", "apy": 0.90, "tvl": 500_000_000, "risk_score": 0.8},
                {"name": "Solid", "apy": 0.25, "tvl": 300_000_000, "risk_score": 0.2},
                {"name": "Small", "apy": 0.30, "tvl": 2_000_000, "risk_score": 0.3},
            ]),
        );

        let found = source().analyze(&snap);
        let names: Vec<&str> = found
            .iter()
            .filter_map(|o| o.raw_context["protocol"].as_str())
            .collect();
        assert_eq!(names, vec!["Solid", "Small"]);

        let solid = &found[0];
        // 0.25 * 0.86 * 1.2 = 0.258 over 30 days
        assert_eq!(
            solid.estimated_profit_fraction.round_dp(8),
            (dec!(0.258) * dec!(30) / dec!(365)).round_dp(8)
        );
        assert!(solid.is_well_formed());
    }

    #[test]
    fn test_absurd_apy_skips_only_that_protocol() {
        let snap = Snapshot::empty().with_field(
            "yield_protocols",
            json!([
                {"name": "Absurd", "apy": "70000000000000000000000000000", "tvl": 500_000_000, "risk_score": 0.1},
                {"name": "Solid", "apy": 0.25, "tvl": 300_000_000, "risk_score": 0.2},
            ]),
        );

        let found = source().analyze(&snap);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw_context["protocol"], "Solid");
    }

    #[test]
    fn test_malformed_protocols_are_skipped() {
        let snap = Snapshot::empty().with_field(
            "yield_protocols",
            json!([{"apy": 0.4}, {"name": "NoApy"}, {"name": "Neg", "apy": 0.4, "risk_score": -1}, null]),
        );
        assert!(source().analyze(&snap).is_empty());
    }
}
