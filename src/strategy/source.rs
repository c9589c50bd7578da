//! The opportunity-source interface and the values it produces.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::feed::Snapshot;

/// Family of an opportunity, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    DexArbitrage,
    CrossChainArbitrage,
    Liquidation,
    StatisticalArbitrage,
    YieldOptimization,
    Custom(String),
}

impl fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpportunityKind::DexArbitrage => f.write_str("dex_arbitrage"),
            OpportunityKind::CrossChainArbitrage => f.write_str("cross_chain_arbitrage"),
            OpportunityKind::Liquidation => f.write_str("liquidation"),
            OpportunityKind::StatisticalArbitrage => f.write_str("statistical_arbitrage"),
            OpportunityKind::YieldOptimization => f.write_str("yield_optimization"),
            OpportunityKind::Custom(name) => f.write_str(name),
        }
    }
}

/// A candidate action found in one snapshot.
///
/// Lives for a single cycle; only the `raw_context` survives, copied into the
/// position it turns into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub source_id: String,
    pub kind: OpportunityKind,
    /// Expected return on committed capital (0.02 = 2%)
    pub estimated_profit_fraction: Decimal,
    /// Source's confidence in the estimate, 0.0-1.0
    pub confidence: Decimal,
    /// Source-specific details (venues, assets, scores)
    pub raw_context: Value,
}

impl Opportunity {
    /// Largest return a source may claim (1000%). Anything above it is
    /// treated as a broken estimate.
    pub const MAX_PROFIT_FRACTION: Decimal = Decimal::TEN;

    pub fn new(
        source_id: impl Into<String>,
        kind: OpportunityKind,
        estimated_profit_fraction: Decimal,
        confidence: Decimal,
        raw_context: Value,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            estimated_profit_fraction,
            confidence,
            raw_context,
        }
    }

    /// Confidence in [0, 1] and a profit estimate in [0, `MAX_PROFIT_FRACTION`].
    pub fn is_well_formed(&self) -> bool {
        self.confidence >= Decimal::ZERO
            && self.confidence <= Decimal::ONE
            && self.estimated_profit_fraction >= Decimal::ZERO
            && self.estimated_profit_fraction <= Self::MAX_PROFIT_FRACTION
    }
}

/// Execution decision for an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Execute,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub confidence: Decimal,
}

impl Signal {
    pub fn is_execute(&self) -> bool {
        self.action == SignalAction::Execute
    }
}

/// A pluggable analysis policy.
///
/// `analyze` must depend only on the snapshot and the source's own
/// configuration, and must never panic on missing or malformed fields:
/// whatever cannot be read yields no opportunity.
pub trait OpportunitySource: Send + Sync {
    /// Unique id, also the key for allocation and performance records.
    fn id(&self) -> &str;

    fn kind(&self) -> OpportunityKind;

    /// Confidence an opportunity must exceed to be executed.
    fn min_confidence(&self) -> Decimal;

    fn analyze(&self, snapshot: &Snapshot) -> Vec<Opportunity>;

    /// Turn an opportunity into a decision. Executes only when the
    /// confidence is strictly above [`OpportunitySource::min_confidence`].
    fn signal(&self, opportunity: &Opportunity) -> Signal {
        let action = if opportunity.confidence > self.min_confidence() {
            SignalAction::Execute
        } else {
            SignalAction::Hold
        };
        Signal {
            action,
            confidence: opportunity.confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Fixed;

    impl OpportunitySource for Fixed {
        fn id(&self) -> &str {
            "fixed"
        }

        fn kind(&self) -> OpportunityKind {
            OpportunityKind::Custom("fixed".into())
        }

        fn min_confidence(&self) -> Decimal {
            dec!(0.6)
        }

        fn analyze(&self, _snapshot: &Snapshot) -> Vec<Opportunity> {
            Vec::new()
        }
    }

    fn opportunity(confidence: Decimal) -> Opportunity {
        Opportunity::new("fixed", Fixed.kind(), dec!(0.01), confidence, json!({}))
    }

    #[test]
    fn test_signal_requires_strictly_greater_confidence() {
        assert_eq!(Fixed.signal(&opportunity(dec!(0.6))).action, SignalAction::Hold);
        assert_eq!(Fixed.signal(&opportunity(dec!(0.61))).action, SignalAction::Execute);
        assert_eq!(Fixed.signal(&opportunity(dec!(0.61))).confidence, dec!(0.61));
    }

    #[test]
    fn test_well_formed() {
        assert!(opportunity(dec!(0)).is_well_formed());
        assert!(opportunity(dec!(1)).is_well_formed());
        assert!(!opportunity(dec!(1.01)).is_well_formed());
        assert!(!opportunity(dec!(-0.1)).is_well_formed());

        let with_profit = |profit| Opportunity::new("fixed", Fixed.kind(), profit, dec!(0.9), json!({}));
        assert!(!with_profit(dec!(-0.01)).is_well_formed());
        assert!(with_profit(Opportunity::MAX_PROFIT_FRACTION).is_well_formed());
        assert!(!with_profit(dec!(10.01)).is_well_formed());
        assert!(!with_profit(dec!(1000000000000000000000000000)).is_well_formed());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(OpportunityKind::CrossChainArbitrage.to_string(), "cross_chain_arbitrage");
        assert_eq!(OpportunityKind::Custom("mine".into()).to_string(), "mine");
    }
}
