//! Capital allocation across opportunity sources.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::registry::Registry;
use crate::error::{EngineError, Result};

/// Share of total capital assigned to each source.
///
/// Shares are fractions of `total_capital` and never sum above 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalAllocation {
    total_capital: Decimal,
    shares: BTreeMap<String, Decimal>,
}

impl CapitalAllocation {
    /// Build from configured percentages.
    ///
    /// An empty configuration splits capital equally across `source_ids`.
    /// Registered sources missing from a non-empty configuration get nothing;
    /// configured ids that are not registered are ignored.
    pub fn new(
        total_capital: Decimal,
        percentages: &BTreeMap<String, Decimal>,
        source_ids: &[String],
    ) -> Result<Self> {
        if total_capital <= Decimal::ZERO {
            return Err(EngineError::invariant(
                "total_capital_positive",
                format!("total_capital is {total_capital}"),
            ));
        }

        let shares = if percentages.is_empty() {
            equal_split(source_ids)
        } else {
            resolve_shares(percentages, source_ids)?
        };

        debug!(%total_capital, ?shares, "Capital allocation");
        Ok(Self {
            total_capital,
            shares,
        })
    }

    pub fn total_capital(&self) -> Decimal {
        self.total_capital
    }

    /// Fraction of total capital assigned to a source (0 if unknown).
    pub fn share(&self, source_id: &str) -> Decimal {
        self.shares.get(source_id).copied().unwrap_or(Decimal::ZERO)
    }

    /// Capital assigned to a source.
    pub fn allocated_capital(&self, source_id: &str) -> Decimal {
        self.total_capital * self.share(source_id)
    }

    /// Sum of all shares.
    pub fn total_fraction(&self) -> Decimal {
        self.shares.values().copied().sum()
    }

    pub fn shares(&self) -> &BTreeMap<String, Decimal> {
        &self.shares
    }

    /// Replace the shares, validated the same way as at startup.
    pub fn rebalance(&mut self, percentages: &BTreeMap<String, Decimal>) -> Result<()> {
        let source_ids: Vec<String> = self.shares.keys().cloned().collect();
        self.shares = resolve_shares(percentages, &source_ids)?;
        info!(shares = ?self.shares, "Rebalanced allocation");
        Ok(())
    }

    /// Redistribute `budget` (a fraction of total capital) across enabled
    /// sources in proportion to their positive rank scores.
    ///
    /// Falls back to an equal split among enabled sources when no rank is
    /// positive. Disabled sources get nothing.
    pub fn rebalance_by_rank(&mut self, registry: &Registry, budget: Decimal) -> Result<()> {
        check_share("budget", budget)?;

        let mut enabled: Vec<(String, Decimal)> = registry
            .rankings()
            .into_iter()
            .filter(|r| r.enabled)
            .map(|r| (r.source_id, r.rank_score.max(Decimal::ZERO)))
            .collect();

        let mut shares: BTreeMap<String, Decimal> =
            self.shares.keys().map(|id| (id.clone(), Decimal::ZERO)).collect();
        let total_rank = match enabled.iter().try_fold(Decimal::ZERO, |sum, (_, rank)| sum.checked_add(*rank)) {
            Some(total) => total,
            None => {
                // Only proportions matter; shrink ranks until their sum fits
                let divisor = Decimal::from(enabled.len() + 1);
                for (_, rank) in enabled.iter_mut() {
                    *rank /= divisor;
                }
                enabled.iter().map(|(_, rank)| *rank).sum()
            }
        };

        if !enabled.is_empty() {
            let count = Decimal::from(enabled.len());
            for (id, rank) in &enabled {
                let share = if total_rank > Decimal::ZERO {
                    budget * *rank / total_rank
                } else {
                    budget / count
                };
                // Round down so rounding never pushes the sum over budget
                shares.insert(id.clone(), share.round_dp_with_strategy(8, RoundingStrategy::ToZero));
            }
        }

        let sum: Decimal = shares.values().copied().sum();
        if sum > Decimal::ONE {
            return Err(EngineError::invariant(
                "allocation_sum_le_one",
                format!("rank rebalance produced {sum}"),
            ));
        }

        info!(shares = ?shares, "Rebalanced allocation by rank");
        self.shares = shares;
        Ok(())
    }
}

fn equal_split(source_ids: &[String]) -> BTreeMap<String, Decimal> {
    if source_ids.is_empty() {
        return BTreeMap::new();
    }
    let share = (Decimal::ONE / Decimal::from(source_ids.len()))
        .round_dp_with_strategy(8, RoundingStrategy::ToZero);
    source_ids.iter().map(|id| (id.clone(), share)).collect()
}

fn check_share(source_id: &str, share: Decimal) -> Result<()> {
    if share < Decimal::ZERO || share > Decimal::ONE {
        return Err(EngineError::invariant(
            "allocation_sum_le_one",
            format!("allocation for '{source_id}' is {share}"),
        ));
    }
    Ok(())
}

fn resolve_shares(
    percentages: &BTreeMap<String, Decimal>,
    source_ids: &[String],
) -> Result<BTreeMap<String, Decimal>> {
    let mut sum = Decimal::ZERO;
    for (id, share) in percentages {
        check_share(id, *share)?;
        sum += *share;
    }
    if sum > Decimal::ONE {
        return Err(EngineError::invariant(
            "allocation_sum_le_one",
            format!("allocations sum to {sum}"),
        ));
    }

    for id in percentages.keys() {
        if !source_ids.contains(id) {
            warn!(source = %id, "Allocation configured for unregistered source, ignoring");
        }
    }

    Ok(source_ids
        .iter()
        .map(|id| {
            let share = percentages.get(id).copied().unwrap_or_else(|| {
                warn!(source = %id, "No allocation configured, source gets no capital");
                Decimal::ZERO
            });
            (id.clone(), share)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RankingConfig;
    use crate::feed::Snapshot;
    use crate::strategy::{Opportunity, OpportunityKind, OpportunitySource};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::Arc;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn percentages(pairs: &[(&str, Decimal)]) -> BTreeMap<String, Decimal> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_configured_split() {
        let allocation = CapitalAllocation::new(
            dec!(100000),
            &percentages(&[("a", dec!(0.6)), ("b", dec!(0.4))]),
            &ids(&["a", "b"]),
        )
        .unwrap();

        assert_eq!(allocation.allocated_capital("a"), dec!(60000));
        assert_eq!(allocation.allocated_capital("b"), dec!(40000));
        assert_eq!(allocation.total_fraction(), Decimal::ONE);
    }

    #[test]
    fn test_empty_config_splits_equally() {
        let allocation =
            CapitalAllocation::new(dec!(90000), &BTreeMap::new(), &ids(&["a", "b", "c"])).unwrap();
        assert_eq!(allocation.share("a"), allocation.share("c"));
        assert!(allocation.total_fraction() <= Decimal::ONE);
        assert_eq!(allocation.allocated_capital("b").round_dp(2), dec!(30000));
    }

    #[test]
    fn test_missing_source_gets_zero() {
        let allocation = CapitalAllocation::new(
            dec!(1000),
            &percentages(&[("a", dec!(0.5))]),
            &ids(&["a", "b"]),
        )
        .unwrap();
        assert_eq!(allocation.allocated_capital("b"), Decimal::ZERO);
        assert_eq!(allocation.allocated_capital("unknown"), Decimal::ZERO);
    }

    #[test]
    fn test_sum_above_one_is_fatal() {
        let err = CapitalAllocation::new(
            dec!(1000),
            &percentages(&[("a", dec!(0.7)), ("b", dec!(0.5))]),
            &ids(&["a", "b"]),
        )
        .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("allocation_sum_le_one"));
    }

    #[test]
    fn test_rebalance_validates() {
        let mut allocation = CapitalAllocation::new(
            dec!(1000),
            &percentages(&[("a", dec!(0.5)), ("b", dec!(0.5))]),
            &ids(&["a", "b"]),
        )
        .unwrap();

        assert!(allocation
            .rebalance(&percentages(&[("a", dec!(0.9)), ("b", dec!(0.2))]))
            .is_err());
        assert_eq!(allocation.share("a"), dec!(0.5));

        allocation
            .rebalance(&percentages(&[("a", dec!(0.2)), ("b", dec!(0.3))]))
            .unwrap();
        assert_eq!(allocation.allocated_capital("b"), dec!(300));
    }

    struct Named(&'static str);

    impl OpportunitySource for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn kind(&self) -> OpportunityKind {
            OpportunityKind::Custom(self.0.into())
        }

        fn min_confidence(&self) -> Decimal {
            dec!(0.5)
        }

        fn analyze(&self, _snapshot: &Snapshot) -> Vec<Opportunity> {
            Vec::new()
        }
    }

    #[test]
    fn test_rebalance_by_rank_is_proportional() {
        let mut registry = Registry::new(RankingConfig::default());
        registry.register(Arc::new(Named("a")), dec!(30)).unwrap();
        registry.register(Arc::new(Named("b")), dec!(10)).unwrap();
        registry.register(Arc::new(Named("c")), dec!(10)).unwrap();
        registry
            .note_opportunities(
                "b",
                &[Opportunity::new("b", OpportunityKind::Custom("b".into()), dec!(0.1), dec!(0.9), json!({}))],
            )
            .unwrap();
        registry.recompute_rankings();
        registry.set_enabled("c", false).unwrap();

        let mut allocation =
            CapitalAllocation::new(dec!(1000), &BTreeMap::new(), &ids(&["a", "b", "c"])).unwrap();
        allocation.rebalance_by_rank(&registry, dec!(0.8)).unwrap();

        // a: 30, b: 10 + 100 * 0.1 = 20
        assert_eq!(allocation.share("a"), dec!(0.48));
        assert_eq!(allocation.share("b"), dec!(0.32));
        assert_eq!(allocation.share("c"), Decimal::ZERO);
        assert!(allocation.total_fraction() <= dec!(0.8));
    }

    #[test]
    fn test_rebalance_by_rank_with_huge_ranks() {
        let mut registry = Registry::new(RankingConfig::default());
        registry.register(Arc::new(Named("a")), Decimal::MAX).unwrap();
        registry.register(Arc::new(Named("b")), Decimal::MAX).unwrap();

        let mut allocation = CapitalAllocation::new(dec!(1000), &BTreeMap::new(), &ids(&["a", "b"])).unwrap();
        allocation.rebalance_by_rank(&registry, dec!(0.8)).unwrap();

        for id in ["a", "b"] {
            let share = allocation.share(id);
            assert!(share > dec!(0.3999) && share <= dec!(0.4), "{id} got {share}");
        }
        assert!(allocation.total_fraction() <= dec!(0.8));
    }
}
