use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::model::{Category, PriorityTier};

/// Which priority tiers a plan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityFilter {
    #[default]
    All,
    /// Only calculators of exactly this tier.
    Exactly(PriorityTier),
    /// This tier and every more urgent one.
    AtOrAbove(PriorityTier),
}

impl PriorityFilter {
    pub fn admits(self, tier: PriorityTier) -> bool {
        match self {
            Self::All => true,
            Self::Exactly(wanted) => tier == wanted,
            Self::AtOrAbove(wanted) => tier.at_or_above(wanted),
        }
    }
}

impl std::fmt::Display for PriorityFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Exactly(tier) => write!(f, "{tier}"),
            Self::AtOrAbove(tier) => write!(f, ">={tier}"),
        }
    }
}

/// Parameters of one batch run. Treated as immutable once submitted.
#[derive(Debug, Clone)]
pub struct CalculationPlan {
    pub date: NaiveDate,
    /// `None` or empty means every known stock.
    pub stock_ids: Option<BTreeSet<String>>,
    pub priority: PriorityFilter,
    pub force_recalculate: bool,
    /// Restrict to these calculator names.
    pub calculators: Option<BTreeSet<String>>,
    /// Restrict to these categories.
    pub categories: Option<BTreeSet<Category>>,
}

impl CalculationPlan {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            stock_ids: None,
            priority: PriorityFilter::All,
            force_recalculate: false,
            calculators: None,
            categories: None,
        }
    }

    pub fn with_stocks<I, S>(mut self, stocks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stock_ids = Some(stocks.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_priority(mut self, priority: PriorityFilter) -> Self {
        self.priority = priority;
        self
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force_recalculate = force;
        self
    }

    pub fn only_calculators<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.calculators = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn only_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    /// Explicit stock scope, or `None` for the full universe.
    pub fn explicit_stocks(&self) -> Option<&BTreeSet<String>> {
        self.stock_ids.as_ref().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::date;

    #[test]
    fn exact_filter_admits_only_that_tier() {
        let filter = PriorityFilter::Exactly(PriorityTier::P0);
        assert!(filter.admits(PriorityTier::P0));
        assert!(!filter.admits(PriorityTier::P1));
        assert!(!filter.admits(PriorityTier::P2));
    }

    #[test]
    fn at_or_above_admits_more_urgent() {
        let filter = PriorityFilter::AtOrAbove(PriorityTier::P1);
        assert!(filter.admits(PriorityTier::P0));
        assert!(filter.admits(PriorityTier::P1));
        assert!(!filter.admits(PriorityTier::P2));
    }

    #[test]
    fn empty_stock_set_means_all() {
        let plan = CalculationPlan::for_date(date("2025-01-02")).with_stocks(Vec::<String>::new());
        assert!(plan.explicit_stocks().is_none());
        let plan = plan.with_stocks(["2330"]);
        assert_eq!(plan.explicit_stocks().map(|s| s.len()), Some(1));
    }
}
