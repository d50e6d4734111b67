use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use error_stack::{Report, bail};

use crate::calculator::{CalcParams, Calculator};
use crate::engine::plan::PriorityFilter;
use crate::error::RegistryError;
use crate::model::{Category, ChipRecord, Family, Observation, PriceBar, PriorityTier};
use crate::{chip, indicator, pattern};

/// Config-supplied settings for one calculator, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct CalculatorSettings {
    pub enabled: bool,
    pub params: CalcParams,
}

pub type Overrides = HashMap<String, CalculatorSettings>;

/// A registered calculator with its effective parameters.
pub struct Registered<O: Observation> {
    pub calculator: Arc<dyn Calculator<O>>,
    pub params: CalcParams,
}

impl<O: Observation> Clone for Registered<O> {
    fn clone(&self) -> Self {
        Self {
            calculator: Arc::clone(&self.calculator),
            params: self.params.clone(),
        }
    }
}

/// Immutable set of calculators for one family.
///
/// Registration order is preserved so runs iterate calculators
/// deterministically.
pub struct Registry<O: Observation> {
    family: Family,
    entries: Vec<Registered<O>>,
    by_name: HashMap<String, usize>,
}

impl<O: Observation> Registry<O> {
    /// Validate metadata and apply overrides. Overrides naming calculators
    /// outside this family are ignored; [`Registries::build`] checks them
    /// globally.
    pub fn new(
        family: Family,
        calculators: Vec<Arc<dyn Calculator<O>>>,
        overrides: &Overrides,
    ) -> Result<Self, Report<RegistryError>> {
        let mut entries = Vec::with_capacity(calculators.len());
        let mut by_name = HashMap::with_capacity(calculators.len());
        let mut seen = HashSet::new();

        for calculator in calculators {
            let metadata = calculator.metadata();
            if metadata.name.trim().is_empty() {
                bail!(RegistryError::EmptyName {
                    family: family.to_string(),
                });
            }
            if metadata.min_data_points == 0 {
                bail!(RegistryError::InvalidMetadata {
                    name: metadata.name.clone(),
                    reason: "min_data_points must be >= 1".into(),
                });
            }
            if !seen.insert(metadata.name.clone()) {
                bail!(RegistryError::DuplicateName {
                    name: metadata.name.clone(),
                });
            }

            let settings = overrides.get(&metadata.name);
            if settings.is_some_and(|s| !s.enabled) {
                tracing::info!(
                    %family,
                    calculator = %metadata.name,
                    "calculator disabled by config"
                );
                continue;
            }
            let params = match settings {
                Some(s) => metadata.default_params.merged(&s.params),
                None => metadata.default_params.clone(),
            };

            by_name.insert(metadata.name.clone(), entries.len());
            entries.push(Registered { calculator, params });
        }

        Ok(Self {
            family,
            entries,
            by_name,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all(&self) -> &[Registered<O>] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&Registered<O>> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Effective parameters: metadata defaults overlaid by config.
    pub fn params_for(&self, name: &str) -> Option<&CalcParams> {
        self.get(name).map(|e| &e.params)
    }

    pub fn by_category(&self, category: Category) -> Vec<Registered<O>> {
        self.filtered(|e| e.calculator.category() == category)
    }

    /// Calculators whose tier is `tier` or more urgent.
    pub fn at_or_above(&self, tier: PriorityTier) -> Vec<Registered<O>> {
        self.filtered(|e| e.calculator.metadata().priority.at_or_above(tier))
    }

    pub fn exactly(&self, tier: PriorityTier) -> Vec<Registered<O>> {
        self.filtered(|e| e.calculator.metadata().priority == tier)
    }

    /// Combined selection used by calculation plans. `None` means
    /// unrestricted for the name and category filters.
    pub fn select(
        &self,
        priority: PriorityFilter,
        names: Option<&BTreeSet<String>>,
        categories: Option<&BTreeSet<Category>>,
    ) -> Vec<Registered<O>> {
        self.filtered(|e| {
            let metadata = e.calculator.metadata();
            priority.admits(metadata.priority)
                && names.is_none_or(|n| n.contains(&metadata.name))
                && categories.is_none_or(|c| c.contains(&metadata.category))
        })
    }

    fn filtered(&self, keep: impl Fn(&Registered<O>) -> bool) -> Vec<Registered<O>> {
        self.entries.iter().filter(|e| keep(e)).cloned().collect()
    }
}

/// One registry per engine family, built together so names stay unique
/// across families.
pub struct Registries {
    pub technical: Arc<Registry<PriceBar>>,
    pub chip: Arc<Registry<ChipRecord>>,
    pub pattern: Arc<Registry<PriceBar>>,
}

impl Registries {
    /// Build the built-in calculator sets.
    pub fn build(overrides: &Overrides) -> Result<Self, Report<RegistryError>> {
        Self::build_from(
            indicator::defaults(),
            chip::defaults(),
            pattern::defaults(),
            overrides,
        )
    }

    pub fn build_from(
        technical: Vec<Arc<dyn Calculator<PriceBar>>>,
        chip: Vec<Arc<dyn Calculator<ChipRecord>>>,
        pattern: Vec<Arc<dyn Calculator<PriceBar>>>,
        overrides: &Overrides,
    ) -> Result<Self, Report<RegistryError>> {
        let mut all_names = HashSet::new();
        let names = technical
            .iter()
            .map(|c| c.name().to_string())
            .chain(chip.iter().map(|c| c.name().to_string()))
            .chain(pattern.iter().map(|c| c.name().to_string()));
        for name in names {
            if !all_names.insert(name.clone()) {
                bail!(RegistryError::DuplicateName { name });
            }
        }

        let mut unknown: Vec<&String> = overrides
            .keys()
            .filter(|name| !all_names.contains(*name))
            .collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            bail!(RegistryError::UnknownOverride {
                name: (*name).clone(),
            });
        }

        Ok(Self {
            technical: Arc::new(Registry::new(Family::Technical, technical, overrides)?),
            chip: Arc::new(Registry::new(Family::Chip, chip, overrides)?),
            pattern: Arc::new(Registry::new(Family::Pattern, pattern, overrides)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{CalcValues, CalculatorMetadata};
    use crate::error::CalculationError;
    use crate::model::TimeSeries;

    struct Fixed(CalculatorMetadata);

    impl Calculator<PriceBar> for Fixed {
        fn metadata(&self) -> &CalculatorMetadata {
            &self.0
        }

        fn calculate(
            &self,
            _series: &TimeSeries<PriceBar>,
            _params: &CalcParams,
        ) -> Result<CalcValues, Report<CalculationError>> {
            Ok(CalcValues::new())
        }
    }

    fn fixed(name: &str, category: Category, tier: PriorityTier) -> Arc<dyn Calculator<PriceBar>> {
        Arc::new(Fixed(CalculatorMetadata::new(name, category, 1, tier)))
    }

    fn sample() -> Registry<PriceBar> {
        Registry::new(
            Family::Technical,
            vec![
                fixed("a", Category::Trend, PriorityTier::P0),
                fixed("b", Category::Momentum, PriorityTier::P1),
                fixed("c", Category::Trend, PriorityTier::P2),
            ],
            &Overrides::new(),
        )
        .unwrap()
    }

    fn names(entries: &[Registered<PriceBar>]) -> Vec<&str> {
        entries.iter().map(|e| e.calculator.name()).collect()
    }

    #[test]
    fn duplicate_name_is_fatal() {
        let result = Registry::new(
            Family::Technical,
            vec![
                fixed("dup", Category::Trend, PriorityTier::P0),
                fixed("dup", Category::Trend, PriorityTier::P1),
            ],
            &Overrides::new(),
        );
        let err = result.err().unwrap();
        assert!(matches!(
            err.current_context(),
            RegistryError::DuplicateName { .. }
        ));
    }

    #[test]
    fn zero_min_data_points_is_fatal() {
        let calc: Arc<dyn Calculator<PriceBar>> = Arc::new(Fixed(CalculatorMetadata::new(
            "zero",
            Category::Trend,
            0,
            PriorityTier::P0,
        )));
        assert!(Registry::new(Family::Technical, vec![calc], &Overrides::new()).is_err());
    }

    #[test]
    fn lookup_by_name_category_and_tier() {
        let registry = sample();
        assert!(registry.get("b").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(names(&registry.by_category(Category::Trend)), ["a", "c"]);
        assert_eq!(names(&registry.exactly(PriorityTier::P1)), ["b"]);
        assert_eq!(names(&registry.at_or_above(PriorityTier::P1)), ["a", "b"]);
    }

    #[test]
    fn select_exact_priority_excludes_other_tiers() {
        let registry = sample();
        let selected = registry.select(PriorityFilter::Exactly(PriorityTier::P0), None, None);
        assert_eq!(names(&selected), ["a"]);
    }

    #[test]
    fn select_combines_names_and_categories() {
        let registry = sample();
        let only: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        let cats: BTreeSet<Category> = [Category::Trend].into();
        let selected = registry.select(PriorityFilter::All, Some(&only), Some(&cats));
        assert_eq!(names(&selected), ["a"]);
    }

    #[test]
    fn overrides_merge_params_and_disable() {
        let mut overrides = Overrides::new();
        overrides.insert(
            "sma_20".into(),
            CalculatorSettings {
                enabled: true,
                params: CalcParams::from_pairs(&[("period", 10.0)]),
            },
        );
        overrides.insert(
            "macd".into(),
            CalculatorSettings {
                enabled: false,
                params: CalcParams::new(),
            },
        );
        let registries = Registries::build(&overrides).unwrap();
        let params = registries.technical.params_for("sma_20").unwrap();
        assert_eq!(params.get("period"), Some(10.0));
        assert!(registries.technical.get("macd").is_none());
    }

    #[test]
    fn unknown_override_is_fatal() {
        let mut overrides = Overrides::new();
        overrides.insert("nope".into(), CalculatorSettings::default());
        let err = Registries::build(&overrides).err().unwrap();
        assert!(matches!(
            err.current_context(),
            RegistryError::UnknownOverride { .. }
        ));
    }

    #[test]
    fn names_unique_across_families() {
        let result = Registries::build_from(
            vec![fixed("shared", Category::Trend, PriorityTier::P0)],
            Vec::new(),
            vec![fixed("shared", Category::Candlestick, PriorityTier::P0)],
            &Overrides::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn built_in_registries_are_valid() {
        let registries = Registries::build(&Overrides::new()).unwrap();
        assert!(!registries.technical.is_empty());
        assert!(!registries.chip.is_empty());
        assert_eq!(
            registries.pattern.by_category(Category::Candlestick).len(),
            3
        );
    }
}
