pub mod andar_bahar;
pub mod dragon_tiger;
pub mod lucky_seven;
pub mod strategy;
pub mod types;

pub use andar_bahar::AndarBahar;
pub use dragon_tiger::DragonTiger;
pub use lucky_seven::LuckySeven;
pub use strategy::{determine_outcome, Candidate, OutcomeStrategy};
pub use types::*;

use crate::errors::OutcomeError;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome strategy per variant
#[derive(Clone, Default)]
pub struct StrategyTable {
    strategies: HashMap<Variant, Arc<dyn OutcomeStrategy>>,
}

impl StrategyTable {
    /// Table with every built-in variant registered
    pub fn standard() -> Self {
        let mut table = Self::default();
        table.insert(Arc::new(AndarBahar));
        table.insert(Arc::new(DragonTiger));
        table.insert(Arc::new(LuckySeven));
        table
    }

    pub fn insert(&mut self, strategy: Arc<dyn OutcomeStrategy>) {
        self.strategies.insert(strategy.variant(), strategy);
    }

    pub fn get(&self, variant: Variant) -> Result<Arc<dyn OutcomeStrategy>, OutcomeError> {
        self.strategies
            .get(&variant)
            .cloned()
            .ok_or(OutcomeError::UnsupportedVariant(variant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_covers_all_variants() {
        let table = StrategyTable::standard();
        for variant in Variant::ALL {
            let strategy = table.get(variant).unwrap();
            assert_eq!(strategy.variant(), variant);
            for option in strategy.options() {
                assert!(strategy.multiplier(*option).is_some(), "{} has no multiplier", option);
            }
        }
    }

    #[test]
    fn test_empty_table_rejects_variant() {
        let table = StrategyTable::default();
        assert!(matches!(
            table.get(Variant::DragonTiger),
            Err(OutcomeError::UnsupportedVariant(Variant::DragonTiger))
        ));
    }
}
