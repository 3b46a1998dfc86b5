use log::debug;

use crate::error::CostError;

/// Running total of predicted instrumentation overhead against a budget
#[derive(Debug, Clone, PartialEq)]
pub struct CostLedger {
    total: f64,
    budget: f64,
}

impl CostLedger {
    pub fn new(budget: f64) -> Self {
        Self { total: 0.0, budget }
    }

    /// Rejects `cost` if it would push the total over the budget
    pub fn check(&self, cost: f64) -> Result<(), CostError> {
        if self.total + cost > self.budget {
            return Err(CostError::BudgetExceeded {
                requested: cost,
                current: self.total,
                budget: self.budget,
            });
        }
        Ok(())
    }

    pub fn add(&mut self, cost: f64) {
        self.total += cost;
        debug!("predicted overhead +{:.4} = {:.4}", cost, self.total);
    }

    pub fn sub(&mut self, cost: f64) {
        self.total = (self.total - cost).max(0.0);
        debug!("predicted overhead -{:.4} = {:.4}", cost, self.total);
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }
}
