use crate::errors::{EngineError, EngineResult};
use crate::pricing::fixed::WEIGHT_PRECISION;
use crate::pricing::{PeriodBounds, PriceCalculator};
use std::sync::Arc;

/// Weighted sum of two child calculators.
///
/// premium = (w0 * premium0 + w1 * premium1) / 1e5
///
/// Straddle = put + call [1e5, 1e5], spread = ATM - 0.8 * OTM [1e5, -8e4].
/// A negative leg may reduce the premium but never to zero: a combination
/// that prices at or below zero is rejected as zero profit.
#[derive(Debug, Clone)]
pub struct CombinePriceCalculator {
    name: String,
    legs: [Arc<dyn PriceCalculator>; 2],
    weights: [i128; 2],
}

impl CombinePriceCalculator {
    pub fn new(
        name: impl Into<String>,
        legs: [Arc<dyn PriceCalculator>; 2],
        weights: [i128; 2],
    ) -> Self {
        Self {
            name: name.into(),
            legs,
            weights,
        }
    }
}

impl PriceCalculator for CombinePriceCalculator {
    fn name(&self) -> &str {
        &self.name
    }

    fn period_bounds(&self) -> PeriodBounds {
        self.legs[0].period_bounds().intersect(&self.legs[1].period_bounds())
    }

    fn premium(&self, period: u64, size: u128, spot: u128) -> EngineResult<u128> {
        let mut total: i128 = 0;
        for (leg, weight) in self.legs.iter().zip(self.weights) {
            let p = i128::try_from(leg.premium(period, size, spot)?)
                .map_err(|_| EngineError::Overflow("leg premium"))?;
            let weighted = p
                .checked_mul(weight)
                .ok_or(EngineError::Overflow("weighted leg"))?;
            total = total
                .checked_add(weighted)
                .ok_or(EngineError::Overflow("combined premium"))?;
        }

        let premium = total / WEIGHT_PRECISION;
        if premium <= 0 {
            return Err(EngineError::ZeroProfit);
        }
        Ok(premium as u128)
    }

    fn strike_for(&self, spot: u128) -> EngineResult<u128> {
        self.legs[0].strike_for(spot)
    }
}
