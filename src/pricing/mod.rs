pub mod combine;
pub mod fixed;
pub mod polynomial;

use crate::errors::{EngineError, EngineResult};

/// All price calculators implement this trait.
/// premium() must be a pure function: deterministic output from inputs only.
/// Send + Sync required so the resolved deployment can be shared across tokio tasks.
pub trait PriceCalculator: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn period_bounds(&self) -> PeriodBounds;

    /// Total premium in token units for `size` of the underlying at `spot`.
    /// Strictly positive on success. Fails on a period outside the bounds.
    fn premium(&self, period: u64, size: u128, spot: u128) -> EngineResult<u128>;

    /// Strike the priced leg is struck at. ATM calculators return the spot.
    fn strike_for(&self, spot: u128) -> EngineResult<u128> {
        Ok(spot)
    }
}

/// Inclusive period range accepted by a calculator, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeriodBounds {
    pub min: u64,
    pub max: u64,
}

impl PeriodBounds {
    #[inline]
    pub fn check(&self, period: u64) -> EngineResult<()> {
        if period < self.min {
            return Err(EngineError::PeriodTooShort { period, min: self.min });
        }
        if period > self.max {
            return Err(EngineError::PeriodTooLong { period, max: self.max });
        }
        Ok(())
    }

    /// Periods accepted by both ranges.
    pub fn intersect(&self, other: &PeriodBounds) -> PeriodBounds {
        PeriodBounds {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 86_400;

    #[test]
    fn test_period_bounds_inclusive() {
        let bounds = PeriodBounds { min: 7 * DAY, max: 45 * DAY };
        assert!(bounds.check(7 * DAY).is_ok());
        assert!(bounds.check(45 * DAY).is_ok());
        assert!(matches!(
            bounds.check(7 * DAY - 1),
            Err(EngineError::PeriodTooShort { .. })
        ));
        assert!(matches!(
            bounds.check(45 * DAY + 1),
            Err(EngineError::PeriodTooLong { .. })
        ));
    }

    #[test]
    fn test_intersection() {
        let a = PeriodBounds { min: DAY, max: 30 * DAY };
        let b = PeriodBounds { min: 7 * DAY, max: 90 * DAY };
        assert_eq!(a.intersect(&b), PeriodBounds { min: 7 * DAY, max: 30 * DAY });
    }
}
