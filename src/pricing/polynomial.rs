use crate::errors::{EngineError, EngineResult};
use crate::pricing::fixed::{self, Units, RATE_PRECISION};
use crate::pricing::{PeriodBounds, PriceCalculator};

/// Degree-4 price curve in spot.
///
/// rate(S) = c0 + c1*S + c2*S^2 + c3*S^3 + c4*S^4
///
/// S is the spot as a real number (each power normalised by the spot
/// fixed-point unit), coefficients and the result carry RATE_PRECISION.
/// The rate is a fraction of notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Curve {
    pub coefficients: [i128; 5],
}

impl Curve {
    pub fn new(coefficients: [i128; 5]) -> Self {
        Self { coefficients }
    }

    /// Horner evaluation. Never wraps: overflow is an error.
    pub fn rate_at(&self, spot: u128, spot_decimals: u32) -> EngineResult<i128> {
        let s = i128::try_from(spot).map_err(|_| EngineError::Overflow("spot"))?;
        let unit = i128::try_from(fixed::pow10(spot_decimals)?)
            .map_err(|_| EngineError::Overflow("spot unit"))?;

        let mut acc = self.coefficients[4];
        for c in self.coefficients[..4].iter().rev() {
            acc = acc
                .checked_mul(s)
                .ok_or(EngineError::Overflow("curve evaluation"))?
                / unit;
            acc = acc
                .checked_add(*c)
                .ok_or(EngineError::Overflow("curve evaluation"))?;
        }
        Ok(acc)
    }
}

/// Premium on `notional` at `rate`. Zero or negative results are rejected
/// as zero profit.
fn premium_from_rate(notional: u128, rate: i128) -> EngineResult<u128> {
    if rate <= 0 {
        return Err(EngineError::ZeroProfit);
    }
    let premium = fixed::mul_div(notional, rate as u128, RATE_PRECISION as u128)?;
    if premium == 0 {
        return Err(EngineError::ZeroProfit);
    }
    Ok(premium)
}

/// ATM price calculator backed by a single polynomial curve.
#[derive(Debug, Clone)]
pub struct PolynomialPriceCalculator {
    name: String,
    curve: Curve,
    bounds: PeriodBounds,
    units: Units,
}

impl PolynomialPriceCalculator {
    pub fn new(name: impl Into<String>, curve: Curve, bounds: PeriodBounds, units: Units) -> Self {
        Self {
            name: name.into(),
            curve,
            bounds,
            units,
        }
    }
}

impl PriceCalculator for PolynomialPriceCalculator {
    fn name(&self) -> &str {
        &self.name
    }

    fn period_bounds(&self) -> PeriodBounds {
        self.bounds
    }

    fn premium(&self, period: u64, size: u128, spot: u128) -> EngineResult<u128> {
        self.bounds.check(period)?;
        let rate = self.curve.rate_at(spot, self.units.spot_decimals)?;
        let notional = self.units.token_value(spot, size)?;
        premium_from_rate(notional, rate)
    }
}

/// OTM price calculator: base curve minus a discount curve evaluated at the
/// effective (scaled, rounded) strike.
#[derive(Debug, Clone)]
pub struct ScaledPolynomialPriceCalculator {
    name: String,
    curve: Curve,
    discount: Curve,
    /// Strike as a whole percent of spot (110 = 10% above)
    percent: u32,
    /// Effective strike is rounded to a multiple of 10^rounded_decimals
    rounded_decimals: u32,
    bounds: PeriodBounds,
    units: Units,
}

impl ScaledPolynomialPriceCalculator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        curve: Curve,
        discount: Curve,
        percent: u32,
        rounded_decimals: u32,
        bounds: PeriodBounds,
        units: Units,
    ) -> Self {
        Self {
            name: name.into(),
            curve,
            discount,
            percent,
            rounded_decimals,
            bounds,
            units,
        }
    }
}

impl PriceCalculator for ScaledPolynomialPriceCalculator {
    fn name(&self) -> &str {
        &self.name
    }

    fn period_bounds(&self) -> PeriodBounds {
        self.bounds
    }

    fn premium(&self, period: u64, size: u128, spot: u128) -> EngineResult<u128> {
        self.bounds.check(period)?;
        let strike = self.strike_for(spot)?;
        let base = self.curve.rate_at(spot, self.units.spot_decimals)?;
        let discount = self.discount.rate_at(strike, self.units.spot_decimals)?;
        let rate = base
            .checked_sub(discount)
            .ok_or(EngineError::Overflow("discounted rate"))?;
        let notional = self.units.token_value(spot, size)?;
        premium_from_rate(notional, rate)
    }

    fn strike_for(&self, spot: u128) -> EngineResult<u128> {
        let scaled = fixed::percent_of(spot, self.percent)?;
        fixed::round_to_decimals(scaled, self.rounded_decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 86_400;
    const ETH: u128 = 1_000_000_000_000_000_000;
    const SPOT: u128 = 141_212_320_000;
    const UNITS: Units = Units { spot_decimals: 8, size_decimals: 18, token_decimals: 6 };
    const BOUNDS: PeriodBounds = PeriodBounds { min: 7 * DAY, max: 45 * DAY };

    fn flat(rate: i128) -> Curve {
        Curve::new([rate, 0, 0, 0, 0])
    }

    #[test]
    fn test_constant_curve_premium() {
        let calc = PolynomialPriceCalculator::new("flat", flat(42_553_192_950_870_010), BOUNDS, UNITS);
        let premium = calc.premium(7 * DAY, 2 * ETH, SPOT).unwrap();
        assert_eq!(premium, 120_180_702);
    }

    #[test]
    fn test_linear_term_uses_real_spot() {
        // rate = 0.06 - 0.000005 * 1412.1232 = 0.052939384
        let curve = Curve::new([60_000_000_000_000_000, -5_000_000_000_000, 0, 0, 0]);
        assert_eq!(curve.rate_at(SPOT, 8).unwrap(), 52_939_384_000_000_000);

        let calc = PolynomialPriceCalculator::new("linear", curve, BOUNDS, UNITS);
        assert_eq!(calc.premium(14 * DAY, ETH, SPOT).unwrap(), 74_756_932);
    }

    #[test]
    fn test_higher_powers() {
        // rate = 1e-12 * S^4 at S = 100 -> 1e-4
        let curve = Curve::new([0, 0, 0, 0, 1_000_000]);
        assert_eq!(curve.rate_at(10_000_000_000, 8).unwrap(), 100_000_000_000_000);
    }

    #[test]
    fn test_period_checked_before_pricing() {
        let calc = PolynomialPriceCalculator::new("flat", flat(1), BOUNDS, UNITS);
        assert!(matches!(
            calc.premium(7 * DAY - 1, ETH, SPOT),
            Err(EngineError::PeriodTooShort { .. })
        ));
        assert!(matches!(
            calc.premium(45 * DAY + 1, ETH, SPOT),
            Err(EngineError::PeriodTooLong { .. })
        ));
    }

    #[test]
    fn test_negative_rate_rejected() {
        let calc = PolynomialPriceCalculator::new("neg", flat(-1), BOUNDS, UNITS);
        assert!(matches!(
            calc.premium(7 * DAY, ETH, SPOT),
            Err(EngineError::ZeroProfit)
        ));
    }

    #[test]
    fn test_scaled_strike_is_rounded() {
        let calc = ScaledPolynomialPriceCalculator::new(
            "otm", flat(50_000_000_000_000_000), flat(0), 110, 8, BOUNDS, UNITS,
        );
        // 1412.1232 * 1.1 = 1553.33552 -> 1553
        assert_eq!(calc.strike_for(SPOT).unwrap(), 155_300_000_000);
    }

    #[test]
    fn test_scaled_discount_evaluated_at_strike() {
        // discount = 1e-5 * K = 0.01553 at K = 1553
        let discount = Curve::new([0, 10_000_000_000_000, 0, 0, 0]);
        let calc = ScaledPolynomialPriceCalculator::new(
            "otm", flat(50_000_000_000_000_000), discount, 110, 8, BOUNDS, UNITS,
        );
        assert_eq!(calc.premium(7 * DAY, ETH, SPOT).unwrap(), 48_675_886);
    }

    #[test]
    fn test_discount_cannot_exceed_base() {
        let calc = ScaledPolynomialPriceCalculator::new(
            "otm", flat(10_000_000_000_000_000), flat(10_000_000_000_000_000), 90, 8, BOUNDS, UNITS,
        );
        assert!(matches!(
            calc.premium(7 * DAY, ETH, SPOT),
            Err(EngineError::ZeroProfit)
        ));
    }
}
