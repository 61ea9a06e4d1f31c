pub mod payoff;
pub mod position;

use crate::errors::{EngineError, EngineResult};
use crate::pricing::fixed::{self, Units};
use crate::pricing::PriceCalculator;
use crate::registry::{CalculatorKind, StrategyKey};
use crate::state::Asset;
use position::Position;
use std::fmt;
use std::sync::Arc;

/// Payoff shape of a strategy. Shapes carry their own scale in whole percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKind {
    Call,
    Put,
    /// Single call struck at `strike_percent` of spot (110 = 10% OTM)
    OtmCall { strike_percent: u32 },
    OtmPut { strike_percent: u32 },
    CallSpread { width_percent: u32 },
    PutSpread { width_percent: u32 },
    Straddle,
    Strangle { width_percent: u32 },
    Butterfly { width_percent: u32 },
    Condor { inner_percent: u32, outer_percent: u32 },
    Strap,
    Strip,
    InverseBearCallSpread { width_percent: u32 },
    InverseBullPutSpread { width_percent: u32 },
}

impl StrategyKind {
    /// Shapes whose payoff pivots on a single strike. Exercising them at
    /// spot == strike is rejected rather than resolved to zero.
    pub fn has_single_pivot(&self) -> bool {
        matches!(
            self,
            Self::Call
                | Self::Put
                | Self::OtmCall { .. }
                | Self::OtmPut { .. }
                | Self::CallSpread { .. }
                | Self::PutSpread { .. }
                | Self::InverseBearCallSpread { .. }
                | Self::InverseBullPutSpread { .. }
        )
    }

    /// Holder sells the spread: posts width minus credit, pool locks the credit.
    pub fn is_inverse(&self) -> bool {
        matches!(
            self,
            Self::InverseBearCallSpread { .. } | Self::InverseBullPutSpread { .. }
        )
    }

    /// Single-leg shapes take their strike from the calculator (OTM support).
    fn strike_from_calculator(&self) -> bool {
        matches!(
            self,
            Self::Call | Self::Put | Self::OtmCall { .. } | Self::OtmPut { .. }
        )
    }

    /// Calculator kind and scale this shape must be priced by.
    pub fn calculator_shape(&self) -> (CalculatorKind, u32) {
        match *self {
            Self::Call => (CalculatorKind::Call, 100),
            Self::Put => (CalculatorKind::Put, 100),
            Self::OtmCall { strike_percent } => (CalculatorKind::OtmCall, strike_percent),
            Self::OtmPut { strike_percent } => (CalculatorKind::OtmPut, strike_percent),
            Self::CallSpread { width_percent } => (CalculatorKind::CallSpread, width_percent),
            Self::PutSpread { width_percent } => (CalculatorKind::PutSpread, width_percent),
            Self::Straddle => (CalculatorKind::Straddle, 100),
            Self::Strangle { width_percent } => (CalculatorKind::Strangle, width_percent),
            Self::Butterfly { width_percent } => (CalculatorKind::Butterfly, width_percent),
            // strangle(inner) - strangle(outer), keyed by the inner width
            Self::Condor { inner_percent, .. } => (CalculatorKind::Condor, inner_percent),
            Self::Strap => (CalculatorKind::Strap, 100),
            Self::Strip => (CalculatorKind::Strip, 100),
            Self::InverseBearCallSpread { width_percent } => {
                (CalculatorKind::InverseBearCallSpread, width_percent)
            }
            Self::InverseBullPutSpread { width_percent } => {
                (CalculatorKind::InverseBullPutSpread, width_percent)
            }
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let ok = match *self {
            Self::OtmCall { strike_percent } => strike_percent > 100,
            Self::OtmPut { strike_percent } => strike_percent > 0 && strike_percent < 100,
            Self::CallSpread { width_percent }
            | Self::Butterfly { width_percent }
            | Self::InverseBearCallSpread { width_percent } => width_percent > 0,
            Self::PutSpread { width_percent }
            | Self::Strangle { width_percent }
            | Self::InverseBullPutSpread { width_percent } => {
                width_percent > 0 && width_percent < 100
            }
            Self::Condor { inner_percent, outer_percent } => {
                inner_percent > 0 && inner_percent < outer_percent && outer_percent < 100
            }
            Self::Call | Self::Put | Self::Straddle | Self::Strap | Self::Strip => true,
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::Config(format!("invalid strategy shape: {self:?}")))
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Put => write!(f, "put"),
            Self::OtmCall { strike_percent } => write!(f, "otm_call_{strike_percent}"),
            Self::OtmPut { strike_percent } => write!(f, "otm_put_{strike_percent}"),
            Self::CallSpread { width_percent } => write!(f, "call_spread_{width_percent}"),
            Self::PutSpread { width_percent } => write!(f, "put_spread_{width_percent}"),
            Self::Straddle => write!(f, "straddle"),
            Self::Strangle { width_percent } => write!(f, "strangle_{width_percent}"),
            Self::Butterfly { width_percent } => write!(f, "butterfly_{width_percent}"),
            Self::Condor { inner_percent, outer_percent } => {
                write!(f, "condor_{inner_percent}_{outer_percent}")
            }
            Self::Strap => write!(f, "strap"),
            Self::Strip => write!(f, "strip"),
            Self::InverseBearCallSpread { width_percent } => {
                write!(f, "inverse_bear_call_spread_{width_percent}")
            }
            Self::InverseBullPutSpread { width_percent } => {
                write!(f, "inverse_bull_put_spread_{width_percent}")
            }
        }
    }
}

/// Terms of a purchase, computed before any state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub strike: u128,
    /// Calculator output (the credit, for inverse spreads)
    pub price: u128,
    /// Token amount debited from the holder
    pub premium: u128,
    pub locked_amount: u128,
    pub max_payout: u128,
}

/// A tradable strategy: shape + asset + calculator + risk parameters.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub key: StrategyKey,
    pub units: Units,
    pub calculator: Arc<dyn PriceCalculator>,
    /// Cap on collateral locked by this strategy at any time, token units
    pub limit: u128,
    /// Collateral for unbounded shapes, whole percent of strike notional
    pub collateral_percent: u32,
    /// Minimum holding time before exercise, seconds
    pub exercise_delay: i64,
}

impl Strategy {
    #[inline]
    pub fn kind(&self) -> StrategyKind {
        self.key.kind
    }

    #[inline]
    pub fn asset(&self) -> Asset {
        self.key.asset
    }

    /// Price a purchase at `feed_price` (8 decimals). Pure: reads nothing else.
    pub fn quote(&self, period: u64, size: u128, feed_price: u128) -> EngineResult<Quote> {
        let spot = self.units.spot_from_feed(feed_price)?;
        let kind = self.kind();

        let strike = if kind.strike_from_calculator() {
            self.calculator.strike_for(spot)?
        } else {
            spot
        };
        let price = self.calculator.premium(period, size, spot)?;
        let width = payoff::bounded_width(kind, strike)?
            .map(|w| self.units.token_value(w, size))
            .transpose()?;

        let (premium, locked_amount) = match width {
            Some(width) if kind.is_inverse() => {
                if price >= width {
                    return Err(EngineError::ZeroProfit);
                }
                (width - price, price)
            }
            Some(width) => (price, width),
            None => {
                let notional = self.units.token_value(strike, size)?;
                (price, fixed::percent_of(notional, self.collateral_percent)?)
            }
        };

        let max_payout = if kind.is_inverse() {
            locked_amount
                .checked_add(premium)
                .ok_or(EngineError::Overflow("max payout"))?
        } else {
            locked_amount
        };

        Ok(Quote {
            strike,
            price,
            premium,
            locked_amount,
            max_payout,
        })
    }

    /// Payoff owed on exercise at `feed_price` and time `now`.
    ///
    /// Rejects instead of paying zero: spot == strike on single-pivot shapes
    /// is InvalidStrike, any other zero payoff is ZeroProfit.
    pub fn settle(&self, position: &Position, feed_price: u128, now: i64) -> EngineResult<u128> {
        if position.is_expired(now) {
            return Err(EngineError::AlreadyExpired(position.id));
        }
        let unlocks_at = position
            .created_at
            .checked_add(self.exercise_delay)
            .ok_or(EngineError::Overflow("exercise delay"))?;
        if now < unlocks_at {
            return Err(EngineError::ExerciseTooEarly { unlocks_at });
        }

        let spot = self.units.spot_from_feed(feed_price)?;
        let kind = self.kind();
        if kind.has_single_pivot() && spot == position.strike {
            return Err(EngineError::InvalidStrike { price: spot });
        }

        let per_unit = payoff::intrinsic(kind, position.strike, spot)?;
        let amount = self.units.token_value(per_unit, position.size)?;
        if amount == 0 {
            return Err(EngineError::ZeroProfit);
        }
        Ok(amount.min(position.max_payout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::polynomial::{Curve, PolynomialPriceCalculator, ScaledPolynomialPriceCalculator};
    use crate::pricing::PeriodBounds;
    use crate::state::AccountId;
    use position::PositionState;

    const DAY: u64 = 86_400;
    const ETH: u128 = 1_000_000_000_000_000_000;
    const UNITS: Units = Units { spot_decimals: 8, size_decimals: 18, token_decimals: 6 };

    fn strategy(kind: StrategyKind, rate: i128, delay: i64) -> Strategy {
        let calc = PolynomialPriceCalculator::new(
            "flat",
            Curve::new([rate, 0, 0, 0, 0]),
            PeriodBounds { min: 7 * DAY, max: 45 * DAY },
            UNITS,
        );
        Strategy {
            key: StrategyKey { kind, asset: Asset::Eth },
            units: UNITS,
            calculator: Arc::new(calc),
            limit: 1_000_000_000_000,
            collateral_percent: 50,
            exercise_delay: delay,
        }
    }

    fn otm(kind: StrategyKind) -> Strategy {
        let (_, percent) = kind.calculator_shape();
        let calc = ScaledPolynomialPriceCalculator::new(
            "otm",
            Curve::new([50_000_000_000_000_000, 0, 0, 0, 0]),
            Curve::new([0; 5]),
            percent,
            8,
            PeriodBounds { min: 7 * DAY, max: 45 * DAY },
            UNITS,
        );
        Strategy {
            calculator: Arc::new(calc),
            ..strategy(kind, 0, 0)
        }
    }

    fn open(s: &Strategy, q: &Quote, size: u128) -> Position {
        Position {
            id: 0,
            strategy: s.key,
            holder: AccountId::from("alice"),
            strike: q.strike,
            size,
            period: 7 * DAY,
            created_at: 0,
            expiration: (7 * DAY) as i64,
            locked_amount: q.locked_amount,
            locked_premium: q.premium,
            max_payout: q.max_payout,
            state: PositionState::Active,
        }
    }

    #[test]
    fn test_inverse_bear_call_spread_quote() {
        let s = strategy(
            StrategyKind::InverseBearCallSpread { width_percent: 10 },
            42_553_192_950_870_010,
            0,
        );
        let q = s.quote(7 * DAY, 2 * ETH, 141_212_320_000).unwrap();
        assert_eq!(q.strike, 141_212_320_000);
        assert_eq!(q.locked_amount, 120_180_702);
        assert_eq!(q.premium, 162_243_938);
        assert_eq!(q.max_payout, 282_424_640);
    }

    #[test]
    fn test_invalid_strike_at_current_price() {
        let s = strategy(
            StrategyKind::InverseBearCallSpread { width_percent: 10 },
            42_553_192_950_870_010,
            0,
        );
        let q = s.quote(7 * DAY, 2 * ETH, 141_212_320_000).unwrap();
        let pos = open(&s, &q, 2 * ETH);
        let res = s.settle(&pos, 141_212_320_000, 3600);
        assert!(matches!(res, Err(EngineError::InvalidStrike { price: 141_212_320_000 })));

        // Below the strike the seller keeps the whole width
        assert_eq!(s.settle(&pos, 130_000_000_000, 3600).unwrap(), 282_424_640);
    }

    #[test]
    fn test_call_collateral_and_cap() {
        let s = strategy(StrategyKind::Call, 50_000_000_000_000_000, 0);
        // 2000 USDC notional, 50% collateral
        let q = s.quote(7 * DAY, ETH, 200_000_000_000).unwrap();
        assert_eq!(q.premium, 100_000_000);
        assert_eq!(q.locked_amount, 1_000_000_000);

        let pos = open(&s, &q, ETH);
        assert_eq!(s.settle(&pos, 210_000_000_000, 60).unwrap(), 100_000_000);
        // Payoff above the collateral is capped
        assert_eq!(s.settle(&pos, 500_000_000_000, 60).unwrap(), 1_000_000_000);
        assert!(matches!(s.settle(&pos, 190_000_000_000, 60), Err(EngineError::ZeroProfit)));
    }

    #[test]
    fn test_multi_leg_zero_profit() {
        let s = strategy(StrategyKind::Condor { inner_percent: 10, outer_percent: 20 }, 10_000_000_000_000_000, 0);
        let q = s.quote(7 * DAY, ETH, 200_000_000_000).unwrap();
        assert_eq!(q.locked_amount, 200_000_000);
        let pos = open(&s, &q, ETH);
        assert!(matches!(s.settle(&pos, 200_000_000_000, 60), Err(EngineError::ZeroProfit)));
        assert!(matches!(s.settle(&pos, 210_000_000_000, 60), Err(EngineError::ZeroProfit)));
        assert_eq!(s.settle(&pos, 230_000_000_000, 60).unwrap(), 100_000_000);
    }

    #[test]
    fn test_strap_holding_gate() {
        let s = strategy(StrategyKind::Strap, 80_000_000_000_000_000, 1800);
        let q = s.quote(7 * DAY, ETH, 200_000_000_000).unwrap();
        let pos = open(&s, &q, ETH);
        assert!(matches!(
            s.settle(&pos, 220_000_000_000, 1799),
            Err(EngineError::ExerciseTooEarly { unlocks_at: 1800 })
        ));
        assert_eq!(s.settle(&pos, 220_000_000_000, 1800).unwrap(), 400_000_000);
    }

    #[test]
    fn test_exercise_after_expiration_rejected() {
        let s = strategy(StrategyKind::Put, 50_000_000_000_000_000, 0);
        let q = s.quote(7 * DAY, ETH, 200_000_000_000).unwrap();
        let pos = open(&s, &q, ETH);
        assert!(matches!(
            s.settle(&pos, 100_000_000_000, pos.expiration),
            Err(EngineError::AlreadyExpired(0))
        ));
    }

    #[test]
    fn test_otm_call_struck_above_spot() {
        let s = otm(StrategyKind::OtmCall { strike_percent: 110 });
        // 1412.1232 * 1.1 = 1553.33552, rounded to 1553
        let q = s.quote(7 * DAY, ETH, 141_212_320_000).unwrap();
        assert_eq!(q.strike, 155_300_000_000);
        assert_eq!(q.premium, 70_606_160);
        assert_eq!(q.locked_amount, 776_500_000);

        let pos = open(&s, &q, ETH);
        assert!(matches!(
            s.settle(&pos, 155_300_000_000, 60),
            Err(EngineError::InvalidStrike { price: 155_300_000_000 })
        ));
        // Above the purchase spot but still below the OTM strike
        assert!(matches!(s.settle(&pos, 150_000_000_000, 60), Err(EngineError::ZeroProfit)));
        assert_eq!(s.settle(&pos, 160_000_000_000, 60).unwrap(), 47_000_000);
    }

    #[test]
    fn test_otm_put_struck_below_spot() {
        let s = otm(StrategyKind::OtmPut { strike_percent: 90 });
        // 1412.1232 * 0.9 = 1270.91088, rounded to 1271
        let q = s.quote(7 * DAY, ETH, 141_212_320_000).unwrap();
        assert_eq!(q.strike, 127_100_000_000);

        let pos = open(&s, &q, ETH);
        assert!(matches!(
            s.settle(&pos, 127_100_000_000, 60),
            Err(EngineError::InvalidStrike { .. })
        ));
        assert!(matches!(s.settle(&pos, 130_000_000_000, 60), Err(EngineError::ZeroProfit)));
        assert_eq!(s.settle(&pos, 120_000_000_000, 60).unwrap(), 71_000_000);
    }

    #[test]
    fn test_exercise_delay_overflow_reported() {
        let s = strategy(StrategyKind::Strap, 80_000_000_000_000_000, i64::MAX);
        let q = s.quote(7 * DAY, ETH, 200_000_000_000).unwrap();
        let mut pos = open(&s, &q, ETH);
        pos.created_at = 10;
        assert!(matches!(
            s.settle(&pos, 220_000_000_000, 60),
            Err(EngineError::Overflow(_))
        ));
    }

    #[test]
    fn test_calculator_shape() {
        assert_eq!(
            StrategyKind::OtmCall { strike_percent: 120 }.calculator_shape(),
            (CalculatorKind::OtmCall, 120)
        );
        assert_eq!(
            StrategyKind::Condor { inner_percent: 10, outer_percent: 20 }.calculator_shape(),
            (CalculatorKind::Condor, 10)
        );
        assert_eq!(StrategyKind::Straddle.calculator_shape(), (CalculatorKind::Straddle, 100));
    }

    #[test]
    fn test_shape_validation() {
        assert!(StrategyKind::OtmCall { strike_percent: 100 }.validate().is_err());
        assert!(StrategyKind::OtmPut { strike_percent: 90 }.validate().is_ok());
        assert!(StrategyKind::Strangle { width_percent: 100 }.validate().is_err());
        assert!(StrategyKind::Condor { inner_percent: 20, outer_percent: 10 }.validate().is_err());
        assert!(StrategyKind::Butterfly { width_percent: 10 }.validate().is_ok());
    }
}
