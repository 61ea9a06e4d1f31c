use crate::errors::{EngineError, EngineResult};
use crate::pricing::fixed::percent_of;
use crate::strategy::StrategyKind;

/// Payoff of one unit of the underlying, in spot price units, before sizing
/// and before the max-payout cap. Pure function of shape, strike and spot.
///
///   call:     max(0, S-K)
///   put:      max(0, K-S)
///   spread:   capped at the width W = K*w
///   straddle: |S-K|
///   strangle: legs struck at K(1+w) and K(1-w)
///   butterfly (straddle - strangle):       min(|S-K|, K*w)
///   condor (strangle(inner) - strangle(outer)): clamp(|S-K| - K*inner, 0, K*(outer-inner))
///   strap / strip: 2:1 / 1:2 call:put
///   inverse spreads: W minus the spread the holder sold
pub fn intrinsic(kind: StrategyKind, strike: u128, spot: u128) -> EngineResult<u128> {
    let up = spot.saturating_sub(strike);
    let down = strike.saturating_sub(spot);

    let value = match kind {
        StrategyKind::Call | StrategyKind::OtmCall { .. } => up,
        StrategyKind::Put | StrategyKind::OtmPut { .. } => down,
        StrategyKind::CallSpread { width_percent } => up.min(percent_of(strike, width_percent)?),
        StrategyKind::PutSpread { width_percent } => down.min(percent_of(strike, width_percent)?),
        StrategyKind::Straddle => up + down,
        StrategyKind::Strangle { width_percent } => {
            let upper = percent_of(strike, 100 + width_percent)?;
            let lower = percent_of(strike, 100u32.saturating_sub(width_percent))?;
            spot.saturating_sub(upper) + lower.saturating_sub(spot)
        }
        StrategyKind::Butterfly { width_percent } => {
            (up + down).min(percent_of(strike, width_percent)?)
        }
        StrategyKind::Condor { inner_percent, outer_percent } => {
            let inner = percent_of(strike, inner_percent)?;
            let span = percent_of(strike, outer_percent.saturating_sub(inner_percent))?;
            (up + down).saturating_sub(inner).min(span)
        }
        StrategyKind::Strap => doubled(up)?.checked_add(down).ok_or(EngineError::Overflow("strap"))?,
        StrategyKind::Strip => up.checked_add(doubled(down)?).ok_or(EngineError::Overflow("strip"))?,
        StrategyKind::InverseBearCallSpread { width_percent } => {
            let width = percent_of(strike, width_percent)?;
            width - up.min(width)
        }
        StrategyKind::InverseBullPutSpread { width_percent } => {
            let width = percent_of(strike, width_percent)?;
            width - down.min(width)
        }
    };
    Ok(value)
}

/// Worst-case per-unit payout for bounded shapes, in spot price units.
/// None for shapes whose payout is unbounded (or strike-bounded only).
pub fn bounded_width(kind: StrategyKind, strike: u128) -> EngineResult<Option<u128>> {
    let width = match kind {
        StrategyKind::CallSpread { width_percent }
        | StrategyKind::PutSpread { width_percent }
        | StrategyKind::Butterfly { width_percent }
        | StrategyKind::InverseBearCallSpread { width_percent }
        | StrategyKind::InverseBullPutSpread { width_percent } => {
            Some(percent_of(strike, width_percent)?)
        }
        StrategyKind::Condor { inner_percent, outer_percent } => {
            Some(percent_of(strike, outer_percent.saturating_sub(inner_percent))?)
        }
        StrategyKind::Call
        | StrategyKind::Put
        | StrategyKind::OtmCall { .. }
        | StrategyKind::OtmPut { .. }
        | StrategyKind::Straddle
        | StrategyKind::Strangle { .. }
        | StrategyKind::Strap
        | StrategyKind::Strip => None,
    };
    Ok(width)
}

#[inline]
fn doubled(v: u128) -> EngineResult<u128> {
    v.checked_mul(2).ok_or(EngineError::Overflow("leg ratio"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: u128 = 100_000_000_000; // 1000.00000000

    fn px(dollars: u128) -> u128 {
        dollars * 100_000_000
    }

    #[test]
    fn test_call_monotonic_above_strike() {
        let mut last = 0;
        for s in [800, 1000, 1001, 1050, 1200, 2000] {
            let v = intrinsic(StrategyKind::Call, K, px(s)).unwrap();
            assert!(v >= last, "call payoff must be non-decreasing in spot");
            if s <= 1000 {
                assert_eq!(v, 0, "call pays nothing at or below strike");
            }
            last = v;
        }
        assert_eq!(intrinsic(StrategyKind::Call, K, px(1200)).unwrap(), px(200));
    }

    #[test]
    fn test_put_mirrors_call() {
        let mut last = u128::MAX;
        for s in [500, 900, 999, 1000, 1100] {
            let v = intrinsic(StrategyKind::Put, K, px(s)).unwrap();
            assert!(v <= last, "put payoff must be non-increasing in spot");
            last = v;
        }
        assert_eq!(intrinsic(StrategyKind::Put, K, px(900)).unwrap(), px(100));
        assert_eq!(intrinsic(StrategyKind::Put, K, px(1100)).unwrap(), 0);
    }

    #[test]
    fn test_spreads_are_capped() {
        let call_spread = StrategyKind::CallSpread { width_percent: 10 };
        assert_eq!(intrinsic(call_spread, K, px(1050)).unwrap(), px(50));
        assert_eq!(intrinsic(call_spread, K, px(1500)).unwrap(), px(100));

        let put_spread = StrategyKind::PutSpread { width_percent: 20 };
        assert_eq!(intrinsic(put_spread, K, px(850)).unwrap(), px(150));
        assert_eq!(intrinsic(put_spread, K, px(100)).unwrap(), px(200));
    }

    #[test]
    fn test_straddle_and_strangle() {
        assert_eq!(intrinsic(StrategyKind::Straddle, K, px(930)).unwrap(), px(70));
        assert_eq!(intrinsic(StrategyKind::Straddle, K, px(1070)).unwrap(), px(70));

        let strangle = StrategyKind::Strangle { width_percent: 10 };
        assert_eq!(intrinsic(strangle, K, px(1050)).unwrap(), 0);
        assert_eq!(intrinsic(strangle, K, px(1150)).unwrap(), px(50));
        assert_eq!(intrinsic(strangle, K, px(850)).unwrap(), px(50));
    }

    #[test]
    fn test_butterfly_breakpoints() {
        let fly = StrategyKind::Butterfly { width_percent: 10 };
        assert_eq!(intrinsic(fly, K, K).unwrap(), 0);
        assert_eq!(intrinsic(fly, K, px(1040)).unwrap(), px(40));
        assert_eq!(intrinsic(fly, K, px(960)).unwrap(), px(40));
        assert_eq!(intrinsic(fly, K, px(1300)).unwrap(), px(100));
        assert_eq!(intrinsic(fly, K, px(500)).unwrap(), px(100));
    }

    #[test]
    fn test_condor_zero_between_inner_breakpoints() {
        let condor = StrategyKind::Condor { inner_percent: 10, outer_percent: 30 };
        for s in [900, 950, 1000, 1050, 1100] {
            assert_eq!(intrinsic(condor, K, px(s)).unwrap(), 0, "spot {s}");
        }
        assert_eq!(intrinsic(condor, K, px(1150)).unwrap(), px(50));
        assert_eq!(intrinsic(condor, K, px(820)).unwrap(), px(80));
        assert_eq!(intrinsic(condor, K, px(2000)).unwrap(), px(200));
        assert_eq!(intrinsic(condor, K, px(100)).unwrap(), px(200));
    }

    #[test]
    fn test_strap_strip_weights() {
        assert_eq!(intrinsic(StrategyKind::Strap, K, px(1100)).unwrap(), px(200));
        assert_eq!(intrinsic(StrategyKind::Strap, K, px(900)).unwrap(), px(100));
        assert_eq!(intrinsic(StrategyKind::Strip, K, px(1100)).unwrap(), px(100));
        assert_eq!(intrinsic(StrategyKind::Strip, K, px(900)).unwrap(), px(200));
    }

    #[test]
    fn test_inverse_spreads() {
        let bear = StrategyKind::InverseBearCallSpread { width_percent: 10 };
        assert_eq!(intrinsic(bear, K, px(900)).unwrap(), px(100));
        assert_eq!(intrinsic(bear, K, px(1040)).unwrap(), px(60));
        assert_eq!(intrinsic(bear, K, px(1100)).unwrap(), 0);

        let bull = StrategyKind::InverseBullPutSpread { width_percent: 10 };
        assert_eq!(intrinsic(bull, K, px(1200)).unwrap(), px(100));
        assert_eq!(intrinsic(bull, K, px(970)).unwrap(), px(70));
        assert_eq!(intrinsic(bull, K, px(850)).unwrap(), 0);
    }

    #[test]
    fn test_bounded_widths() {
        assert_eq!(bounded_width(StrategyKind::Call, K).unwrap(), None);
        assert_eq!(
            bounded_width(StrategyKind::Condor { inner_percent: 10, outer_percent: 25 }, K).unwrap(),
            Some(px(150))
        );
        assert_eq!(
            bounded_width(StrategyKind::CallSpread { width_percent: 5 }, K).unwrap(),
            Some(px(50))
        );
    }
}
