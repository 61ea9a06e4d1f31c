use crate::errors::{EngineError, EngineResult};

/// Decimals of every price delivered by the feed.
pub const FEED_DECIMALS: u32 = 8;
/// Fixed-point scale of polynomial coefficients and premium rates.
pub const RATE_PRECISION: i128 = 1_000_000_000_000_000_000;
/// Fixed-point scale of combine weights (1e5 = 100%).
pub const WEIGHT_PRECISION: i128 = 100_000;
/// Whole-percent scale used by OTM percents, spread widths and collateral ratios.
pub const PERCENT: u128 = 100;

/// Decimal layout of a priced instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Units {
    pub spot_decimals: u32,
    pub size_decimals: u32,
    pub token_decimals: u32,
}

impl Units {
    /// Token value of `size` units of the underlying priced at `price`.
    pub fn token_value(&self, price: u128, size: u128) -> EngineResult<u128> {
        let raw = price
            .checked_mul(size)
            .ok_or(EngineError::Overflow("price * size"))?;
        let num_decimals = self.spot_decimals + self.size_decimals;
        if num_decimals >= self.token_decimals {
            Ok(raw / pow10(num_decimals - self.token_decimals)?)
        } else {
            raw.checked_mul(pow10(self.token_decimals - num_decimals)?)
                .ok_or(EngineError::Overflow("token value upscale"))
        }
    }

    /// Bring a feed price (8 decimals) to this instrument's spot decimals.
    pub fn spot_from_feed(&self, feed_price: u128) -> EngineResult<u128> {
        if self.spot_decimals >= FEED_DECIMALS {
            feed_price
                .checked_mul(pow10(self.spot_decimals - FEED_DECIMALS)?)
                .ok_or(EngineError::Overflow("spot rescale"))
        } else {
            Ok(feed_price / pow10(FEED_DECIMALS - self.spot_decimals)?)
        }
    }
}

#[inline]
pub fn pow10(exp: u32) -> EngineResult<u128> {
    10u128.checked_pow(exp).ok_or(EngineError::Overflow("pow10"))
}

/// `a * b / d`, rounding down.
#[inline]
pub fn mul_div(a: u128, b: u128, d: u128) -> EngineResult<u128> {
    if d == 0 {
        return Err(EngineError::Overflow("division by zero"));
    }
    a.checked_mul(b)
        .map(|p| p / d)
        .ok_or(EngineError::Overflow("mul_div"))
}

/// `a * b / d`, rounding up.
#[inline]
pub fn mul_div_up(a: u128, b: u128, d: u128) -> EngineResult<u128> {
    if d == 0 {
        return Err(EngineError::Overflow("division by zero"));
    }
    let p = a.checked_mul(b).ok_or(EngineError::Overflow("mul_div_up"))?;
    Ok(p.div_ceil(d))
}

/// Scale `value` by a whole percent (`110` = 110%).
#[inline]
pub fn percent_of(value: u128, percent: u32) -> EngineResult<u128> {
    mul_div(value, percent as u128, PERCENT)
}

/// Round `value` to the nearest multiple of `10^decimals` (half up).
pub fn round_to_decimals(value: u128, decimals: u32) -> EngineResult<u128> {
    if decimals == 0 {
        return Ok(value);
    }
    let unit = pow10(decimals)?;
    let half = unit / 2;
    let rounded = value
        .checked_add(half)
        .ok_or(EngineError::Overflow("round"))?
        / unit;
    rounded
        .checked_mul(unit)
        .ok_or(EngineError::Overflow("round"))
}
