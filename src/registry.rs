use crate::errors::EngineResult;
use crate::state::Asset;
use crate::strategy::StrategyKind;
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of an idempotent registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registered<V> {
    Existing(V),
    Created(V),
}

impl<V> Registered<V> {
    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Typed registry resolved once at load time. Iterates in key order.
#[derive(Debug, Clone)]
pub struct Registry<K: Ord, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> Registry<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Return the entry under `key`, building and inserting it if absent.
    /// A failing builder leaves the registry unchanged.
    pub fn create_or_fetch<F>(&mut self, key: K, build: F) -> EngineResult<Registered<V>>
    where
        F: FnOnce() -> EngineResult<V>,
    {
        if let Some(existing) = self.entries.get(&key) {
            return Ok(Registered::Existing(existing.clone()));
        }
        let value = build()?;
        self.entries.insert(key, value.clone());
        Ok(Registered::Created(value))
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }
}

impl<K: Ord + Clone, V: Clone> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Keys ──

/// Which priced instrument a calculator quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculatorKind {
    Call,
    Put,
    OtmCall,
    OtmPut,
    CallSpread,
    PutSpread,
    Straddle,
    Strangle,
    Butterfly,
    Condor,
    Strap,
    Strip,
    InverseBearCallSpread,
    InverseBullPutSpread,
}

impl fmt::Display for CalculatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Call => "call",
            Self::Put => "put",
            Self::OtmCall => "otm_call",
            Self::OtmPut => "otm_put",
            Self::CallSpread => "call_spread",
            Self::PutSpread => "put_spread",
            Self::Straddle => "straddle",
            Self::Strangle => "strangle",
            Self::Butterfly => "butterfly",
            Self::Condor => "condor",
            Self::Strap => "strap",
            Self::Strip => "strip",
            Self::InverseBearCallSpread => "inverse_bear_call_spread",
            Self::InverseBullPutSpread => "inverse_bull_put_spread",
        };
        f.write_str(s)
    }
}

/// (kind, currency, scale) key of a price calculator, e.g. `otm_call-110-eth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct CalculatorKey {
    pub kind: CalculatorKind,
    pub asset: Asset,
    #[serde(default = "default_scale")]
    pub scale: u32,
}

fn default_scale() -> u32 {
    100
}

impl fmt::Display for CalculatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.kind, self.scale, self.asset)
    }
}

/// (shape, currency) key of a strategy. The shape carries its own scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct StrategyKey {
    pub kind: StrategyKind,
    pub asset: Asset,
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;

    #[test]
    fn test_create_then_fetch() {
        let mut reg: Registry<CalculatorKey, u32> = Registry::new();
        let key = CalculatorKey { kind: CalculatorKind::OtmCall, asset: Asset::Eth, scale: 110 };

        let first = reg.create_or_fetch(key, || Ok(1)).unwrap();
        assert!(first.was_created());

        let second = reg.create_or_fetch(key, || Ok(2)).unwrap();
        assert_eq!(second, Registered::Existing(1));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_failed_build_not_inserted() {
        let mut reg: Registry<CalculatorKey, u32> = Registry::new();
        let key = CalculatorKey { kind: CalculatorKind::Call, asset: Asset::Btc, scale: 100 };
        let res = reg.create_or_fetch(key, || Err(EngineError::Config("boom".into())));
        assert!(res.is_err());
        assert!(!reg.contains(&key));
    }

    #[test]
    fn test_key_names() {
        let key = CalculatorKey { kind: CalculatorKind::OtmCall, asset: Asset::Eth, scale: 110 };
        assert_eq!(key.to_string(), "otm_call-110-eth");

        let strategy = StrategyKey {
            kind: StrategyKind::CallSpread { width_percent: 10 },
            asset: Asset::Btc,
        };
        assert_eq!(strategy.to_string(), "call_spread_10-btc");
    }
}
