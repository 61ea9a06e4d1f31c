use crate::errors::{EngineError, EngineResult};
use crate::pricing::combine::CombinePriceCalculator;
use crate::pricing::fixed::{Units, FEED_DECIMALS};
use crate::pricing::polynomial::{Curve, PolynomialPriceCalculator, ScaledPolynomialPriceCalculator};
use crate::pricing::{PeriodBounds, PriceCalculator};
use crate::registry::{CalculatorKey, Registry, StrategyKey};
use crate::state::Asset;
use crate::strategy::{Strategy, StrategyKind};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Network that uses the table's own combine weights.
pub const DEFAULT_NETWORK: &str = "default";

/// Deployment parameter table, loaded from JSON.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ParamTable {
    pub token_decimals: u32,
    /// Treasury balance the insurance pool tops up to
    pub benchmark: u128,
    pub calculators: Vec<CalculatorSpec>,
    pub strategies: Vec<StrategySpec>,
    #[serde(default)]
    pub networks: HashMap<String, NetworkOverrides>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CalculatorSpec {
    pub key: CalculatorKey,
    pub model: CalculatorModel,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculatorModel {
    Polynomial {
        coefficients: [i128; 5],
        period: PeriodBounds,
    },
    /// OTM leg; the strike percent is the key's scale
    Scaled {
        coefficients: [i128; 5],
        discount: [i128; 5],
        rounded_decimals: u32,
        period: PeriodBounds,
    },
    Combine {
        legs: [CalculatorKey; 2],
        weights: [i128; 2],
    },
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StrategySpec {
    pub kind: StrategyKind,
    pub asset: Asset,
    pub calculator: CalculatorKey,
    pub limit: u128,
    #[serde(default = "default_collateral_percent")]
    pub collateral_percent: u32,
    #[serde(default)]
    pub exercise_delay: i64,
}

fn default_collateral_percent() -> u32 {
    100
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NetworkOverrides {
    #[serde(default)]
    pub weights: Vec<WeightOverride>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WeightOverride {
    pub calculator: CalculatorKey,
    pub weights: [i128; 2],
}

/// Resolved calculators and strategies for one network.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub network: String,
    pub benchmark: u128,
    pub strategies: Registry<StrategyKey, Arc<Strategy>>,
    names: BTreeMap<String, StrategyKey>,
}

impl Deployment {
    pub fn strategy(&self, key: &StrategyKey) -> EngineResult<&Arc<Strategy>> {
        self.strategies
            .get(key)
            .ok_or_else(|| EngineError::UnknownStrategy(key.to_string()))
    }

    /// Look a strategy up by its display name, e.g. `call_spread_10-eth`.
    pub fn strategy_by_name(&self, name: &str) -> EngineResult<&Arc<Strategy>> {
        let key = self
            .names
            .get(name)
            .ok_or_else(|| EngineError::UnknownStrategy(name.to_string()))?;
        self.strategy(key)
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.names.keys().cloned().collect()
    }
}

impl ParamTable {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn units(&self, asset: Asset) -> Units {
        Units {
            spot_decimals: FEED_DECIMALS,
            size_decimals: asset.size_decimals(),
            token_decimals: self.token_decimals,
        }
    }

    /// Build every calculator and strategy for `network`.
    ///
    /// Combine calculators may reference other combines; resolution repeats
    /// until every entry is built or a pass makes no progress.
    pub fn deploy(&self, network: &str) -> EngineResult<Deployment> {
        let overrides: HashMap<CalculatorKey, [i128; 2]> = match self.networks.get(network) {
            Some(o) => o.weights.iter().map(|w| (w.calculator, w.weights)).collect(),
            None => {
                if network != DEFAULT_NETWORK {
                    tracing::warn!(network, "no overrides for network, using default weights");
                }
                HashMap::new()
            }
        };

        let mut calculators: Registry<CalculatorKey, Arc<dyn PriceCalculator>> = Registry::new();
        let mut pending: Vec<&CalculatorSpec> = self.calculators.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();

            for spec in pending {
                let ready = match &spec.model {
                    CalculatorModel::Combine { legs, .. } => legs.iter().all(|l| calculators.contains(l)),
                    _ => true,
                };
                if !ready {
                    deferred.push(spec);
                    continue;
                }
                if calculators.contains(&spec.key) {
                    tracing::warn!(calculator = %spec.key, "duplicate calculator spec ignored");
                    continue;
                }
                let calc = self.build_calculator(spec, &calculators, &overrides)?;
                let bounds = calc.period_bounds();
                let name = calc.name().to_string();
                if calculators.create_or_fetch(spec.key, || Ok(calc))?.was_created() {
                    tracing::debug!(calculator = %name, min = bounds.min, max = bounds.max, "calculator built");
                }
            }

            if deferred.len() == before {
                let missing: Vec<String> = deferred.iter().map(|s| s.key.to_string()).collect();
                return Err(EngineError::Config(format!(
                    "unresolvable calculators: {}",
                    missing.join(", ")
                )));
            }
            pending = deferred;
        }

        let mut strategies: Registry<StrategyKey, Arc<Strategy>> = Registry::new();
        let mut names = BTreeMap::new();
        for spec in &self.strategies {
            spec.kind.validate()?;
            let key = StrategyKey { kind: spec.kind, asset: spec.asset };
            let calculator = calculators
                .get(&spec.calculator)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Config(format!("{key}: unknown calculator {}", spec.calculator))
                })?;
            if spec.calculator.asset != spec.asset {
                return Err(EngineError::Config(format!(
                    "{key}: calculator {} prices another asset",
                    spec.calculator
                )));
            }
            let (kind, scale) = spec.kind.calculator_shape();
            if spec.calculator.kind != kind || spec.calculator.scale != scale {
                return Err(EngineError::Config(format!(
                    "{key}: calculator {} does not price this shape, expected {kind} at {scale}",
                    spec.calculator
                )));
            }
            if spec.exercise_delay < 0 {
                return Err(EngineError::Config(format!(
                    "{key}: negative exercise delay {}",
                    spec.exercise_delay
                )));
            }
            let strategy = Strategy {
                key,
                units: self.units(spec.asset),
                calculator,
                limit: spec.limit,
                collateral_percent: spec.collateral_percent,
                exercise_delay: spec.exercise_delay,
            };
            strategies.create_or_fetch(key, || Ok(Arc::new(strategy)))?;
            names.insert(key.to_string(), key);
        }

        tracing::info!(
            network,
            calculators = calculators.len(),
            strategies = strategies.len(),
            "deployment resolved"
        );

        Ok(Deployment {
            network: network.to_string(),
            benchmark: self.benchmark,
            strategies,
            names,
        })
    }

    fn build_calculator(
        &self,
        spec: &CalculatorSpec,
        resolved: &Registry<CalculatorKey, Arc<dyn PriceCalculator>>,
        overrides: &HashMap<CalculatorKey, [i128; 2]>,
    ) -> EngineResult<Arc<dyn PriceCalculator>> {
        let name = spec.key.to_string();
        let units = self.units(spec.key.asset);
        let calc: Arc<dyn PriceCalculator> = match &spec.model {
            CalculatorModel::Polynomial { coefficients, period } => Arc::new(
                PolynomialPriceCalculator::new(name, Curve::new(*coefficients), *period, units),
            ),
            CalculatorModel::Scaled { coefficients, discount, rounded_decimals, period } => {
                Arc::new(ScaledPolynomialPriceCalculator::new(
                    name,
                    Curve::new(*coefficients),
                    Curve::new(*discount),
                    spec.key.scale,
                    *rounded_decimals,
                    *period,
                    units,
                ))
            }
            CalculatorModel::Combine { legs, weights } => {
                let leg = |key: &CalculatorKey| {
                    resolved.get(key).cloned().ok_or_else(|| {
                        EngineError::Config(format!("{name}: unresolved leg {key}"))
                    })
                };
                let legs = [leg(&legs[0])?, leg(&legs[1])?];
                let weights = overrides.get(&spec.key).copied().unwrap_or(*weights);
                Arc::new(CombinePriceCalculator::new(name, legs, weights))
            }
        };
        Ok(calc)
    }
}
