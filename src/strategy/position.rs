use crate::registry::StrategyKey;
use crate::state::{AccountId, PositionId};

/// Lifecycle of an option: Active -> (Exercised | Unlocked), never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PositionState {
    Active,
    Exercised { payoff: u128, exercised_at: i64 },
    Unlocked { unlocked_at: i64 },
}

impl PositionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Exercised { .. } => "exercised",
            Self::Unlocked { .. } => "unlocked",
        }
    }
}

/// An option position. Strike is the spot captured at buy time (or the
/// calculator's OTM strike for single-leg OTM strategies).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub strategy: StrategyKey,
    pub holder: AccountId,
    pub strike: u128,
    pub size: u128,
    pub period: u64,
    pub created_at: i64,
    pub expiration: i64,
    pub locked_amount: u128,
    pub locked_premium: u128,
    /// Payoff cap: locked amount, plus the premium for inverse spreads
    pub max_payout: u128,
    pub state: PositionState,
}

impl Position {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == PositionState::Active
    }

    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expiration
    }
}
