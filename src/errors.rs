use crate::state::{AccountId, Asset, PositionId};

/// Domain-specific error types for the options engine.
/// Every rejection is synchronous and leaves the book untouched:
/// - Caller errors (bad period, zero profit, ...) are returned as-is
/// - Infrastructure errors are logged and the engine keeps running
/// - Ledger invariant violations halt the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("period too short: {period}s < {min}s")]
    PeriodTooShort { period: u64, min: u64 },

    #[error("period too long: {period}s > {max}s")]
    PeriodTooLong { period: u64, max: u64 },

    #[error("the limit is exceeded: {locked} locked + {requested} requested > {limit}")]
    LimitExceeded { locked: u128, requested: u128, limit: u128 },

    #[error("invalid strike = current price ({price})")]
    InvalidStrike { price: u128 },

    #[error("The profit is zero")]
    ZeroProfit,

    #[error("premium {premium} exceeds acceptable price {acceptable}")]
    PremiumTooHigh { premium: u128, acceptable: u128 },

    #[error("option {0} has expired")]
    AlreadyExpired(PositionId),

    #[error("option {0} has not expired yet")]
    NotExpired(PositionId),

    #[error("exercise not allowed before {unlocks_at}")]
    ExerciseTooEarly { unlocks_at: i64 },

    #[error("option {0} is closed")]
    PositionClosed(PositionId),

    #[error("option {0} not found")]
    PositionNotFound(PositionId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("insufficient balance: {account} has {available}, needs {required}")]
    InsufficientBalance { account: AccountId, available: u128, required: u128 },

    #[error("insufficient liquidity: {available} available, {required} required")]
    InsufficientLiquidity { available: u128, required: u128 },

    #[error("The claimable profit is zero")]
    ZeroClaimableProfit,

    #[error("no price for {0}")]
    MissingPrice(Asset),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("arithmetic overflow: {0}")]
    Overflow(&'static str),

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Parse(e.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
