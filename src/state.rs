use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::EngineResult;
use crate::ledger::{InsuranceSnapshot, TreasurySnapshot};
use crate::strategy::position::Position;
use portable_atomic::{AtomicU64, Ordering};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

// ── Domain primitives ──

pub type PositionId = u64;

/// Opaque account identifier (holder, pool, admin).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Underlying asset of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Eth,
    Btc,
}

impl Asset {
    pub const ALL: [Asset; 2] = [Asset::Eth, Asset::Btc];

    /// Decimals of a position size in this asset.
    #[inline]
    pub fn size_decimals(&self) -> u32 {
        match self {
            Self::Eth => 18,
            Self::Btc => 8,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eth => "ETH",
            Self::Btc => "BTC",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eth => write!(f, "eth"),
            Self::Btc => write!(f, "btc"),
        }
    }
}

/// Spot price observation, 8 decimals, unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PriceTick {
    pub asset: Asset,
    pub price: u128,
    pub timestamp: i64,
}

// ── Engine State Machine ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Waiting for the first price tick
    Syncing,
    Active,
    Halted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syncing => write!(f, "syncing"),
            Self::Active => write!(f, "active"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

// ── Commands INTO the engine ──

/// State-changing request. Every command runs as one all-or-nothing transaction.
#[derive(Debug, Clone)]
pub enum Command {
    Buy {
        holder: AccountId,
        strategy: String,
        period: u64,
        size: u128,
        acceptable_price: u128,
    },
    Exercise {
        caller: AccountId,
        position: PositionId,
    },
    Unlock {
        position: PositionId,
    },
    UnlockExpired,
    /// Mint to a user account (test network faucet)
    Fund {
        caller: AccountId,
        account: AccountId,
        amount: u128,
    },
    /// Mint straight into the treasury balance
    FundTreasury {
        caller: AccountId,
        amount: u128,
    },
    Replenish,
    TreasuryWithdraw {
        caller: AccountId,
        to: AccountId,
        amount: u128,
    },
    Provide {
        holder: AccountId,
        amount: u128,
    },
    WithdrawStake {
        holder: AccountId,
        shares: u128,
    },
    ClaimProfit {
        holder: AccountId,
    },
    TransferShare {
        caller: AccountId,
        from: AccountId,
        to: AccountId,
        shares: u128,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Buy { .. } => "buy",
            Self::Exercise { .. } => "exercise",
            Self::Unlock { .. } => "unlock",
            Self::UnlockExpired => "unlock_expired",
            Self::Fund { .. } => "fund",
            Self::FundTreasury { .. } => "fund_treasury",
            Self::Replenish => "replenish",
            Self::TreasuryWithdraw { .. } => "treasury_withdraw",
            Self::Provide { .. } => "provide",
            Self::WithdrawStake { .. } => "withdraw_stake",
            Self::ClaimProfit { .. } => "claim_profit",
            Self::TransferShare { .. } => "transfer_share",
        }
    }
}

/// Per-position result of an expiry sweep.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SweepFailure {
    pub position: PositionId,
    pub error: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Position(Position),
    Exercised { position: Position, payoff: u128 },
    Amount { amount: u128 },
    Shares { shares: u128 },
    Sweep {
        unlocked: SmallVec<[PositionId; 8]>,
        failed: Vec<SweepFailure>,
        replenished: u128,
    },
    Done,
}

pub type Reply<T> = oneshot::Sender<EngineResult<T>>;

#[derive(Debug)]
pub enum EngineEvent {
    Price(PriceTick),
    Command { command: Command, reply: Reply<Outcome> },
    GetPosition { id: PositionId, reply: Reply<Position> },
    /// Periodic expiry sweep + replenish
    Tick,
    Shutdown,
}

// ── Messages OUT of the engine ──

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "price")]
    Price { asset: Asset, price: u128, timestamp: String },

    #[serde(rename = "position_opened")]
    PositionOpened {
        id: PositionId,
        strategy: String,
        holder: AccountId,
        strike: u128,
        premium: u128,
        locked_amount: u128,
        expiration: i64,
    },

    #[serde(rename = "position_exercised")]
    PositionExercised { id: PositionId, holder: AccountId, payoff: u128 },

    #[serde(rename = "position_unlocked")]
    PositionUnlocked { id: PositionId, released: u128 },

    #[serde(rename = "ledger")]
    Ledger(LedgerSnapshot),

    #[serde(rename = "command_rejected")]
    CommandRejected { command: String, error: String },

    #[serde(rename = "engine_state")]
    EngineStateMsg { state: String, reason: String },
}

// ── DB Commands (sent to writer task via bounded channel) ──

#[derive(Debug)]
pub enum DbCommand {
    InsertPriceTick(PriceTick),
    UpsertPosition(Box<Position>),
    InsertLedgerSnapshot { timestamp: String, snapshot: Box<LedgerSnapshot> },
}

// ── Snapshots (sent via watch channel) ──

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LedgerSnapshot {
    pub treasury: TreasurySnapshot,
    pub insurance: InsuranceSnapshot,
    pub token_supply: u128,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineSnapshot {
    pub engine_state: EngineState,
    pub prices: Vec<PriceTick>,
    pub ledger: LedgerSnapshot,
    pub active_positions: usize,
    pub next_position_id: PositionId,
    pub strategies: Vec<String>,
    pub updated_at: String,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            engine_state: EngineState::Syncing,
            prices: Vec::new(),
            ledger: LedgerSnapshot::default(),
            active_positions: 0,
            next_position_id: 0,
            strategies: Vec::new(),
            updated_at: String::new(),
        }
    }
}

// ── Performance Counters (lock-free) ──

pub struct PerfCounters {
    pub ticks_processed: AtomicU64,
    pub prices_received: AtomicU64,
    pub commands_processed: AtomicU64,
    pub commands_rejected: AtomicU64,
    pub positions_opened: AtomicU64,
    pub positions_exercised: AtomicU64,
    pub positions_unlocked: AtomicU64,
    pub errors_recovered: AtomicU64,
    pub ws_messages_sent: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            ticks_processed: AtomicU64::new(0),
            prices_received: AtomicU64::new(0),
            commands_processed: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            positions_opened: AtomicU64::new(0),
            positions_exercised: AtomicU64::new(0),
            positions_unlocked: AtomicU64::new(0),
            errors_recovered: AtomicU64::new(0),
            ws_messages_sent: AtomicU64::new(0),
        }
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ── Application shared state (channels, not locks) ──

pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,

    // Engine -> API: latest snapshot
    pub snapshot_tx: watch::Sender<EngineSnapshot>,
    pub snapshot_rx: watch::Receiver<EngineSnapshot>,

    // Engine -> WS clients: event stream
    pub ws_tx: broadcast::Sender<WsMessage>,

    // Feed/API -> Engine: bounded command channel
    pub engine_tx: mpsc::Sender<EngineEvent>,

    // Engine -> DB Writer: bounded command channel
    pub db_tx: mpsc::Sender<DbCommand>,

    pub counters: PerfCounters,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: DbPool,
        engine_tx: mpsc::Sender<EngineEvent>,
        db_tx: mpsc::Sender<DbCommand>,
    ) -> Arc<Self> {
        let (ws_tx, _) = broadcast::channel(2048);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::default());

        Arc::new(Self {
            config,
            db,
            snapshot_tx,
            snapshot_rx,
            ws_tx,
            engine_tx,
            db_tx,
            counters: PerfCounters::new(),
        })
    }

    #[inline]
    pub fn broadcast(&self, msg: WsMessage) {
        self.counters.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.ws_tx.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        let cmd = Command::Exercise { caller: AccountId::from("alice"), position: 3 };
        assert_eq!(cmd.name(), "exercise");
        assert_eq!(Command::UnlockExpired.name(), "unlock_expired");
    }

    #[test]
    fn test_asset_names() {
        assert_eq!(Asset::Eth.to_string(), "eth");
        assert_eq!(Asset::Btc.size_decimals(), 8);
        let tick: PriceTick = serde_json::from_str(r#"{"asset":"btc","price":3000000000000,"timestamp":1}"#).unwrap();
        assert_eq!(tick.asset, Asset::Btc);
    }
}
