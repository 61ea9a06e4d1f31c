use crate::errors::{EngineError, EngineResult};
use crate::state::{DbCommand, LedgerSnapshot, PriceTick};
use crate::strategy::position::{Position, PositionState};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type DbPool = Arc<Mutex<Connection>>;

const SCHEMA: &str = include_str!("../migrations/001_init.sql");

pub fn init_db(data_dir: &Path) -> EngineResult<DbPool> {
    std::fs::create_dir_all(data_dir).map_err(|e| EngineError::Database(format!("create dir: {e}")))?;
    let db_path = data_dir.join("hegic_engine.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA cache_size=-64000;")?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("database initialized at {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// Schema-initialised in-memory journal.
#[cfg(test)]
pub fn open_in_memory() -> EngineResult<DbPool> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Dedicated DB writer task. Reads commands from bounded channel, executes SQL.
/// This is the ONLY task that writes to the database connection.
pub async fn run_db_writer(db: DbPool, mut rx: mpsc::Receiver<DbCommand>) {
    tracing::info!("db writer task started");

    while let Some(cmd) = rx.recv().await {
        if let Err(e) = execute_command(&db, cmd) {
            tracing::error!("db write error: {e}");
        }
    }

    tracing::info!("db writer task shutting down");
}

pub fn execute_command(db: &DbPool, cmd: DbCommand) -> EngineResult<()> {
    let conn = db.lock().map_err(|e| EngineError::Database(format!("lock poisoned: {e}")))?;

    match cmd {
        DbCommand::InsertPriceTick(tick) => {
            conn.execute(
                "INSERT INTO price_ticks (asset, price, timestamp) VALUES (?1, ?2, ?3)",
                rusqlite::params![tick.asset.to_string(), tick.price.to_string(), tick.timestamp],
            )?;
        }
        DbCommand::UpsertPosition(position) => {
            let (payoff, closed_at) = match position.state {
                PositionState::Active => (None, None),
                PositionState::Exercised { payoff, exercised_at } => {
                    (Some(payoff.to_string()), Some(exercised_at))
                }
                PositionState::Unlocked { unlocked_at } => (None, Some(unlocked_at)),
            };
            conn.execute(
                "INSERT INTO positions (id, strategy, holder, strike, size, period, created_at, expiration, locked_amount, locked_premium, max_payout, state, payoff, closed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state, payoff = excluded.payoff,
                    closed_at = excluded.closed_at, updated_at = excluded.updated_at",
                rusqlite::params![
                    position.id as i64,
                    position.strategy.to_string(),
                    position.holder.to_string(),
                    position.strike.to_string(),
                    position.size.to_string(),
                    position.period as i64,
                    position.created_at,
                    position.expiration,
                    position.locked_amount.to_string(),
                    position.locked_premium.to_string(),
                    position.max_payout.to_string(),
                    position.state.label(),
                    payoff,
                    closed_at,
                ],
            )?;
        }
        DbCommand::InsertLedgerSnapshot { timestamp, snapshot } => {
            conn.execute(
                "INSERT INTO ledger_snapshots (timestamp, total_balance, total_locked, locked_premium, available, insurance_balance, total_shares)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    timestamp,
                    snapshot.treasury.total_balance.to_string(),
                    snapshot.treasury.total_locked.to_string(),
                    snapshot.treasury.locked_premium.to_string(),
                    snapshot.treasury.available.to_string(),
                    snapshot.insurance.balance.to_string(),
                    snapshot.insurance.total_shares.to_string(),
                ],
            )?;
        }
    }
    Ok(())
}

// ── Query helpers (for server REST reads -- these DO lock, but only from cold path) ──

pub fn get_positions(db: &DbPool, holder: Option<&str>, limit: usize) -> EngineResult<Vec<PositionRow>> {
    let conn = db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
    let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match holder {
        Some(holder) => (
            "SELECT id, strategy, holder, strike, size, period, created_at, expiration, locked_amount, locked_premium, max_payout, state, payoff, closed_at FROM positions WHERE holder = ?1 ORDER BY id DESC LIMIT ?2".into(),
            vec![Box::new(holder.to_string()), Box::new(limit as i64)],
        ),
        None => (
            "SELECT id, strategy, holder, strike, size, period, created_at, expiration, locked_amount, locked_premium, max_payout, state, payoff, closed_at FROM positions ORDER BY id DESC LIMIT ?1".into(),
            vec![Box::new(limit as i64)],
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        Ok(PositionRow {
            id: row.get(0)?,
            strategy: row.get(1)?,
            holder: row.get(2)?,
            strike: row.get(3)?,
            size: row.get(4)?,
            period: row.get(5)?,
            created_at: row.get(6)?,
            expiration: row.get(7)?,
            locked_amount: row.get(8)?,
            locked_premium: row.get(9)?,
            max_payout: row.get(10)?,
            state: row.get(11)?,
            payoff: row.get(12)?,
            closed_at: row.get(13)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_ledger_series(db: &DbPool, limit: usize) -> EngineResult<Vec<LedgerRow>> {
    let conn = db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT timestamp, total_balance, total_locked, locked_premium, available, insurance_balance, total_shares FROM ledger_snapshots ORDER BY id DESC LIMIT ?1"
    )?;
    let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
        Ok(LedgerRow {
            timestamp: row.get(0)?,
            total_balance: row.get(1)?,
            total_locked: row.get(2)?,
            locked_premium: row.get(3)?,
            available: row.get(4)?,
            insurance_balance: row.get(5)?,
            total_shares: row.get(6)?,
        })
    })?;
    let mut series: Vec<_> = rows.filter_map(|r| r.ok()).collect();
    series.reverse();
    Ok(series)
}

pub fn get_price_ticks(db: &DbPool, asset: &str, limit: usize) -> EngineResult<Vec<PriceTick>> {
    let conn = db.lock().map_err(|e| EngineError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT asset, price, timestamp FROM price_ticks WHERE asset = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![asset, limit as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
    })?;
    let mut ticks = Vec::new();
    for row in rows {
        let (asset, price, timestamp) = row?;
        let asset = serde_json::from_value(serde_json::Value::String(asset))?;
        let price = price
            .parse::<u128>()
            .map_err(|e| EngineError::Database(format!("bad price {price}: {e}")))?;
        ticks.push(PriceTick { asset, price, timestamp });
    }
    ticks.reverse();
    Ok(ticks)
}

// ── Row types ──

/// Journal row. Fixed-point amounts stay decimal strings so JSON clients keep precision.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PositionRow {
    pub id: i64,
    pub strategy: String,
    pub holder: String,
    pub strike: String,
    pub size: String,
    pub period: i64,
    pub created_at: i64,
    pub expiration: i64,
    pub locked_amount: String,
    pub locked_premium: String,
    pub max_payout: String,
    pub state: String,
    pub payoff: Option<String>,
    pub closed_at: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LedgerRow {
    pub timestamp: String,
    pub total_balance: String,
    pub total_locked: String,
    pub locked_premium: String,
    pub available: String,
    pub insurance_balance: String,
    pub total_shares: String,
}

impl From<&Position> for DbCommand {
    fn from(position: &Position) -> Self {
        DbCommand::UpsertPosition(Box::new(position.clone()))
    }
}

impl From<LedgerSnapshot> for DbCommand {
    fn from(snapshot: LedgerSnapshot) -> Self {
        DbCommand::InsertLedgerSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            snapshot: Box::new(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StrategyKey;
    use crate::state::{AccountId, Asset};
    use crate::strategy::StrategyKind;

    fn position(state: PositionState) -> Position {
        Position {
            id: 4,
            strategy: StrategyKey { kind: StrategyKind::Strap, asset: Asset::Eth },
            holder: AccountId::from("alice"),
            strike: 141_212_320_000,
            size: 2_000_000_000_000_000_000,
            period: 604_800,
            created_at: 1_700_000_000,
            expiration: 1_700_604_800,
            locked_amount: 1_412_123_200,
            locked_premium: 120_180_702,
            max_payout: 1_412_123_200,
            state,
        }
    }

    #[test]
    fn test_position_upsert_tracks_state() {
        let db = open_in_memory().unwrap();
        let open = position(PositionState::Active);
        execute_command(&db, DbCommand::from(&open)).unwrap();
        let closed = position(PositionState::Exercised { payoff: 99, exercised_at: 1_700_000_900 });
        execute_command(&db, DbCommand::from(&closed)).unwrap();

        let rows = get_positions(&db, Some("alice"), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "exercised");
        assert_eq!(rows[0].payoff.as_deref(), Some("99"));
        assert_eq!(rows[0].size, "2000000000000000000");
        assert_eq!(rows[0].strategy, "strap-eth");
    }

    #[test]
    fn test_price_ticks_round_trip_u128() {
        let db = open_in_memory().unwrap();
        for (i, price) in [141_212_320_000u128, 141_300_000_000].into_iter().enumerate() {
            let tick = PriceTick { asset: Asset::Eth, price, timestamp: i as i64 };
            execute_command(&db, DbCommand::InsertPriceTick(tick)).unwrap();
        }
        let ticks = get_price_ticks(&db, "eth", 10).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1].price, 141_300_000_000);
    }

    #[test]
    fn test_ledger_series_oldest_first() {
        let db = open_in_memory().unwrap();
        let mut snapshot = LedgerSnapshot::default();
        snapshot.treasury.total_balance = 1;
        execute_command(&db, DbCommand::from(snapshot.clone())).unwrap();
        snapshot.treasury.total_balance = 2;
        execute_command(&db, DbCommand::from(snapshot)).unwrap();
        let series = get_ledger_series(&db, 10).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].total_balance, "1");
    }
}
