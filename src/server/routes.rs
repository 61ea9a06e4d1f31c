use crate::db;
use crate::errors::{EngineError, EngineResult};
use crate::server::auth::{Admin, Caller};
use crate::state::{AccountId, AppState, Asset, Command, EngineEvent, EngineSnapshot, Outcome, PositionId, PriceTick};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(serde::Deserialize)]
pub struct PositionsQuery {
    pub holder: Option<String>,
    pub limit: Option<usize>,
}

#[derive(serde::Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(serde::Deserialize)]
pub struct PricesQuery {
    pub asset: Asset,
    pub limit: Option<usize>,
}

// ── Request bodies ──
// The acting account comes from the bearer token, never from the body.

#[derive(serde::Deserialize)]
pub struct PriceRequest {
    pub asset: Asset,
    pub price: u128,
    /// Defaults to the time of receipt
    pub timestamp: Option<i64>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuyRequest {
    pub strategy: String,
    pub period: u64,
    pub size: u128,
    pub acceptable_price: u128,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExerciseRequest {
    pub position: PositionId,
}

#[derive(serde::Deserialize)]
pub struct UnlockRequest {
    pub position: PositionId,
}

#[derive(serde::Deserialize)]
pub struct FundRequest {
    pub account: AccountId,
    pub amount: u128,
}

#[derive(serde::Deserialize)]
pub struct AmountRequest {
    pub amount: u128,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreasuryWithdrawRequest {
    pub to: AccountId,
    pub amount: u128,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvideRequest {
    pub amount: u128,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StakeWithdrawRequest {
    pub shares: u128,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferShareRequest {
    pub to: AccountId,
    pub shares: u128,
}

// ── Reads ──

/// GET /api/state -- current engine snapshot (from watch channel, no lock)
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<EngineSnapshot> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(snapshot)
}

/// GET /api/positions/{id} -- live position, answered by the engine task
pub async fn get_position(State(state): State<Arc<AppState>>, Path(id): Path<PositionId>) -> Response {
    let (reply, rx) = oneshot::channel();
    respond(ask(&state, EngineEvent::GetPosition { id, reply }, rx).await)
}

/// GET /api/positions -- position journal from DB (cold path)
pub async fn get_positions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PositionsQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(50).min(500);
    match db::get_positions(&state.db, params.holder.as_deref(), limit) {
        Ok(positions) => Json(serde_json::json!({ "positions": positions })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// GET /api/ledger -- treasury/insurance snapshot series from DB (cold path)
pub async fn get_ledger(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(500).min(5000);
    match db::get_ledger_series(&state.db, limit) {
        Ok(series) => Json(serde_json::json!({ "series": series })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// GET /api/prices -- recorded ticks for one asset
pub async fn get_prices(State(state): State<Arc<AppState>>, Query(params): Query<PricesQuery>) -> Response {
    let limit = params.limit.unwrap_or(500).min(5000);
    respond(db::get_price_ticks(&state.db, &params.asset.to_string(), limit))
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    use portable_atomic::Ordering::Relaxed;
    let c = &state.counters;
    Json(serde_json::json!({
        "network": state.config.network,
        "ticks_processed": c.ticks_processed.load(Relaxed),
        "prices_received": c.prices_received.load(Relaxed),
        "commands_processed": c.commands_processed.load(Relaxed),
        "commands_rejected": c.commands_rejected.load(Relaxed),
        "positions_opened": c.positions_opened.load(Relaxed),
        "positions_exercised": c.positions_exercised.load(Relaxed),
        "positions_unlocked": c.positions_unlocked.load(Relaxed),
        "errors_recovered": c.errors_recovered.load(Relaxed),
        "ws_messages_sent": c.ws_messages_sent.load(Relaxed),
    }))
}

// ── Writes (everything goes through the engine channel) ──

/// POST /api/price -- push a spot observation (admin)
pub async fn post_price(
    State(state): State<Arc<AppState>>,
    Admin(_): Admin,
    Json(req): Json<PriceRequest>,
) -> Response {
    let tick = PriceTick {
        asset: req.asset,
        price: req.price,
        timestamp: req.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp()),
    };
    match state.engine_tx.send(EngineEvent::Price(tick)).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "accepted": true }))).into_response(),
        Err(_) => respond::<()>(Err(EngineError::ChannelClosed("engine".into()))),
    }
}

/// POST /api/buy
pub async fn post_buy(
    State(state): State<Arc<AppState>>,
    Caller(holder): Caller,
    Json(req): Json<BuyRequest>,
) -> Response {
    command(
        &state,
        Command::Buy {
            holder,
            strategy: req.strategy,
            period: req.period,
            size: req.size,
            acceptable_price: req.acceptable_price,
        },
    )
    .await
}

/// POST /api/exercise
pub async fn post_exercise(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<ExerciseRequest>,
) -> Response {
    command(&state, Command::Exercise { caller, position: req.position }).await
}

/// POST /api/unlock
pub async fn post_unlock(State(state): State<Arc<AppState>>, Json(req): Json<UnlockRequest>) -> Response {
    command(&state, Command::Unlock { position: req.position }).await
}

/// POST /api/unlock_expired -- run the expiry sweep now
pub async fn post_unlock_expired(State(state): State<Arc<AppState>>) -> Response {
    command(&state, Command::UnlockExpired).await
}

/// POST /api/fund -- mint settlement tokens to a user (admin faucet)
pub async fn post_fund(
    State(state): State<Arc<AppState>>,
    Admin(caller): Admin,
    Json(req): Json<FundRequest>,
) -> Response {
    command(&state, Command::Fund { caller, account: req.account, amount: req.amount }).await
}

/// POST /api/treasury/fund -- mint into the treasury balance (admin)
pub async fn post_treasury_fund(
    State(state): State<Arc<AppState>>,
    Admin(caller): Admin,
    Json(req): Json<AmountRequest>,
) -> Response {
    command(&state, Command::FundTreasury { caller, amount: req.amount }).await
}

/// POST /api/treasury/replenish
pub async fn post_replenish(State(state): State<Arc<AppState>>) -> Response {
    command(&state, Command::Replenish).await
}

/// POST /api/treasury/withdraw (admin)
pub async fn post_treasury_withdraw(
    State(state): State<Arc<AppState>>,
    Admin(caller): Admin,
    Json(req): Json<TreasuryWithdrawRequest>,
) -> Response {
    command(&state, Command::TreasuryWithdraw { caller, to: req.to, amount: req.amount }).await
}

/// POST /api/insurance/provide
pub async fn post_provide(
    State(state): State<Arc<AppState>>,
    Caller(holder): Caller,
    Json(req): Json<ProvideRequest>,
) -> Response {
    command(&state, Command::Provide { holder, amount: req.amount }).await
}

/// POST /api/insurance/withdraw
pub async fn post_stake_withdraw(
    State(state): State<Arc<AppState>>,
    Caller(holder): Caller,
    Json(req): Json<StakeWithdrawRequest>,
) -> Response {
    command(&state, Command::WithdrawStake { holder, shares: req.shares }).await
}

/// POST /api/insurance/claim
pub async fn post_claim(State(state): State<Arc<AppState>>, Caller(holder): Caller) -> Response {
    command(&state, Command::ClaimProfit { holder }).await
}

/// POST /api/insurance/transfer -- move the caller's own shares
pub async fn post_transfer_share(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<TransferShareRequest>,
) -> Response {
    let from = caller.clone();
    command(&state, Command::TransferShare { caller, from, to: req.to, shares: req.shares }).await
}

// ── Plumbing ──

async fn command(state: &AppState, command: Command) -> Response {
    let (reply, rx) = oneshot::channel();
    respond::<Outcome>(ask(state, EngineEvent::Command { command, reply }, rx).await)
}

/// Send an event carrying a oneshot and wait for the engine's answer.
async fn ask<T>(
    state: &AppState,
    event: EngineEvent,
    rx: oneshot::Receiver<EngineResult<T>>,
) -> EngineResult<T> {
    state
        .engine_tx
        .send(event)
        .await
        .map_err(|_| EngineError::ChannelClosed("engine".into()))?;
    rx.await.map_err(|_| EngineError::ChannelClosed("engine reply".into()))?
}

fn respond<T: serde::Serialize>(result: EngineResult<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => (status_of(&e), Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}

fn status_of(e: &EngineError) -> StatusCode {
    match e {
        EngineError::PositionNotFound(_) | EngineError::UnknownStrategy(_) => StatusCode::NOT_FOUND,
        EngineError::Unauthorized(_) => StatusCode::FORBIDDEN,
        EngineError::Network(_)
        | EngineError::Database(_)
        | EngineError::Config(_)
        | EngineError::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::ChannelClosed(_) | EngineError::StateCorruption(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}
