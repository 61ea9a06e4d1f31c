use crate::engine::Engine;
use crate::errors::{EngineError, EngineResult};
use crate::state::*;
use crate::strategy::position::{Position, PositionState};
use portable_atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Engine task. Owns the book; every command is applied here, one at a time,
/// and answered over its oneshot. No locks, no IO inside a transition.
pub async fn run_engine(state: Arc<AppState>, mut engine: Engine, mut rx: mpsc::Receiver<EngineEvent>) {
    tracing::info!(
        network = %engine.deployment().network,
        strategies = engine.deployment().strategies.len(),
        "engine task started"
    );

    let mut engine_state = EngineState::Syncing;
    publish(&state, &engine, engine_state);

    while let Some(event) = rx.recv().await {
        let shutdown = matches!(event, EngineEvent::Shutdown);
        let result = process_event(event, &mut engine, &mut engine_state, &state).await;

        if let Err(e) = result {
            tracing::error!(error = %e, "engine error");
            state.counters.errors_recovered.fetch_add(1, Ordering::Relaxed);

            // On unrecoverable state corruption, halt
            if matches!(e, EngineError::StateCorruption(_)) {
                engine_state = EngineState::Halted;
                state.broadcast(WsMessage::EngineStateMsg {
                    state: engine_state.to_string(),
                    reason: e.to_string(),
                });
                publish(&state, &engine, engine_state);
                tracing::error!("ENGINE HALTED: {e}");
            }
        }

        if shutdown {
            break;
        }
    }

    tracing::info!("engine task shutting down");
}

async fn process_event(
    event: EngineEvent,
    engine: &mut Engine,
    engine_state: &mut EngineState,
    state: &Arc<AppState>,
) -> EngineResult<()> {
    match event {
        EngineEvent::Price(tick) => {
            state.counters.prices_received.fetch_add(1, Ordering::Relaxed);
            if !engine.update_price(tick) {
                return Ok(());
            }

            if *engine_state == EngineState::Syncing {
                *engine_state = EngineState::Active;
                tracing::info!(asset = %tick.asset, price = tick.price, "first price received, entering Active");
                state.broadcast(WsMessage::EngineStateMsg {
                    state: engine_state.to_string(),
                    reason: "first price received".into(),
                });
            }

            state.broadcast(WsMessage::Price {
                asset: tick.asset,
                price: tick.price,
                timestamp: rfc3339(tick.timestamp),
            });
            let _ = state.db_tx.send(DbCommand::InsertPriceTick(tick)).await;
            publish(state, engine, *engine_state);
        }

        EngineEvent::Command { command, reply } => {
            if *engine_state == EngineState::Halted {
                let _ = reply.send(Err(EngineError::StateCorruption("engine halted".into())));
                return Ok(());
            }

            let name = command.name();
            let now = chrono::Utc::now().timestamp();
            match engine.apply(command, now) {
                Ok(outcome) => {
                    state.counters.commands_processed.fetch_add(1, Ordering::Relaxed);
                    announce(state, engine, &outcome).await;
                    publish(state, engine, *engine_state);
                    let _ = reply.send(Ok(outcome));
                }
                Err(EngineError::StateCorruption(reason)) => {
                    let _ = reply.send(Err(EngineError::StateCorruption(reason.clone())));
                    return Err(EngineError::StateCorruption(reason));
                }
                Err(e) => {
                    state.counters.commands_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(command = name, error = %e, "command rejected");
                    state.broadcast(WsMessage::CommandRejected {
                        command: name.to_string(),
                        error: e.to_string(),
                    });
                    let _ = reply.send(Err(e));
                }
            }
        }

        EngineEvent::GetPosition { id, reply } => {
            let _ = reply.send(engine.position(id));
        }

        EngineEvent::Tick => {
            state.counters.ticks_processed.fetch_add(1, Ordering::Relaxed);
            if *engine_state != EngineState::Active {
                return Ok(());
            }

            let now = chrono::Utc::now().timestamp();
            let sweep = engine.unlock_expired(now)?;
            for position in &sweep.unlocked {
                announce_position(state, position).await;
            }
            if !sweep.failed.is_empty() {
                tracing::warn!(failed = sweep.failed.len(), "expiry sweep had failures");
            }

            let replenished = match engine.replenish() {
                Ok(amount) => amount,
                Err(EngineError::StateCorruption(reason)) => {
                    return Err(EngineError::StateCorruption(reason));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "replenish failed");
                    0
                }
            };

            let snapshot = engine.ledger_snapshot();
            if !sweep.unlocked.is_empty() || replenished > 0 {
                state.broadcast(WsMessage::Ledger(snapshot.clone()));
            }
            let _ = state
                .db_tx
                .send(DbCommand::InsertLedgerSnapshot {
                    timestamp: rfc3339(now),
                    snapshot: Box::new(snapshot),
                })
                .await;
            publish(state, engine, *engine_state);
        }

        EngineEvent::Shutdown => {
            tracing::info!("shutdown event received");
            *engine_state = EngineState::Halted;
        }
    }

    Ok(())
}

/// Broadcast and journal the effects of a committed command.
async fn announce(state: &Arc<AppState>, engine: &Engine, outcome: &Outcome) {
    match outcome {
        Outcome::Position(position) | Outcome::Exercised { position, .. } => {
            announce_position(state, position).await;
        }
        Outcome::Sweep { unlocked, .. } => {
            for id in unlocked {
                if let Ok(position) = engine.position(*id) {
                    announce_position(state, &position).await;
                }
            }
        }
        Outcome::Amount { .. } | Outcome::Shares { .. } | Outcome::Done => {}
    }
    state.broadcast(WsMessage::Ledger(engine.ledger_snapshot()));
}

async fn announce_position(state: &Arc<AppState>, position: &Position) {
    let msg = match position.state {
        PositionState::Active => {
            state.counters.positions_opened.fetch_add(1, Ordering::Relaxed);
            WsMessage::PositionOpened {
                id: position.id,
                strategy: position.strategy.to_string(),
                holder: position.holder.clone(),
                strike: position.strike,
                premium: position.locked_premium,
                locked_amount: position.locked_amount,
                expiration: position.expiration,
            }
        }
        PositionState::Exercised { payoff, .. } => {
            state.counters.positions_exercised.fetch_add(1, Ordering::Relaxed);
            WsMessage::PositionExercised {
                id: position.id,
                holder: position.holder.clone(),
                payoff,
            }
        }
        PositionState::Unlocked { .. } => {
            state.counters.positions_unlocked.fetch_add(1, Ordering::Relaxed);
            WsMessage::PositionUnlocked {
                id: position.id,
                released: position.locked_amount + position.locked_premium,
            }
        }
    };
    state.broadcast(msg);
    let _ = state.db_tx.send(DbCommand::from(position)).await;
}

#[inline]
fn publish(state: &AppState, engine: &Engine, engine_state: EngineState) {
    let _ = state
        .snapshot_tx
        .send(engine.snapshot(engine_state, chrono::Utc::now().timestamp()));
}

fn rfc3339(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db;
    use crate::engine::Accounts;
    use crate::params::{ParamTable, DEFAULT_NETWORK};
    use tokio::sync::oneshot;

    const ETH: u128 = 1_000_000_000_000_000_000;
    const USDC: u128 = 1_000_000;

    fn engine() -> Engine {
        let table = ParamTable::from_json(include_str!("../../params/hegic.json")).unwrap();
        let deployment = Arc::new(table.deploy(DEFAULT_NETWORK).unwrap());
        let accounts = Accounts {
            treasury: AccountId::from("treasury"),
            insurance: AccountId::from("insurance"),
            admin: AccountId::from("admin"),
        };
        let mut engine = Engine::new(deployment, accounts).unwrap();
        let admin = AccountId::from("admin");
        engine.fund_treasury(&admin, 10_000 * USDC).unwrap();
        engine.fund(&admin, &AccountId::from("alice"), 1_000 * USDC).unwrap();
        engine
    }

    async fn send(tx: &mpsc::Sender<EngineEvent>, command: Command) -> EngineResult<Outcome> {
        let (reply, rx) = oneshot::channel();
        tx.send(EngineEvent::Command { command, reply }).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_engine_task_round_trip() {
        let (engine_tx, engine_rx) = mpsc::channel(64);
        let (db_tx, db_rx) = mpsc::channel(64);
        let pool = db::open_in_memory().unwrap();
        let state = AppState::new(AppConfig::default(), pool.clone(), engine_tx.clone(), db_tx);
        tokio::spawn(db::run_db_writer(pool, db_rx));
        let mut ws_rx = state.ws_tx.subscribe();
        let task = tokio::spawn(run_engine(state.clone(), engine(), engine_rx));

        let tick = PriceTick { asset: Asset::Eth, price: 141_212_320_000, timestamp: chrono::Utc::now().timestamp() };
        engine_tx.send(EngineEvent::Price(tick)).await.unwrap();

        let buy = Command::Buy {
            holder: AccountId::from("alice"),
            strategy: "inverse_bear_call_spread_10-eth".into(),
            period: 7 * 86_400,
            size: 2 * ETH,
            acceptable_price: u128::MAX,
        };
        let position = match send(&engine_tx, buy).await.unwrap() {
            Outcome::Position(p) => p,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(position.id, 0);
        assert_eq!(state.snapshot_rx.borrow().active_positions, 1);
        assert_eq!(state.snapshot_rx.borrow().engine_state, EngineState::Active);

        let stranger = Command::Exercise { caller: AccountId::from("mallory"), position: 0 };
        assert!(matches!(send(&engine_tx, stranger).await, Err(EngineError::Unauthorized(_))));
        assert_eq!(state.counters.commands_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(state.counters.positions_opened.load(Ordering::Relaxed), 1);

        let (reply, rx) = oneshot::channel();
        engine_tx.send(EngineEvent::GetPosition { id: 0, reply }).await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap().holder, AccountId::from("alice"));

        engine_tx.send(EngineEvent::Shutdown).await.unwrap();
        task.await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(msg) = ws_rx.try_recv() {
            kinds.push(serde_json::to_value(&msg).unwrap()["type"].as_str().unwrap_or_default().to_string());
        }
        assert!(kinds.iter().any(|k| k == "position_opened"));
        assert!(kinds.iter().any(|k| k == "command_rejected"));
    }

    #[tokio::test]
    async fn test_commands_rejected_before_first_price_are_not_halting() {
        let (engine_tx, engine_rx) = mpsc::channel(8);
        let (db_tx, _db_rx) = mpsc::channel(8);
        let state = AppState::new(AppConfig::default(), db::open_in_memory().unwrap(), engine_tx.clone(), db_tx);
        let task = tokio::spawn(run_engine(state.clone(), engine(), engine_rx));

        let buy = Command::Buy {
            holder: AccountId::from("alice"),
            strategy: "call-eth".into(),
            period: 7 * 86_400,
            size: ETH,
            acceptable_price: u128::MAX,
        };
        assert!(matches!(send(&engine_tx, buy).await, Err(EngineError::MissingPrice(Asset::Eth))));
        assert_eq!(state.snapshot_rx.borrow().engine_state, EngineState::Syncing);

        engine_tx.send(EngineEvent::Shutdown).await.unwrap();
        task.await.unwrap();
    }
}
