mod config;
mod db;
mod engine;
mod errors;
mod feeds;
mod ledger;
mod params;
mod pricing;
mod registry;
mod server;
mod state;
mod strategy;

use crate::engine::{Accounts, Engine};
use crate::params::ParamTable;
use crate::state::*;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("hegic engine starting");

    // Load config
    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    // Parameter table -> calculators + strategies for this network
    let deployment = match ParamTable::load(&cfg.params_path).and_then(|t| t.deploy(&cfg.network)) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            tracing::error!("deployment error: {e}");
            std::process::exit(1);
        }
    };

    let accounts = Accounts {
        treasury: AccountId::from(cfg.treasury_account.as_str()),
        insurance: AccountId::from(cfg.insurance_account.as_str()),
        admin: AccountId::from(cfg.admin_account.as_str()),
    };
    let engine = match Engine::new(deployment, accounts) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("engine init error: {e}");
            std::process::exit(1);
        }
    };

    // Init database
    let db_pool = match db::init_db(&cfg.data_dir) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };

    // Create bounded channels
    let (engine_tx, engine_rx) = mpsc::channel::<EngineEvent>(512);
    let (db_tx, db_rx) = mpsc::channel::<DbCommand>(1024);

    let app_state = AppState::new(cfg.clone(), db_pool.clone(), engine_tx.clone(), db_tx.clone());

    // ── Spawn tasks ──

    // 1. DB writer task (dedicated, owns the DB connection for writes)
    let db_pool_writer = db_pool.clone();
    tokio::spawn(async move {
        db::run_db_writer(db_pool_writer, db_rx).await;
    });

    // 2. Spot price feed (optional; ticks can also be pushed over HTTP)
    if let Some(base_url) = cfg.price_api_base_url.clone() {
        let api_key = cfg.price_api_key.clone();
        let poll_secs = cfg.price_poll_secs;
        let feed_tx = engine_tx.clone();
        tokio::spawn(async move {
            feeds::price_api::run_price_feed(api_key, base_url, poll_secs, feed_tx).await;
        });
    } else {
        tracing::info!("PRICE_API_BASE_URL unset, price feed disabled");
    }

    // 3. Expiry sweep tick
    let tick_tx = engine_tx.clone();
    let sweep_secs = cfg.sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(sweep_secs));
        loop {
            interval.tick().await;
            if tick_tx.send(EngineEvent::Tick).await.is_err() {
                break;
            }
        }
    });

    // 4. Engine task (owns the book)
    let engine_state = app_state.clone();
    let engine_task = tokio::spawn(async move {
        engine::actor::run_engine(engine_state, engine, engine_rx).await;
    });

    // 5. Axum HTTP + WS server
    let app = router(app_state.clone());
    let addr = format!("0.0.0.0:{}", cfg.server_port);
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        tracing::error!("bind error: {e}");
        std::process::exit(1);
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received, shutting down");
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        tracing::error!("server error: {e}");
    }

    let _ = engine_tx.send(EngineEvent::Shutdown).await;
    let _ = engine_task.await;
}

fn router(state: Arc<AppState>) -> axum::Router {
    use server::routes;

    axum::Router::new()
        .route("/api/state", get(routes::get_state))
        .route("/api/positions", get(routes::get_positions))
        .route("/api/positions/{id}", get(routes::get_position))
        .route("/api/ledger", get(routes::get_ledger))
        .route("/api/prices", get(routes::get_prices))
        .route("/api/counters", get(routes::get_counters))
        .route("/api/price", post(routes::post_price))
        .route("/api/buy", post(routes::post_buy))
        .route("/api/exercise", post(routes::post_exercise))
        .route("/api/unlock", post(routes::post_unlock))
        .route("/api/unlock_expired", post(routes::post_unlock_expired))
        .route("/api/fund", post(routes::post_fund))
        .route("/api/treasury/fund", post(routes::post_treasury_fund))
        .route("/api/treasury/replenish", post(routes::post_replenish))
        .route("/api/treasury/withdraw", post(routes::post_treasury_withdraw))
        .route("/api/insurance/provide", post(routes::post_provide))
        .route("/api/insurance/withdraw", post(routes::post_stake_withdraw))
        .route("/api/insurance/claim", post(routes::post_claim))
        .route("/api/insurance/transfer", post(routes::post_transfer_share))
        .route("/ws", get(server::ws::ws_handler))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}
