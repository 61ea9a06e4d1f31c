use crate::errors::{EngineError, EngineResult};
use crate::pricing::fixed::{pow10, FEED_DECIMALS};
use crate::state::{Asset, EngineEvent, PriceTick};
use reqwest::Client;
use tokio::sync::mpsc;

/// FreeCryptoAPI REST client. Polls ETH and BTC spot at a fixed interval
/// and hands each observation to the engine as an 8-decimal tick.
pub async fn run_price_feed(
    api_key: String,
    base_url: String,
    poll_secs: u64,
    engine_tx: mpsc::Sender<EngineEvent>,
) {
    tracing::info!(poll_secs, "price feed started (FreeCryptoAPI)");

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap_or_default();

    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(poll_secs));
    let mut consecutive_errors: u32 = 0;

    loop {
        interval.tick().await;

        for asset in Asset::ALL {
            match fetch_price(&client, &api_key, &base_url, asset).await {
                Ok(price) => {
                    consecutive_errors = 0;
                    let tick = PriceTick { asset, price, timestamp: chrono::Utc::now().timestamp() };
                    if engine_tx.send(EngineEvent::Price(tick)).await.is_err() {
                        tracing::error!("engine channel closed, price feed shutting down");
                        return;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        asset = %asset,
                        error = %e,
                        consecutive = consecutive_errors,
                        "price fetch failed"
                    );
                }
            }
        }

        // Exponential backoff on repeated failures (cap at 30s)
        if consecutive_errors > 3 {
            let backoff = std::cmp::min(consecutive_errors * 2, 30);
            tokio::time::sleep(tokio::time::Duration::from_secs(backoff as u64)).await;
        }
    }
}

// Response shape:
// {
//   "status": "success",
//   "symbols": [
//     { "symbol": "ETH", "last": "3412.57", "date": "2026-02-17 08:27:54", ... }
//   ]
// }

#[derive(serde::Deserialize)]
struct CryptoDataResponse {
    symbols: Option<Vec<SymbolData>>,
}

#[derive(serde::Deserialize)]
struct SymbolData {
    symbol: Option<String>,
    last: Option<String>,
}

async fn fetch_price(client: &Client, api_key: &str, base_url: &str, asset: Asset) -> EngineResult<u128> {
    let url = format!("{}/getData?symbol={}", base_url.trim_end_matches('/'), asset.symbol());

    let resp = client
        .get(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(EngineError::Network(format!("HTTP {status}: {body}")));
    }

    let data: CryptoDataResponse = resp.json().await?;
    let last = last_for(&data, asset)
        .ok_or_else(|| EngineError::Parse(format!("no {} symbol in response", asset.symbol())))?;

    parse_feed_price(last)
}

/// Last trade of the entry whose symbol names `asset`. Entries without a
/// symbol never match.
fn last_for(data: &CryptoDataResponse, asset: Asset) -> Option<&str> {
    data.symbols
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|s| s.symbol.as_deref().is_some_and(|sym| sym.eq_ignore_ascii_case(asset.symbol())))
        .and_then(|s| s.last.as_deref())
}

/// Decimal string to feed units, exact. Digits past the eighth decimal are truncated.
pub fn parse_feed_price(raw: &str) -> EngineResult<u128> {
    let invalid = || EngineError::Parse(format!("invalid price string: {raw}"));
    let raw_trimmed = raw.trim();
    let (whole, frac) = raw_trimmed.split_once('.').unwrap_or((raw_trimmed, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let scale = pow10(FEED_DECIMALS)?;
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let frac = &frac[..frac.len().min(FEED_DECIMALS as usize)];
    let frac_units: u128 = if frac.is_empty() {
        0
    } else {
        let padding = FEED_DECIMALS - frac.len() as u32;
        frac.parse::<u128>().map_err(|_| invalid())? * pow10(padding)?
    };

    let price = whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or(EngineError::Overflow("feed price"))?;
    if price == 0 {
        return Err(EngineError::Parse(format!("non-positive price: {raw}")));
    }
    Ok(price)
}
