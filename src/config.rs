use crate::errors::{EngineError, EngineResult};
use crate::params::DEFAULT_NETWORK;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub params_path: PathBuf,
    pub network: String,
    pub data_dir: PathBuf,
    pub server_port: u16,
    /// Price feed is disabled when unset; ticks then arrive over HTTP only
    pub price_api_base_url: Option<String>,
    pub price_api_key: String,
    pub price_poll_secs: u64,
    pub sweep_interval_secs: u64,
    pub treasury_account: String,
    pub insurance_account: String,
    pub admin_account: String,
    /// Bearer token that acts as `admin_account`; admin routes are closed when unset
    pub admin_token: Option<String>,
    /// Bearer token -> account for user routes
    pub api_tokens: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            params_path: PathBuf::from("params/hegic.json"),
            network: DEFAULT_NETWORK.to_string(),
            data_dir: PathBuf::from("data"),
            server_port: 3001,
            price_api_base_url: None,
            price_api_key: String::new(),
            price_poll_secs: 5,
            sweep_interval_secs: 60,
            treasury_account: "treasury".into(),
            insurance_account: "insurance".into(),
            admin_account: "admin".into(),
            admin_token: None,
            api_tokens: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let server_port = env_var_or("SERVER_PORT", "3001")
            .parse::<u16>()
            .map_err(|e| EngineError::Config(format!("SERVER_PORT: {e}")))?;

        let price_poll_secs = env_var_or("PRICE_POLL_SECS", "5")
            .parse::<u64>()
            .map_err(|e| EngineError::Config(format!("PRICE_POLL_SECS: {e}")))?;

        let sweep_interval_secs = env_var_or("SWEEP_INTERVAL_SECS", "60")
            .parse::<u64>()
            .map_err(|e| EngineError::Config(format!("SWEEP_INTERVAL_SECS: {e}")))?;

        if price_poll_secs == 0 || sweep_interval_secs == 0 {
            return Err(EngineError::Config("poll and sweep intervals must be positive".into()));
        }

        let price_api_base_url = std::env::var("PRICE_API_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let price_api_key = if price_api_base_url.is_some() {
            env_var("PRICE_API_KEY")?
        } else {
            env_var_or("PRICE_API_KEY", "")
        };

        let treasury_account = env_var_or("TREASURY_ACCOUNT", &defaults.treasury_account);
        let insurance_account = env_var_or("INSURANCE_ACCOUNT", &defaults.insurance_account);
        let admin_account = env_var_or("ADMIN_ACCOUNT", &defaults.admin_account);
        let admin_token = std::env::var("ADMIN_TOKEN")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if admin_token.is_none() {
            tracing::warn!("ADMIN_TOKEN unset, admin routes disabled");
        }

        let api_tokens = parse_api_tokens(&env_var_or("API_TOKENS", ""))?;
        for (token, account) in &api_tokens {
            if account == &treasury_account || account == &insurance_account {
                return Err(EngineError::Config(format!("API_TOKENS: {account} is a pool account")));
            }
            if admin_token.as_deref() == Some(token.as_str()) {
                return Err(EngineError::Config("API_TOKENS: token reuses ADMIN_TOKEN".into()));
            }
        }

        Ok(Self {
            params_path: PathBuf::from(env_var_or("PARAMS_PATH", "params/hegic.json")),
            network: env_var_or("NETWORK", DEFAULT_NETWORK),
            data_dir: PathBuf::from(env_var_or("DATA_DIR", "data")),
            server_port,
            price_api_base_url,
            price_api_key,
            price_poll_secs,
            sweep_interval_secs,
            treasury_account,
            insurance_account,
            admin_account,
            admin_token,
            api_tokens,
        })
    }
}

/// `token=account` pairs separated by commas, e.g. `t0k3n=alice,s3cr3t=bob`.
pub fn parse_api_tokens(raw: &str) -> EngineResult<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (token, account) = pair
            .split_once('=')
            .map(|(t, a)| (t.trim(), a.trim()))
            .filter(|(t, a)| !t.is_empty() && !a.is_empty())
            .ok_or_else(|| EngineError::Config(format!("API_TOKENS: malformed entry for {}", redact(pair))))?;
        if tokens.insert(token.to_string(), account.to_string()).is_some() {
            return Err(EngineError::Config(format!("API_TOKENS: duplicate token for {account}")));
        }
    }
    Ok(tokens)
}

/// Account half of a pair, never the token.
fn redact(pair: &str) -> &str {
    pair.split_once('=').map(|(_, a)| a.trim()).unwrap_or("<unnamed>")
}

fn env_var(key: &str) -> EngineResult<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("missing env var: {key}")))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_tokens() {
        let tokens = parse_api_tokens(" t0k3n=alice, s3cr3t = bob ,").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["t0k3n"], "alice");
        assert_eq!(tokens["s3cr3t"], "bob");
        assert!(parse_api_tokens("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_api_tokens_rejects_bad_entries() {
        assert!(matches!(parse_api_tokens("alice"), Err(EngineError::Config(_))));
        assert!(matches!(parse_api_tokens("=alice"), Err(EngineError::Config(_))));
        assert!(matches!(parse_api_tokens("t=alice,t=bob"), Err(EngineError::Config(_))));
    }
}
