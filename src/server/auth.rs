use crate::config::AppConfig;
use crate::state::{AccountId, AppState};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
pub enum AuthRejection {
    MissingToken,
    InvalidToken,
    AdminOnly,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthRejection::MissingToken => (StatusCode::UNAUTHORIZED, "missing bearer token"),
            AuthRejection::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid bearer token"),
            AuthRejection::AdminOnly => (StatusCode::FORBIDDEN, "admin token required"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Account the request's bearer token belongs to. Handlers act on behalf
/// of this account only; request bodies never name the caller.
#[derive(Debug, Clone)]
pub struct Caller(pub AccountId);

/// A caller holding the admin token.
#[derive(Debug, Clone)]
pub struct Admin(pub AccountId);

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        resolve_caller(&state.config, token).map(Caller)
    }
}

impl FromRequestParts<Arc<AppState>> for Admin {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        resolve_admin(&state.config, token).map(Admin)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthRejection> {
    headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthRejection::MissingToken)?
        .to_str()
        .map_err(|_| AuthRejection::InvalidToken)?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthRejection::InvalidToken)
}

/// Map a token to its account: the admin token first, then `API_TOKENS`.
pub fn resolve_caller(config: &AppConfig, token: &str) -> Result<AccountId, AuthRejection> {
    if config.admin_token.as_deref() == Some(token) {
        return Ok(AccountId::from(config.admin_account.as_str()));
    }
    config
        .api_tokens
        .get(token)
        .map(|account| AccountId::from(account.as_str()))
        .ok_or(AuthRejection::InvalidToken)
}

pub fn resolve_admin(config: &AppConfig, token: &str) -> Result<AccountId, AuthRejection> {
    if config.admin_token.as_deref() == Some(token) {
        Ok(AccountId::from(config.admin_account.as_str()))
    } else if config.api_tokens.contains_key(token) {
        Err(AuthRejection::AdminOnly)
    } else {
        Err(AuthRejection::InvalidToken)
    }
}
