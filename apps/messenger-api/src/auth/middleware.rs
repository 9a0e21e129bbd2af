//! Session token extraction for WebSocket upgrades.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Deserialize;

use crate::auth::sessions;
use crate::error::ApiError;
use crate::AppState;

/// Authenticated user, resolved from `Authorization: Bearer <token>` or the
/// `token` query parameter (browsers cannot set headers on WebSocket
/// requests).
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Result<Option<String>, ApiError> {
    let Some(header) = parts.headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let token = header
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))?;
    Ok(Some(token.to_string()))
}

fn query_token(parts: &Parts) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(parts)? {
            Some(token) => token,
            None => query_token(parts).ok_or_else(|| ApiError::unauthorized("Missing session token"))?,
        };

        let data = sessions::lookup_session(state.kv.as_ref(), &token)
            .await
            .map_err(|_| ApiError::unauthorized("Session lookup failed"))?
            .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))?;

        Ok(AuthUser { user_id: data.user_id })
    }
}
