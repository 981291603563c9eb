//! Bearer API-key authentication with per-route scopes.
//!
//! Keys come from server config. An empty key list disables authentication
//! entirely, which keeps single-tenant lab setups simple.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::api::error::ApiError;
use crate::config::ApiKeyConfig;

/// Middleware state: the key list plus the scope this route demands.
#[derive(Clone)]
pub struct RequireScope {
    keys: Arc<Vec<ApiKeyConfig>>,
    scope: &'static str,
}

impl RequireScope {
    pub fn new(keys: Arc<Vec<ApiKeyConfig>>, scope: &'static str) -> Self {
        Self { keys, scope }
    }
}

/// Rejects before the handler runs: 401 for missing or unknown tokens,
/// 403 for a known key lacking the scope.
pub async fn require_scope(
    State(required): State<RequireScope>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if required.keys.is_empty() {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".to_string()))?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::Unauthorized("invalid Authorization format (expected: Bearer <key>)".to_string())
    })?;

    let key = required
        .keys
        .iter()
        .find(|k| k.key == token)
        .ok_or_else(|| ApiError::Unauthorized("unknown API key".to_string()))?;

    if !key.scopes.iter().any(|s| s == required.scope) {
        return Err(ApiError::Forbidden(format!(
            "API key '{}' lacks scope {}",
            key.name, required.scope
        )));
    }

    debug!(key_name = %key.name, scope = required.scope, "authenticated request");
    Ok(next.run(request).await)
}
