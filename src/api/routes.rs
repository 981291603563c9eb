//! Request handlers for the ingest and read endpoints.

use std::convert::Infallible;
use std::io::Read;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use flate2::read::GzDecoder;
use futures::Stream;
use serde_json::json;
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::ApiState;
use crate::state::{AgentState, Alert};
use crate::{HeartbeatPayload, MetricsPushPayload};

/// Hard cap on the ingest body, both on the wire and after decompression.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// `POST /api/v1/metrics/push`
pub async fn push_metrics(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let raw = decode_body(&headers, body)?;
    let payload: MetricsPushPayload = serde_json::from_slice(&raw)
        .map_err(|err| ApiError::InvalidRequest(format!("invalid metrics payload: {err}")))?;

    if payload.agent_name.is_empty() {
        return Err(ApiError::InvalidRequest(
            "agent_name is required".to_string(),
        ));
    }

    debug!(agent = %payload.agent_name, "metrics push received");
    state.store.update_agent(payload).await;
    Ok(Json(json!({ "status": "ok" })))
}

/// `POST /api/v1/heartbeat`
pub async fn heartbeat(
    State(state): State<ApiState>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let payload: HeartbeatPayload = serde_json::from_slice(&body)
        .map_err(|err| ApiError::InvalidRequest(format!("invalid heartbeat payload: {err}")))?;

    if payload.agent_name.is_empty() {
        return Err(ApiError::InvalidRequest(
            "agent_name is required".to_string(),
        ));
    }

    state.store.update_heartbeat(&payload.agent_name).await;
    Ok(Json(json!({ "status": "ok" })))
}

/// `GET /api/v1/health` - unauthenticated liveness plus fleet counters
pub async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (agents_online, agents_offline, active_alerts) = state.store.counters().await;
    Json(json!({
        "status": "ok",
        "agents_online": agents_online,
        "agents_offline": agents_offline,
        "active_alerts": active_alerts,
    }))
}

/// `GET /api/v1/agents`
pub async fn list_agents(State(state): State<ApiState>) -> Json<Vec<AgentState>> {
    Json(state.store.get_all_agents().await)
}

/// `GET /api/v1/agents/{name}`
pub async fn get_agent(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<AgentState>> {
    state
        .store
        .get_agent(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown agent: {name}")))
}

/// `GET /api/v1/agents/{name}/alerts` - full alert history for one agent
pub async fn agent_alerts(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Json<Vec<Alert>> {
    Json(state.store.get_alerts_by_agent(&name).await)
}

/// `GET /api/v1/alerts` - currently active alerts across the fleet
pub async fn list_alerts(State(state): State<ApiState>) -> Json<Vec<Alert>> {
    Json(state.store.get_active_alerts().await)
}

/// `GET /api/v1/events` - SSE snapshot stream for dashboards
pub async fn events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(state, |state| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let snapshot = json!({
            "agents": state.store.get_all_agents().await,
            "alerts": state.store.get_active_alerts().await,
        });
        let event = Event::default()
            .event("snapshot")
            .json_data(&snapshot)
            .unwrap_or_default();
        Some((Ok(event), state))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Unwraps a possibly gzip-encoded ingest body, enforcing the size cap on
/// the decompressed stream so a small compressed bomb cannot bypass the
/// wire limit.
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, ApiError> {
    let is_gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));

    if !is_gzip {
        return Ok(body.to_vec());
    }

    let mut decoded = Vec::new();
    let mut reader = GzDecoder::new(&body[..]).take(MAX_BODY_BYTES as u64 + 1);
    reader
        .read_to_end(&mut decoded)
        .map_err(|err| ApiError::InvalidRequest(format!("invalid gzip body: {err}")))?;

    if decoded.len() > MAX_BODY_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn gzip_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        headers
    }

    #[test]
    fn plain_body_passes_through() {
        let body = Bytes::from_static(b"{\"x\":1}");
        let decoded = decode_body(&HeaderMap::new(), body.clone()).unwrap();
        assert_eq!(decoded, body.to_vec());
    }

    #[test]
    fn gzip_body_is_decompressed() {
        let decoded = decode_body(&gzip_headers(), gzip(b"{\"x\":1}")).unwrap();
        assert_eq!(decoded, b"{\"x\":1}");
    }

    #[test]
    fn garbage_gzip_is_rejected() {
        let err = decode_body(&gzip_headers(), Bytes::from_static(b"not gzip")).unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }

    #[test]
    fn decompression_bomb_hits_the_cap() {
        // Highly compressible body that inflates past the limit.
        let bomb = vec![0u8; MAX_BODY_BYTES + 1024];
        let err = decode_body(&gzip_headers(), gzip(&bomb)).unwrap_err();
        assert!(matches!(err, ApiError::PayloadTooLarge));
    }
}
