//! Administrative REST API for domain records.
//!
//! Creating a tunnel is self-service; management endpoints honor an
//! optional admin API key (`x-api-key`) and are open when none is
//! configured. Deleting a tunnel also accepts the tunnel's own token via
//! `x-tunnel-token`.

use std::sync::OnceLock;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use tunely_core::TunnelError;

use crate::server::{error_response, AppState};
use crate::store::{DomainRecord, DomainUpdate, RequestLog, TunnelMode};

/// Domain names: alphanumeric start, hyphens allowed, 1-63 chars.
fn domain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][-A-Za-z0-9]{0,62}$").expect("valid regex"))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", get(server_info))
        .route("/api/tunnels", post(create_tunnel).get(list_tunnels))
        .route("/api/tunnels/check-availability", get(check_availability))
        .route(
            "/api/tunnels/:domain",
            get(get_tunnel).put(update_tunnel).delete(delete_tunnel),
        )
        .route("/api/tunnels/:domain/regenerate-token", post(regenerate_token))
        .route("/api/tunnels/:domain/logs", get(tunnel_logs))
}

fn check_admin_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if let Some(ref expected) = state.config.admin_api_key {
        let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Err(error_response(&TunnelError::auth_failed("invalid API key")));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CreateTunnelRequest {
    domain: String,
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    mode: TunnelMode,
}

#[derive(Debug, Serialize)]
struct CreateTunnelResponse {
    domain: String,
    token: String,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct TunnelInfo {
    domain: String,
    name: Option<String>,
    description: Option<String>,
    enabled: bool,
    mode: TunnelMode,
    connected: bool,
    created_at: DateTime<Utc>,
    last_connected_at: Option<DateTime<Utc>>,
    total_requests: u64,
}

impl TunnelInfo {
    fn from_record(record: DomainRecord, connected: bool) -> Self {
        Self {
            domain: record.domain,
            name: record.name,
            description: record.description,
            enabled: record.enabled,
            mode: record.mode,
            connected,
            created_at: record.created_at,
            last_connected_at: record.last_connected_at,
            total_requests: record.total_requests,
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckAvailabilityResponse {
    available: bool,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_log_limit() -> u32 {
    100
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    total: u64,
    logs: Vec<RequestLog>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_tunnels": state.registry.count(),
        "pending_requests": state.pending.len(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn server_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Tunely Server",
        "version": env!("CARGO_PKG_VERSION"),
        "domain": {
            "pattern": format!("{{subdomain}}.{}", state.config.domain),
            "customizable": "subdomain",
            "suffix": format!(".{}", state.config.domain),
        },
        "websocket": { "url": state.config.ws_url() },
        "protocols": ["https", "http"],
    }))
}

async fn create_tunnel(
    State(state): State<AppState>,
    Json(request): Json<CreateTunnelRequest>,
) -> Response {
    if !domain_pattern().is_match(&request.domain) {
        return error_response(&TunnelError::protocol(
            "invalid domain: use letters, numbers and hyphens (1-63 chars, must start with a letter or number)",
        ));
    }

    match state
        .store
        .create_domain(&request.domain, request.name, request.description, request.mode)
        .await
    {
        Ok(record) => {
            info!(domain = %record.domain, "tunnel created");
            Json(CreateTunnelResponse {
                domain: record.domain,
                token: record.token,
                name: record.name,
            })
            .into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn list_tunnels(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_admin_key(&state, &headers) {
        return denied;
    }
    match state.store.list_domains().await {
        Ok(records) => {
            let infos: Vec<TunnelInfo> = records
                .into_iter()
                .map(|record| {
                    let connected = state.registry.is_connected(&record.domain);
                    TunnelInfo::from_record(record, connected)
                })
                .collect();
            Json(infos).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn check_availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Response {
    if !domain_pattern().is_match(&query.name) {
        return Json(CheckAvailabilityResponse {
            available: false,
            name: query.name,
            reason: Some(
                "invalid domain format: letters, numbers and hyphens only (1-63 chars)"
                    .to_string(),
            ),
        })
        .into_response();
    }

    match state.store.lookup_by_domain(&query.name).await {
        Ok(Some(_)) => Json(CheckAvailabilityResponse {
            available: false,
            name: query.name,
            reason: Some("domain already exists".to_string()),
        })
        .into_response(),
        Ok(None) => Json(CheckAvailabilityResponse {
            available: true,
            name: query.name,
            reason: None,
        })
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn get_tunnel(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_admin_key(&state, &headers) {
        return denied;
    }
    match state.store.lookup_by_domain(&domain).await {
        Ok(Some(record)) => {
            let connected = state.registry.is_connected(&record.domain);
            Json(TunnelInfo::from_record(record, connected)).into_response()
        }
        Ok(None) => error_response(&TunnelError::not_found(format!(
            "tunnel '{domain}' not found"
        ))),
        Err(err) => error_response(&err),
    }
}

async fn update_tunnel(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
    Json(update): Json<DomainUpdate>,
) -> Response {
    if let Err(denied) = check_admin_key(&state, &headers) {
        return denied;
    }
    match state.store.update_domain(&domain, update).await {
        Ok(Some(record)) => {
            let connected = state.registry.is_connected(&record.domain);
            Json(TunnelInfo::from_record(record, connected)).into_response()
        }
        Ok(None) => error_response(&TunnelError::not_found(format!(
            "tunnel '{domain}' not found"
        ))),
        Err(err) => error_response(&err),
    }
}

async fn delete_tunnel(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
) -> Response {
    // Either the admin key or the tunnel's own token may delete it.
    let tunnel_token = headers.get("x-tunnel-token").and_then(|v| v.to_str().ok());
    if let Some(token) = tunnel_token {
        match state.store.lookup_by_token(token).await {
            Ok(Some(record)) if record.domain == domain => {}
            Ok(_) => {
                return error_response(&TunnelError::auth_failed(
                    "invalid tunnel token or domain mismatch",
                ))
            }
            Err(err) => return error_response(&err),
        }
    } else if let Err(denied) = check_admin_key(&state, &headers) {
        return denied;
    }

    match state.store.delete_domain(&domain).await {
        Ok(true) => {
            info!(%domain, "tunnel deleted");
            Json(serde_json::json!({ "success": true, "domain": domain })).into_response()
        }
        Ok(false) => error_response(&TunnelError::not_found(format!(
            "tunnel '{domain}' not found"
        ))),
        Err(err) => error_response(&err),
    }
}

async fn regenerate_token(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_admin_key(&state, &headers) {
        return denied;
    }
    match state.store.regenerate_token(&domain).await {
        Ok(Some(token)) => {
            info!(%domain, "token regenerated");
            Json(serde_json::json!({ "domain": domain, "token": token })).into_response()
        }
        Ok(None) => error_response(&TunnelError::not_found(format!(
            "tunnel '{domain}' not found"
        ))),
        Err(err) => error_response(&err),
    }
}

async fn tunnel_logs(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_admin_key(&state, &headers) {
        return denied;
    }
    let limit = query.limit.clamp(1, 1_000);
    match state.store.recent_logs(&domain, limit, query.offset).await {
        Ok((total, logs)) => Json(LogsResponse { total, logs }).into_response(),
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_pattern_accepts_and_rejects() {
        let pattern = domain_pattern();
        assert!(pattern.is_match("demo"));
        assert!(pattern.is_match("agent-001"));
        assert!(pattern.is_match("A1"));
        assert!(pattern.is_match(&"a".repeat(63)));

        assert!(!pattern.is_match(""));
        assert!(!pattern.is_match("-leading"));
        assert!(!pattern.is_match("has.dot"));
        assert!(!pattern.is_match("has space"));
        assert!(!pattern.is_match(&"a".repeat(64)));
    }
}
