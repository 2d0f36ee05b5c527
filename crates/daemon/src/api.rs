// Tunneld - REST API Module
// HTTP/JSON control surface and the SSE push channel. Thin shell over the
// manager; every operation returns fast and lets the background do the work.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};
use uuid::Uuid;

use tunneld_common::{
    default_bind_address, is_valid_host, Error, FieldIssue, Hop, TunnelEvent, TunnelSpec,
    TunnelState, TunnelStatus, TunnelType,
};

use crate::auth::{auth_middleware, AuthState, UserContext};
use crate::tunnel::{Manager, Tunnel};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Manager,
    pub auth: Option<AuthState>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// Wire error envelope: machine-readable code plus a human message
#[derive(Debug, Serialize)]
struct ApiError {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldIssue>>,
    timestamp: DateTime<Utc>,
}

impl ApiError {
    fn from_error(err: &Error) -> (StatusCode, Self) {
        let status = match err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Validation { .. } | Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::CircuitOpen(_) | Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Connection(_) | Error::HostKey { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let details = match err {
            Error::Validation { issues, .. } => Some(issues.clone()),
            _ => None,
        };

        (
            status,
            Self {
                code: err.code(),
                message: err.to_string(),
                details,
                timestamp: Utc::now(),
            },
        )
    }
}

fn error_response(err: Error) -> Response {
    let (status, body) = ApiError::from_error(&err);
    (status, Json(body)).into_response()
}

/// Tunnel representation on the wire: the spec plus live status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TunnelResponse {
    #[serde(flatten)]
    spec: TunnelSpec,
    status: TunnelState,
    #[serde(skip_serializing_if = "String::is_empty")]
    error_message: String,
}

impl TunnelResponse {
    fn from_tunnel(tunnel: &Tunnel) -> Self {
        let spec = tunnel.spec();
        let status = tunnel.status();
        Self {
            spec,
            status: status.state,
            error_message: status.last_error,
        }
    }
}

/// Build the API router; authentication wraps everything except login
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/tunnels", get(list_tunnels).post(create_tunnel))
        .route("/api/tunnels/:id", get(get_tunnel).delete(delete_tunnel))
        .route("/api/tunnels/:id/status", get(tunnel_status))
        .route("/api/tunnels/:id/metrics", get(tunnel_metrics))
        .route("/api/tunnels/:id/start", post(start_tunnel))
        .route("/api/tunnels/:id/stop", post(stop_tunnel))
        .route("/api/events", get(event_stream));

    let api = if let Some(auth) = &state.auth {
        api.layer(axum::middleware::from_fn_with_state(
            auth.clone(),
            auth_middleware,
        ))
    } else {
        api
    };

    // Login stays outside the token gate
    api.route("/api/auth/login", post(login)).with_state(state)
}

#[derive(Serialize)]
struct HealthTunnels {
    total: usize,
    active: usize,
    failed: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    time: DateTime<Utc>,
    version: &'static str,
    tunnels: HealthTunnels,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counts = state.manager.health().await;
    Json(HealthResponse {
        status: "healthy",
        time: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        tunnels: HealthTunnels {
            total: counts.total,
            active: counts.active,
            failed: counts.failed,
        },
    })
}

async fn list_tunnels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tunnels = state.manager.list().await;
    let response: Vec<TunnelResponse> = tunnels
        .iter()
        .map(|t| TunnelResponse::from_tunnel(t))
        .collect();
    Json(response)
}

/// Request payload for creating a tunnel
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub hops: Vec<Hop>,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub local_bind_address: Option<String>,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub keep_alive: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl CreateTunnelRequest {
    /// Field-level validation; every problem is reported, not just the first
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();

        if self.name.is_empty() || self.name.len() > 100 {
            issues.push(FieldIssue::new("name", "must be between 1 and 100 characters"));
        }

        if self.hops.is_empty() {
            issues.push(FieldIssue::new("hops", "at least one hop is required"));
        }
        for (i, hop) in self.hops.iter().enumerate() {
            if !is_valid_host(&hop.host) {
                issues.push(FieldIssue::new(
                    format!("hops[{}].host", i),
                    "must be a valid hostname or IP address",
                ));
            }
            if hop.port == 0 {
                issues.push(FieldIssue::new(
                    format!("hops[{}].port", i),
                    "must be between 1 and 65535",
                ));
            }
            if hop.user.is_empty() || hop.user.len() > 100 {
                issues.push(FieldIssue::new(
                    format!("hops[{}].user", i),
                    "must be between 1 and 100 characters",
                ));
            }
        }

        if let Some(bind) = &self.local_bind_address {
            if !is_valid_host(bind) {
                issues.push(FieldIssue::new(
                    "localBindAddress",
                    "must be a valid hostname or IP address",
                ));
            }
        }

        match self.tunnel_type {
            TunnelType::Local => {
                if !is_valid_host(&self.remote_host) {
                    issues.push(FieldIssue::new(
                        "remoteHost",
                        "must be a valid hostname or IP address",
                    ));
                }
                if self.remote_port == 0 {
                    issues.push(FieldIssue::new("remotePort", "must be between 1 and 65535"));
                }
            }
            TunnelType::Remote => {
                if self.remote_port == 0 {
                    issues.push(FieldIssue::new("remotePort", "must be between 1 and 65535"));
                }
                if self.local_port == 0 {
                    issues.push(FieldIssue::new("localPort", "must be between 1 and 65535"));
                }
            }
            TunnelType::Dynamic => {}
        }

        if let Some(keep_alive) = self.keep_alive {
            if keep_alive > 300 {
                issues.push(FieldIssue::new("keepAlive", "must be at most 300 seconds"));
            }
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries > 100 {
                issues.push(FieldIssue::new("maxRetries", "must be at most 100"));
            }
        }

        issues
    }

    fn into_spec(self, owner: String) -> TunnelSpec {
        let now = Utc::now();
        TunnelSpec {
            id: Uuid::new_v4().to_string(),
            name: sanitize(&self.name),
            owner,
            tunnel_type: self.tunnel_type,
            hops: self.hops,
            local_port: self.local_port,
            local_bind_address: self
                .local_bind_address
                .unwrap_or_else(default_bind_address),
            remote_host: self.remote_host,
            remote_port: self.remote_port,
            auto_reconnect: self.auto_reconnect,
            keep_alive: self.keep_alive.unwrap_or_else(tunneld_common::default_keep_alive),
            max_retries: self
                .max_retries
                .unwrap_or_else(tunneld_common::default_max_retries),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Strip control characters from caller-provided text
fn sanitize(input: &str) -> String {
    input.chars().filter(|c| !c.is_control()).collect()
}

async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    user: Option<axum::Extension<UserContext>>,
    Json(request): Json<CreateTunnelRequest>,
) -> Response {
    let issues = request.validate();
    if !issues.is_empty() {
        return error_response(Error::validation("invalid tunnel specification", issues));
    }

    let owner = user
        .map(|u| u.0.username.clone())
        .unwrap_or_else(|| "api-user".to_string());
    let spec = request.into_spec(owner);
    let id = spec.id.clone();

    if let Err(e) = state.manager.create(spec).await {
        error!("failed to create tunnel: {}", e);
        return error_response(e);
    }

    info!("tunnel {} created via API, connecting in background", id);
    match state.manager.get(&id).await {
        Ok(tunnel) => (
            StatusCode::CREATED,
            Json(TunnelResponse::from_tunnel(&tunnel)),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_tunnel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.get(&id).await {
        Ok(tunnel) => Json(TunnelResponse::from_tunnel(&tunnel)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn tunnel_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.get(&id).await {
        Ok(tunnel) => Json::<TunnelStatus>(tunnel.status()).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsResponse {
    tunnel_id: String,
    bytes_in: u64,
    bytes_out: u64,
    connections_active: u64,
    uptime: i64,
    last_heartbeat: DateTime<Utc>,
}

async fn tunnel_metrics(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let tunnel = match state.manager.get(&id).await {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };

    let status = tunnel.status();
    let uptime = status
        .connected_at
        .map(|t| (Utc::now() - t).num_seconds())
        .unwrap_or(0);

    Json(MetricsResponse {
        tunnel_id: id,
        bytes_in: status.bytes_received,
        bytes_out: status.bytes_sent,
        connections_active: tunnel.active_connections(),
        uptime,
        last_heartbeat: Utc::now(),
    })
    .into_response()
}

async fn start_tunnel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.start(&id).await {
        Ok(()) => match state.manager.get(&id).await {
            Ok(tunnel) => (
                StatusCode::ACCEPTED,
                Json(TunnelResponse::from_tunnel(&tunnel)),
            )
                .into_response(),
            Err(e) => error_response(e),
        },
        Err(e) => {
            error!("failed to start tunnel {}: {}", id, e);
            error_response(e)
        }
    }
}

async fn stop_tunnel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.stop(&id).await {
        Ok(()) => match state.manager.get(&id).await {
            Ok(tunnel) => Json(TunnelResponse::from_tunnel(&tunnel)).into_response(),
            Err(e) => error_response(e),
        },
        Err(e) => {
            error!("failed to stop tunnel {}: {}", id, e);
            error_response(e)
        }
    }
}

/// Delete is unconditional for known ids; a missing id is 404 NOT_FOUND
async fn delete_tunnel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    token_type: &'static str,
    expires_in: u64,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    let Some(auth) = &state.auth else {
        return error_response(Error::ServiceUnavailable(
            "authentication is not configured".into(),
        ));
    };

    if request.username.is_empty() || request.password.is_empty() {
        return error_response(Error::validation(
            "username and password are required",
            vec![
                FieldIssue::new("username", "required"),
                FieldIssue::new("password", "required"),
            ],
        ));
    }

    if !auth.verify_credentials(&request.username, &request.password) {
        return error_response(Error::Authentication("invalid credentials".into()));
    }

    match auth.issue_token(&request.username) {
        Ok(token) => {
            info!("user {} logged in", request.username);
            Json(LoginResponse {
                token,
                token_type: "Bearer",
                expires_in: auth.token_lifetime_secs(),
            })
            .into_response()
        }
        Err(e) => {
            error!("failed to issue token: {}", e);
            error_response(Error::Internal("failed to issue token".into()))
        }
    }
}

/// GET /api/events: SSE stream of tunnel_update events plus heartbeats.
/// A subscriber that lags the broadcast buffer is dropped rather than
/// allowed to block the producer.
async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.manager.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let tunnel_events = BroadcastStream::new(rx)
        // A Lagged error means this subscriber fell behind; end its stream
        .take_while(|msg| futures::future::ready(msg.is_ok()))
        .filter_map(|msg| async move {
            let event = msg.ok()?;
            match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(e) => {
                    error!("failed to serialize event: {}", e);
                    None
                }
            }
        });

    let merged = stream::select(tunnel_events, heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn heartbeat_stream() -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval())).map(
        |_| {
            let payload = serde_json::to_string(&TunnelEvent::Heartbeat {
                timestamp: Utc::now(),
            })
            .unwrap_or_else(|_| "{}".to_string());
            Ok(Event::default().data(payload))
        },
    )
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunneld_common::{AuthMethod, HostKeyMode};

    fn valid_request() -> CreateTunnelRequest {
        CreateTunnelRequest {
            name: "db-tunnel".into(),
            tunnel_type: TunnelType::Local,
            hops: vec![Hop {
                host: "bastion.example.com".into(),
                port: 22,
                user: "deploy".into(),
                auth_method: AuthMethod::Key,
                key_id: Some("~/.ssh/id_ed25519".into()),
                password: None,
                host_key: HostKeyMode::KnownHosts,
            }],
            local_port: 0,
            local_bind_address: None,
            remote_host: "10.0.0.5".into(),
            remote_port: 5432,
            auto_reconnect: true,
            keep_alive: Some(30),
            max_retries: Some(3),
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(valid_request().validate().is_empty());
    }

    #[test]
    fn empty_name_and_hops_are_reported_together() {
        let mut req = valid_request();
        req.name.clear();
        req.hops.clear();
        let issues = req.validate();
        assert!(issues.iter().any(|i| i.field == "name"));
        assert!(issues.iter().any(|i| i.field == "hops"));
    }

    #[test]
    fn bad_hop_fields_are_indexed() {
        let mut req = valid_request();
        req.hops[0].host = "not a host".into();
        req.hops[0].port = 0;
        req.hops[0].user.clear();
        let issues = req.validate();
        assert!(issues.iter().any(|i| i.field == "hops[0].host"));
        assert!(issues.iter().any(|i| i.field == "hops[0].port"));
        assert!(issues.iter().any(|i| i.field == "hops[0].user"));
    }

    #[test]
    fn local_type_requires_remote_endpoint() {
        let mut req = valid_request();
        req.remote_host.clear();
        req.remote_port = 0;
        let issues = req.validate();
        assert!(issues.iter().any(|i| i.field == "remoteHost"));
        assert!(issues.iter().any(|i| i.field == "remotePort"));
    }

    #[test]
    fn remote_type_requires_both_ports() {
        let mut req = valid_request();
        req.tunnel_type = TunnelType::Remote;
        req.local_port = 0;
        req.remote_port = 0;
        let issues = req.validate();
        assert!(issues.iter().any(|i| i.field == "localPort"));
        assert!(issues.iter().any(|i| i.field == "remotePort"));
    }

    #[test]
    fn dynamic_type_needs_no_remote_endpoint() {
        let mut req = valid_request();
        req.tunnel_type = TunnelType::Dynamic;
        req.remote_host.clear();
        req.remote_port = 0;
        req.local_port = 0;
        assert!(req.validate().is_empty());
    }

    #[test]
    fn range_limits_are_enforced() {
        let mut req = valid_request();
        req.keep_alive = Some(301);
        req.max_retries = Some(101);
        let issues = req.validate();
        assert!(issues.iter().any(|i| i.field == "keepAlive"));
        assert!(issues.iter().any(|i| i.field == "maxRetries"));
    }

    #[test]
    fn into_spec_applies_defaults_and_sanitizes() {
        let mut req = valid_request();
        req.name = "prod\x00\x01-db".into();
        req.keep_alive = None;
        req.max_retries = None;
        let spec = req.into_spec("alice".into());

        assert_eq!(spec.name, "prod-db");
        assert_eq!(spec.owner, "alice");
        assert_eq!(spec.keep_alive, 30);
        assert_eq!(spec.max_retries, 5);
        assert_eq!(spec.local_bind_address, "127.0.0.1");
        assert!(!spec.id.is_empty());
    }

    #[test]
    fn error_envelope_shapes() {
        let (status, body) = ApiError::from_error(&Error::NotFound("tunnel x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "NOT_FOUND");

        let (status, body) = ApiError::from_error(&Error::validation(
            "bad",
            vec![FieldIssue::new("name", "required")],
        ));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.details.as_ref().unwrap().len(), 1);

        let (status, _) = ApiError::from_error(&Error::CircuitOpen("open".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        let mut stream = heartbeat_stream();
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");
        assert!(event.is_ok());
    }
}
