//! HTTP surface: Prometheus metrics plus a small debug API.
//!
//! The debug endpoints operate purely through the pool's public lookup
//! and kill operations; they exist so an operator can inspect a client's
//! state, push a raw command through an existing session, or reap idle
//! users without restarting the bridge.

use crate::irc::ClientPool;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

fn describe_client(client: &Arc<crate::irc::BridgedClient>) -> Value {
    json!({
        "id": client.id.to_string(),
        "nick": client.nick(),
        "user_id": client.user_id,
        "is_bot": client.is_bot,
        "status": format!("{:?}", client.status()),
        "channels": client.chan_list(),
        "last_action_secs_ago": client.last_action().elapsed().as_secs(),
        "explicit_disconnect": client.explicit_disconnect(),
        "disconnect_reason": client.disconnect_reason().map(|r| r.as_str()),
    })
}

async fn list_clients(
    State(pool): State<Arc<ClientPool>>,
    Path(domain): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let server = pool.server(&domain).ok_or(StatusCode::NOT_FOUND)?;
    let clients = pool
        .get_bridged_clients_for_regex(".*")
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let described: Vec<Value> = clients
        .values()
        .flatten()
        .filter(|c| c.server.domain() == server.domain())
        .map(describe_client)
        .collect();
    Ok(Json(json!({
        "domain": domain,
        "connections": pool.connection_count(server.domain()),
        "reconnects_waiting": pool.total_reconnects_waiting(server.domain()),
        "clients": described,
    })))
}

async fn inspect_client(
    State(pool): State<Arc<ClientPool>>,
    Path((domain, user_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let server = pool.server(&domain).ok_or(StatusCode::NOT_FOUND)?;
    let client = pool
        .get_bridged_client_by_user_id(&server, &user_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(describe_client(&client)))
}

async fn kill_client(
    State(pool): State<Arc<ClientPool>>,
    Path((domain, user_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let server = pool.server(&domain).ok_or(StatusCode::NOT_FOUND)?;
    let client = pool
        .get_bridged_client_by_user_id(&server, &user_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    client.kill(Some("Killed by administrator".into()));
    Ok(Json(json!({ "killed": user_id })))
}

#[derive(Deserialize)]
struct RawCommand {
    command: String,
}

async fn send_raw(
    State(pool): State<Arc<ClientPool>>,
    Path((domain, user_id)): Path<(String, String)>,
    Json(body): Json<RawCommand>,
) -> Result<Json<Value>, StatusCode> {
    let server = pool.server(&domain).ok_or(StatusCode::NOT_FOUND)?;
    let client = pool
        .get_bridged_client_by_user_id(&server, &user_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    client
        .send_raw_command(&body.command)
        .map_err(|_| StatusCode::CONFLICT)?;
    Ok(Json(json!({ "sent": body.command })))
}

#[derive(Deserialize)]
struct ReapParams {
    /// Kill clients idle for at least this many seconds.
    idle_secs: u64,
}

async fn reap_clients(
    State(pool): State<Arc<ClientPool>>,
    Path(domain): Path<String>,
    Query(params): Query<ReapParams>,
) -> Result<Json<Value>, StatusCode> {
    pool.server(&domain).ok_or(StatusCode::NOT_FOUND)?;
    let reaped = pool.reap_idle_clients(&domain, Duration::from_secs(params.idle_secs));
    Ok(Json(json!({ "reaped": reaped })))
}

pub fn router(pool: Arc<ClientPool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/debug/clients/:domain", get(list_clients))
        .route("/debug/clients/:domain/reap", post(reap_clients))
        .route("/debug/clients/:domain/users/:user_id", get(inspect_client))
        .route(
            "/debug/clients/:domain/users/:user_id/kill",
            post(kill_client),
        )
        .route("/debug/clients/:domain/users/:user_id/raw", post(send_raw))
        .with_state(pool)
}

/// Run the HTTP server. Long-running; spawn it in the background.
pub async fn run_http_server(port: u16, pool: Arc<ClientPool>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("HTTP server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(pool)).await {
        tracing::error!("HTTP server error: {}", e);
    }
}
