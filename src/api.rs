use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::events::{CONSOLE_OUTPUT_EVENT, STATS_EVENT, STATUS_EVENT};
use crate::resources::ResourceSnapshot;
use crate::server::{ProcessState, Server, ServerManager};

#[derive(Debug, Serialize)]
struct ListenerCounts {
    status: usize,
    console: usize,
    stats: usize,
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    uuid: String,
    state: ProcessState,
    resources: ResourceSnapshot,
    listeners: ListenerCounts,
}

impl ServerStatus {
    fn of(server: &Server) -> Self {
        let events = server.events();
        Self {
            uuid: server.uuid().to_string(),
            state: server.state(),
            resources: server.resources().snapshot(),
            listeners: ListenerCounts {
                status: events.listener_count(STATUS_EVENT),
                console: events.listener_count(CONSOLE_OUTPUT_EVENT),
                stats: events.listener_count(STATS_EVENT),
            },
        }
    }
}

/// Local read-only status API.
pub fn router(servers: Arc<ServerManager>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/servers", get(list_servers))
        .route("/api/servers/{uuid}", get(server_details))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(servers)
}

async fn list_servers(State(servers): State<Arc<ServerManager>>) -> Json<Vec<ServerStatus>> {
    Json(servers.all().iter().map(|s| ServerStatus::of(s)).collect())
}

async fn server_details(
    State(servers): State<Arc<ServerManager>>,
    Path(uuid): Path<String>,
) -> Result<Json<ServerStatus>, StatusCode> {
    servers
        .get(&uuid)
        .map(|server| Json(ServerStatus::of(&server)))
        .ok_or(StatusCode::NOT_FOUND)
}
