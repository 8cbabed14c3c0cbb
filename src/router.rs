use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Query;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tracing::{debug, info, warn};

use crate::auth::{TokenKey, TokenPayload};
use crate::server::{Server, ServerManager};
use crate::websocket_handler::handle_connection;

const SERVER_PATH_PREFIX: &str = "/api/servers/";
const SERVER_PATH_SUFFIX: &str = "/ws";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    NotFound(&'static str),
    Unauthorized(String),
    Forbidden,
}

impl Rejection {
    fn into_response(self) -> ErrorResponse {
        let (status, body) = match self {
            Rejection::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            Rejection::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "invalid token".to_string()),
            Rejection::Forbidden => (StatusCode::FORBIDDEN, "token not valid for server".to_string()),
        };
        let mut response = ErrorResponse::new(Some(body));
        *response.status_mut() = status;
        response
    }
}

/// Accepts console websocket upgrades on `/api/servers/{uuid}/ws?token=...`.
pub struct WebSocketRouter {
    servers: Arc<ServerManager>,
    token_key: Arc<TokenKey>,
}

impl WebSocketRouter {
    pub fn new(servers: Arc<ServerManager>, token_key: Arc<TokenKey>) -> Self {
        Self { servers, token_key }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Console websocket listening on {}", addr);
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Failed to accept websocket connection: {}", err);
                    continue;
                }
            };

            let router = self.clone();
            tokio::spawn(async move {
                router.handle_stream(stream, peer).await;
            });
        }
    }

    async fn handle_stream(&self, stream: TcpStream, peer: SocketAddr) {
        let mut accepted: Option<(Arc<Server>, TokenPayload)> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match self.authorize(request.uri()) {
                Ok(binding) => {
                    accepted = Some(binding);
                    Ok(response)
                }
                Err(rejection) => {
                    debug!("Rejected websocket upgrade from {}: {:?}", peer, rejection);
                    Err(rejection.into_response())
                }
            }
        };

        let socket = match accept_hdr_async(stream, callback).await {
            Ok(socket) => socket,
            Err(err) => {
                debug!("Websocket handshake with {} failed: {}", peer, err);
                return;
            }
        };

        let Some((server, token)) = accepted.take() else {
            return;
        };

        // Failures are logged by the handler; nothing left to do with them here.
        let _ = handle_connection(server, token, socket).await;
    }

    fn authorize(&self, uri: &Uri) -> Result<(Arc<Server>, TokenPayload), Rejection> {
        let uuid = server_uuid_from_path(uri.path()).ok_or(Rejection::NotFound("route"))?;

        let raw = token_from_query(uri)
            .ok_or_else(|| Rejection::Unauthorized("missing token".to_string()))?;
        let token = self
            .token_key
            .parse_and_verify(&raw)
            .map_err(|err| Rejection::Unauthorized(err.to_string()))?;

        let server = self.servers.get(uuid).ok_or(Rejection::NotFound("server"))?;
        if token.server_uuid != server.uuid() {
            return Err(Rejection::Forbidden);
        }

        Ok((server, token))
    }
}

fn server_uuid_from_path(path: &str) -> Option<&str> {
    let uuid = path
        .strip_prefix(SERVER_PATH_PREFIX)?
        .strip_suffix(SERVER_PATH_SUFFIX)?;
    if uuid.is_empty() || uuid.contains('/') {
        return None;
    }
    Some(uuid)
}

#[derive(Debug, Deserialize)]
struct UpgradeQuery {
    token: Option<String>,
}

/// Percent-decoded `token` query parameter, if present and non-empty.
fn token_from_query(uri: &Uri) -> Option<String> {
    let Query(query) = Query::<UpgradeQuery>::try_from_uri(uri).ok()?;
    query.token.filter(|token| !token.is_empty())
}
