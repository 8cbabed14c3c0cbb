use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

mod api;
mod auth;
mod cgroup;
mod config;
mod environment;
mod errors;
mod events;
mod monitor;
mod resources;
mod router;
mod server;
mod websocket_handler;

pub use auth::TokenKey;
pub use config::AgentConfig;
pub use environment::NerdctlEnvironment;
pub use errors::{AgentError, AgentResult};
pub use router::WebSocketRouter;
pub use server::{Server, ServerManager};

/// Catalyst Console - Main application state
pub struct CatalystConsole {
    pub config: Arc<AgentConfig>,
    pub token_key: Arc<TokenKey>,
    pub servers: Arc<ServerManager>,
}

impl CatalystConsole {
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        info!("Initializing Catalyst Console");

        if config.server.secret.is_empty() {
            return Err(AgentError::ConfigError("Node secret must not be empty".to_string()));
        }

        let config = Arc::new(config);
        let token_key = Arc::new(TokenKey::new(config.server.secret.as_bytes()));
        let servers = Arc::new(ServerManager::new());

        for managed in &config.servers {
            let environment = Arc::new(NerdctlEnvironment::new(
                config.containerd.namespace.clone(),
                managed.container_name().to_string(),
            ));
            let data_dir = config.server.data_dir.join(&managed.uuid);
            servers.add(Arc::new(Server::new(
                managed.uuid.clone(),
                environment,
                Some(data_dir),
            )));
            info!("Registered server {}", managed.uuid);
        }

        Ok(Self {
            config,
            token_key,
            servers,
        })
    }

    pub async fn run(&self) -> AgentResult<()> {
        info!("Starting Catalyst Console");

        let mut monitors = Vec::new();
        for server in self.servers.all() {
            monitors.extend(monitor::spawn_monitors(server, &self.config.stats));
        }

        // Bind both listeners up front so a bad address fails startup.
        let ws_listener = TcpListener::bind(self.config.api.websocket_bind.as_str()).await?;
        let http_listener = TcpListener::bind(self.config.api.http_bind.as_str()).await?;

        let router = Arc::new(WebSocketRouter::new(
            self.servers.clone(),
            self.token_key.clone(),
        ));
        let ws_task = tokio::spawn(router.serve(ws_listener));

        let app = api::router(self.servers.clone());
        let http_task = tokio::spawn(async move {
            info!(
                "Local HTTP server listening on {}",
                http_listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default()
            );
            if let Err(e) = axum::serve(http_listener, app).await {
                error!("HTTP server error: {}", e);
            }
        });

        tokio::select! {
            _ = ws_task => error!("Websocket listener stopped"),
            _ = http_task => error!("HTTP server stopped"),
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        }

        for handle in monitors {
            handle.abort();
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = AgentConfig::from_file(config_path)
        .or_else(|_| AgentConfig::from_file("/etc/catalyst-console/config.toml"))
        .or_else(|_| AgentConfig::from_env())
        .map_err(AgentError::ConfigError)?;

    let filter = format!("catalyst_console={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Catalyst Console starting");
    info!("Configuration loaded: {:?}", config);

    let console = CatalystConsole::new(config)?;
    console.run().await?;

    Ok(())
}
