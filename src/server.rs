use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::environment::Environment;
use crate::events::{EventBus, STATUS_EVENT};
use crate::resources::ResourceUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Offline,
    Starting,
    Running,
    Stopping,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Offline => "offline",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed server instance and everything attached to it at runtime.
pub struct Server {
    uuid: String,
    state: RwLock<ProcessState>,
    environment: Arc<dyn Environment>,
    events: EventBus,
    resources: ResourceUsage,
    data_dir: Option<PathBuf>,
}

impl Server {
    pub fn new(uuid: String, environment: Arc<dyn Environment>, data_dir: Option<PathBuf>) -> Self {
        Self {
            uuid,
            state: RwLock::new(ProcessState::Offline),
            environment,
            events: EventBus::new(),
            resources: ResourceUsage::new(),
            data_dir,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.read()
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.environment
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn resources(&self) -> &ResourceUsage {
        &self.resources
    }

    pub fn data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }

    /// Stores the new state and notifies listeners if it changed. Resource
    /// figures are cleared whenever the server is not running.
    pub async fn set_state(&self, state: ProcessState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);

        if state != ProcessState::Running {
            self.resources.reset();
        }

        if previous != state {
            debug!("Server {} state {} -> {}", self.uuid, previous, state);
            self.events.emit(STATUS_EVENT, state.as_str()).await;
        }
    }
}

/// Registry of every server managed by this node.
#[derive(Default)]
pub struct ServerManager {
    servers: DashMap<String, Arc<Server>>,
}

impl ServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, server: Arc<Server>) {
        self.servers.insert(server.uuid().to_string(), server);
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<Server>> {
        self.servers.get(uuid).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Server>> {
        let mut servers: Vec<Arc<Server>> =
            self.servers.iter().map(|entry| entry.value().clone()).collect();
        servers.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        servers
    }
}
