use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StatsConfig;
use crate::events::{CONSOLE_OUTPUT_EVENT, STATS_EVENT};
use crate::resources::{CpuStats, ResourceUsage};
use crate::server::{ProcessState, Server};
use crate::AgentResult;

const CONSOLE_BUFFER: usize = 256;

/// How long a start or stop may stay in flight before the watcher settles
/// the state from what the environment reports. Outlasts `nerdctl stop -t 30`.
const TRANSITION_GRACE: Duration = Duration::from_secs(45);

/// Starts the background producers for one server.
pub fn spawn_monitors(server: Arc<Server>, config: &StatsConfig) -> Vec<JoinHandle<()>> {
    let state_poll = Duration::from_secs(config.state_poll_interval_secs.max(1));
    let stats_poll = Duration::from_secs(config.interval_secs.max(1));
    let disk_poll = Duration::from_secs(config.disk_check_interval_secs.max(1));

    vec![
        tokio::spawn(watch_state(server.clone(), state_poll)),
        tokio::spawn(poll_stats(server.clone(), stats_poll)),
        tokio::spawn(check_disk(server, disk_poll)),
    ]
}

async fn watch_state(server: Arc<Server>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    let mut console: Option<JoinHandle<()>> = None;
    let mut transition: Option<(ProcessState, Instant)> = None;

    loop {
        interval.tick().await;

        let running = match server.environment().is_running().await {
            Ok(running) => running,
            Err(err) => {
                warn!("Failed to query state of {}: {}", server.uuid(), err);
                continue;
            }
        };

        let waited = match server.state() {
            state @ (ProcessState::Starting | ProcessState::Stopping) => match transition {
                Some((seen, since)) if seen == state => since.elapsed(),
                _ => {
                    transition = Some((state, Instant::now()));
                    Duration::ZERO
                }
            },
            _ => {
                transition = None;
                Duration::ZERO
            }
        };

        reconcile_state(&server, running, waited).await;

        if running {
            if console.as_ref().map_or(true, JoinHandle::is_finished) {
                console = Some(spawn_console_tail(server.clone()));
            }
        } else if let Some(handle) = console.take() {
            handle.abort();
        }
    }
}

/// Moves the recorded state to match what the environment reports.
///
/// `starting` only settles to `running` and `stopping` only to `offline`
/// while the power action is still within its grace period; `waited` is how
/// long the server has been in its current transitional state.
async fn reconcile_state(server: &Server, running: bool, waited: Duration) {
    match (running, server.state()) {
        (true, ProcessState::Running) | (false, ProcessState::Offline) => {}
        (true, ProcessState::Stopping) | (false, ProcessState::Starting)
            if waited < TRANSITION_GRACE => {}
        (true, _) => server.set_state(ProcessState::Running).await,
        (false, _) => server.set_state(ProcessState::Offline).await,
    }
}

fn spawn_console_tail(server: Arc<Server>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Attaching console of {}", server.uuid());
        let (tx, mut rx) = mpsc::channel::<String>(CONSOLE_BUFFER);

        let environment = server.environment().clone();
        let follower = tokio::spawn(async move { environment.follow_console(tx).await });

        while let Some(line) = rx.recv().await {
            server.events().emit(CONSOLE_OUTPUT_EVENT, line).await;
        }

        match follower.await {
            Ok(Ok(())) => debug!("Console of {} detached", server.uuid()),
            Ok(Err(err)) => warn!("Console stream of {} failed: {}", server.uuid(), err),
            Err(err) => warn!("Console task of {} panicked: {}", server.uuid(), err),
        }
    })
}

async fn poll_stats(server: Arc<Server>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    let mut previous: Option<CpuStats> = None;

    loop {
        interval.tick().await;
        if let Err(err) = poll_stats_once(&server, &mut previous).await {
            debug!("Skipping stats sample for {}: {}", server.uuid(), err);
        }
    }
}

/// Takes one sample, folds it into the server's usage and broadcasts it.
/// Nothing is sampled while the server is not running.
async fn poll_stats_once(server: &Server, previous: &mut Option<CpuStats>) -> AgentResult<()> {
    if server.state() != ProcessState::Running {
        *previous = None;
        return Ok(());
    }

    let sample = server.environment().stats().await?;
    let cpu = previous
        .as_ref()
        .map(|prev| ResourceUsage::absolute_cpu(prev, &sample.cpu))
        .unwrap_or(0.0);
    let memory = ResourceUsage::adjusted_memory(&sample.memory);

    server.resources().update(|usage| {
        usage.memory = memory;
        usage.memory_limit = sample.memory.limit;
        usage.cpu_absolute = cpu;
        usage.network = sample.network.clone();
    });
    *previous = Some(sample.cpu);

    // The server may have stopped while the sample was in flight.
    if server.state() != ProcessState::Running {
        server.resources().reset();
        *previous = None;
        return Ok(());
    }

    let payload = serde_json::to_string(&server.resources().snapshot())?;
    server.events().emit(STATS_EVENT, payload).await;
    Ok(())
}

async fn check_disk(server: Arc<Server>, period: Duration) {
    let Some(dir) = server.data_dir().cloned() else {
        return;
    };

    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match directory_size(&dir).await {
            Ok(bytes) => server.resources().set_disk(bytes),
            Err(err) => debug!("Failed to size {}: {}", dir.display(), err),
        }
    }
}

/// Total size of regular files below `root`. Symlinks are not followed and
/// entries that vanish or cannot be read are skipped.
pub async fn directory_size(root: &Path) -> AgentResult<u64> {
    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut first = true;

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if first => return Err(err.into()),
            Err(_) => continue,
        };
        first = false;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match fs::symlink_metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };

            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}
