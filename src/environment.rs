use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cgroup;
use crate::errors::{AgentError, AgentResult};
use crate::resources::StatsSample;

/// Control surface over the process backing one managed server.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn start(&self) -> AgentResult<()>;

    async fn stop(&self) -> AgentResult<()>;

    async fn terminate(&self, signal: Signal) -> AgentResult<()>;

    async fn is_running(&self) -> AgentResult<bool>;

    /// Returns the most recent log lines, at most `max_bytes` worth, oldest first.
    async fn read_log(&self, max_bytes: usize) -> AgentResult<Vec<String>>;

    async fn send_command(&self, line: &str) -> AgentResult<()>;

    /// Takes one raw sample of cumulative resource counters.
    async fn stats(&self) -> AgentResult<StatsSample>;

    /// Forwards console lines to `output` until the process output ends or
    /// the receiver is dropped.
    async fn follow_console(&self, output: mpsc::Sender<String>) -> AgentResult<()>;
}

/// Environment backed by a containerd container driven through `nerdctl`.
#[derive(Clone)]
pub struct NerdctlEnvironment {
    namespace: String,
    container: String,
}

const STOP_TIMEOUT_SECS: u64 = 30;
const LOG_TAIL_LINES: u32 = 1000;

impl NerdctlEnvironment {
    pub fn new(namespace: String, container: String) -> Self {
        Self {
            namespace,
            container,
        }
    }

    fn nerdctl(&self) -> Command {
        let mut cmd = Command::new("nerdctl");
        cmd.arg("--namespace").arg(&self.namespace);
        cmd
    }

    async fn run(&self, cmd: &mut Command, action: &str) -> AgentResult<String> {
        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::ContainerError(format!(
                "Failed to {} container {}: {}",
                action,
                self.container,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn init_pid(&self) -> AgentResult<u32> {
        let stdout = self
            .run(
                self.nerdctl()
                    .arg("inspect")
                    .arg("--format")
                    .arg("{{.State.Pid}}")
                    .arg(&self.container),
                "inspect",
            )
            .await?;

        match stdout.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(AgentError::ContainerError(format!(
                "Container {} has no init process",
                self.container
            ))),
        }
    }
}

#[async_trait]
impl Environment for NerdctlEnvironment {
    async fn start(&self) -> AgentResult<()> {
        info!("Starting container: {}", self.container);
        self.run(self.nerdctl().arg("start").arg(&self.container), "start")
            .await?;
        Ok(())
    }

    async fn stop(&self) -> AgentResult<()> {
        info!("Stopping container: {}", self.container);
        self.run(
            self.nerdctl()
                .arg("stop")
                .arg("-t")
                .arg(STOP_TIMEOUT_SECS.to_string())
                .arg(&self.container),
            "stop",
        )
        .await?;
        Ok(())
    }

    async fn terminate(&self, signal: Signal) -> AgentResult<()> {
        info!("Killing container: {} with signal {}", self.container, signal);
        self.run(
            self.nerdctl()
                .arg("kill")
                .arg("-s")
                .arg(signal.as_str())
                .arg(&self.container),
            "kill",
        )
        .await?;
        Ok(())
    }

    async fn is_running(&self) -> AgentResult<bool> {
        let output = self
            .nerdctl()
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Running}}")
            .arg(&self.container)
            .output()
            .await?;

        if !output.status.success() {
            return Ok(false);
        }

        let state = String::from_utf8_lossy(&output.stdout).trim().to_lowercase();
        Ok(state == "true")
    }

    async fn read_log(&self, max_bytes: usize) -> AgentResult<Vec<String>> {
        let stdout = self
            .run(
                self.nerdctl()
                    .arg("logs")
                    .arg("--tail")
                    .arg(LOG_TAIL_LINES.to_string())
                    .arg(&self.container),
                "read logs of",
            )
            .await?;

        Ok(tail_lines(&stdout, max_bytes))
    }

    async fn send_command(&self, line: &str) -> AgentResult<()> {
        debug!("Sending command to container {}: {}", self.container, line);

        let command = format!("printf '%s\\n' {} > /proc/1/fd/0", shell_quote(line));
        self.run(
            self.nerdctl()
                .arg("exec")
                .arg(&self.container)
                .arg("sh")
                .arg("-c")
                .arg(command),
            "send input to",
        )
        .await?;
        Ok(())
    }

    async fn stats(&self) -> AgentResult<StatsSample> {
        let pid = self.init_pid().await?;
        tokio::task::spawn_blocking(move || cgroup::sample(pid))
            .await
            .map_err(|e| AgentError::InternalError(format!("Stats task failed: {}", e)))?
    }

    async fn follow_console(&self, output: mpsc::Sender<String>) -> AgentResult<()> {
        info!("Starting log stream for container: {}", self.container);

        let mut child = self
            .nerdctl()
            .arg("logs")
            .arg("--follow")
            .arg("--since")
            .arg("1s")
            .arg(&self.container)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::InternalError("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::InternalError("Failed to capture stderr".to_string()))?;

        let mut stdout_reader = tokio::io::BufReader::new(stdout).lines();
        let mut stderr_reader = tokio::io::BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !stdout_done || !stderr_done {
            let line = tokio::select! {
                line = stdout_reader.next_line(), if !stdout_done => match line? {
                    Some(entry) => entry,
                    None => {
                        stdout_done = true;
                        continue;
                    }
                },
                line = stderr_reader.next_line(), if !stderr_done => match line? {
                    Some(entry) => entry,
                    None => {
                        stderr_done = true;
                        continue;
                    }
                },
            };

            if output.send(line).await.is_err() {
                debug!("Console receiver for {} went away", self.container);
                break;
            }
        }

        let _ = child.kill().await;
        let status = child.wait().await?;
        if !status.success() {
            warn!(
                "Log stream for container {} exited with status {:?}",
                self.container,
                status.code()
            );
        }

        Ok(())
    }
}

/// Keeps the last `max_bytes` of `data`, dropping a leading partial line,
/// and splits the rest into lines.
pub fn tail_lines(data: &str, max_bytes: usize) -> Vec<String> {
    let mut start = data.len().saturating_sub(max_bytes);
    while !data.is_char_boundary(start) {
        start += 1;
    }

    let mut tail = &data[start..];
    if start > 0 && !data[..start].ends_with('\n') {
        tail = match tail.find('\n') {
            Some(idx) => &tail[idx + 1..],
            None => "",
        };
    }

    tail.lines().map(str::to_string).collect()
}

fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', "'\\''"))
}
