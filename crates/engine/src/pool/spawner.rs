//! Seam between "start something that speaks the worker control protocol"
//! and the pool's state machine, so recycle/timeout/failure logic can be
//! exercised against an in-process fake instead of a real child process.

use std::process::Stdio;

use async_trait::async_trait;
use swarmforge_core::{OrchestratorError, WorkerId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::ipc::{ChildMessage, ParentMessage};

/// Parameters the pool passes to a freshly assigned worker identity.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub worker_id: WorkerId,
    pub memory_limit_mb: u64,
    pub task_timeout_ms: u64,
    pub preserve_context: bool,
}

/// One live control-channel conversation with a worker.
#[async_trait]
pub trait WorkerChannel: Send {
    async fn send(&mut self, message: ParentMessage) -> Result<(), OrchestratorError>;
    async fn recv(&mut self) -> Result<Option<ChildMessage>, OrchestratorError>;
    async fn kill(&mut self);
}

/// Starts worker channels. `ProcessSpawner` is the production implementation;
/// tests substitute a fake that never touches the OS process table.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerChannel>, OrchestratorError>;
}

/// Spawns the configured worker program as a real child process, piping its
/// stdin/stdout as the control channel.
pub struct ProcessSpawner {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerChannel>, OrchestratorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("SWARMFORGE_WORKER_ID", spec.worker_id.to_string())
            .env("SWARMFORGE_MEMORY_LIMIT_MB", spec.memory_limit_mb.to_string())
            .env("SWARMFORGE_TASK_TIMEOUT_MS", spec.task_timeout_ms.to_string())
            .env(
                "SWARMFORGE_PRESERVE_CONTEXT",
                if spec.preserve_context { "true" } else { "false" },
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| OrchestratorError::SpawnFailure(err.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::SpawnFailure("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::SpawnFailure("no stdout handle".into()))?;

        Ok(Box::new(ProcessWorkerChannel {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        }))
    }
}

struct ProcessWorkerChannel {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl WorkerChannel for ProcessWorkerChannel {
    async fn send(&mut self, message: ParentMessage) -> Result<(), OrchestratorError> {
        let mut line =
            serde_json::to_string(&message).map_err(|err| OrchestratorError::ConfigError(err.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| OrchestratorError::WorkerCrash(err.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ChildMessage>, OrchestratorError> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|err| OrchestratorError::WorkerCrash(err.to_string()))?;
        match line {
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|err| OrchestratorError::WorkerCrash(format!("malformed message: {err}"))),
            None => Ok(None),
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}
