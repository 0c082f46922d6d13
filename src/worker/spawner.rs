//! Worker unit spawning.
//!
//! The dispatcher starts worker units through the `WorkerSpawner` seam and
//! observes each one through `WorkerUnit`. `ProcessSpawner` runs every unit
//! as its own OS process, re-executing this binary with the hidden `worker`
//! subcommand; stdout carries the protocol and stderr is inherited.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use super::protocol::WorkerMessage;
use crate::error::SpawnError;

/// Parameters handed to a worker unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnParams {
    pub source_ref: String,
    pub max_memory_mb: Option<u64>,
}

/// How a worker unit ended its conversation with the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// The unit sent its message.
    Message(WorkerMessage),
    /// The unit exited abnormally without sending a message.
    /// `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    /// The unit broke the protocol.
    ProtocolViolation(String),
}

/// A running worker unit.
#[async_trait]
pub trait WorkerUnit: Send {
    /// Waits for the unit's message or exit.
    async fn next_outcome(&mut self) -> UnitOutcome;

    /// Terminates the unit.
    async fn kill(&mut self);

    /// Waits for the unit to exit after it sent its message.
    async fn reap(&mut self) -> Option<i32>;
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, params: &SpawnParams) -> Result<Box<dyn WorkerUnit>, SpawnError>;
}

/// Spawns each worker unit as a child process.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    /// Spawner re-executing `program` with `worker` plus the unit parameters.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Spawner re-executing the current binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable path cannot be resolved.
    pub fn current_exe() -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Replace the leading arguments passed before the unit parameters.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self, params: &SpawnParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--source-ref")
            .arg(&params.source_ref);

        if let Some(limit) = params.max_memory_mb {
            cmd.arg("--max-memory-mb").arg(limit.to_string());
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, params: &SpawnParams) -> Result<Box<dyn WorkerUnit>, SpawnError> {
        let mut child = self.command(params).spawn()?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingStdout)?;

        tracing::debug!(
            pid = ?child.id(),
            source_ref = %params.source_ref,
            "Spawned worker process"
        );

        Ok(Box::new(ProcessUnit {
            child,
            lines: BufReader::new(stdout).lines(),
        }))
    }
}

/// A worker unit backed by a child process.
pub struct ProcessUnit {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl ProcessUnit {
    async fn exit_outcome(&mut self) -> UnitOutcome {
        match self.child.wait().await {
            Ok(status) if status.success() => UnitOutcome::ProtocolViolation(
                "worker exited without sending a message".to_string(),
            ),
            Ok(status) => UnitOutcome::Exited {
                code: status.code(),
            },
            Err(e) => UnitOutcome::ProtocolViolation(format!("failed to wait for worker: {}", e)),
        }
    }
}

#[async_trait]
impl WorkerUnit for ProcessUnit {
    async fn next_outcome(&mut self) -> UnitOutcome {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    return match WorkerMessage::parse_line(&line) {
                        Ok(message) => UnitOutcome::Message(message),
                        Err(violation) => UnitOutcome::ProtocolViolation(violation),
                    };
                }
                Ok(None) => return self.exit_outcome().await,
                Err(e) => {
                    return UnitOutcome::ProtocolViolation(format!(
                        "unreadable worker output: {}",
                        e
                    ))
                }
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Worker process already gone");
        }
    }

    async fn reap(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }
}
