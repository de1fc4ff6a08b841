//! Sandboxed execution of candidate modules.
//!
//! A [`SandboxRuntime`] runs one Python driver process over a staged
//! workspace and reports what happened; the [`harness`] turns a generated
//! module into a test suite and interprets the runtime's output. The
//! default runtime uses bubblewrap when available and falls back to a
//! resource-limited plain process.

pub mod driver;
pub mod harness;
mod process;
mod refiner;
mod scripted;

pub use harness::{HarnessRun, SandboxTestHarness};
pub use process::ProcessSandbox;
pub use refiner::{classify_failure, ClassifiedFailure, FailureClass};
pub use scripted::{ScriptedRun, ScriptedSandbox};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// A file staged into the sandbox workspace before execution.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// Workspace-relative path, e.g. `input/sample.csv`.
    pub path: String,
    pub contents: String,
}

/// One sandboxed driver execution.
#[derive(Debug, Clone)]
pub struct SandboxJob {
    pub module_name: String,
    pub source_code: String,
    /// JSON instructions the driver reads from `job.json`.
    pub payload: String,
    pub fixtures: Vec<Fixture>,
    /// Wall-clock budget for the whole process.
    pub timeout_ms: u64,
    pub network_enabled: bool,
}

/// Side effects observed while the module ran, reconstructed from the
/// journal the driver flushes to the workspace after every recorded event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EffectsJournal {
    /// Absolute paths opened for writing.
    #[serde(default)]
    pub writes: Vec<String>,
    /// Shell commands handed to the OS.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Network endpoints connected to.
    #[serde(default)]
    pub connections: Vec<String>,
}

impl EffectsJournal {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.commands.is_empty() && self.connections.is_empty()
    }

    pub fn merge(&mut self, other: &EffectsJournal) {
        self.writes.extend(other.writes.iter().cloned());
        self.commands.extend(other.commands.iter().cloned());
        self.connections.extend(other.connections.iter().cloned());
    }
}

/// Raw outcome of one sandbox run. A timeout is data here, not an error;
/// only infrastructure faults (spawn failure, workspace IO) surface as `Err`.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub effects: EffectsJournal,
    /// Per-case progress the driver flushed before the process ended, used
    /// to salvage results when the suite deadline killed it mid-run.
    pub progress: Vec<driver::DriverCaseResult>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn run(&self, job: &SandboxJob) -> EngineResult<RunOutput>;
}
