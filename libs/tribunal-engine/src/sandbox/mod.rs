/// Execution Sandbox
///
/// **Responsibility:**
/// Run one untrusted source unit in a throwaway context with a bounded
/// budget and hand back a typed outcome.
///
/// **Isolation model:**
/// Every operation starts a fresh interpreter (a local process or a
/// container, depending on the backend). Nothing survives between two
/// invocations, even for the same submission.
///
/// The sandbox never judges correctness; that is the harness's job.
pub mod docker;
pub mod process;
pub mod protocol;

#[cfg(test)]
pub(crate) mod scripted;

use crate::error::SandboxError;
use async_trait::async_trait;
use protocol::{Envelope, ReportStatus, RunMode, RunnerExit, RunnerResult};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use tribunal_common::config::LanguageConfig;

/// Upper bound for a compile-only run
const SYNTAX_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Value(Value),
    RuntimeFailure(String),
    Timeout,
    ResourceLimitExceeded(String),
    DefinitionMissing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyntaxCheck {
    Valid,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded { functions: Vec<String> },
    ParseError(String),
    LoadFailure(String),
    DefinitionMissing { functions: Vec<String> },
    Timeout,
    ResourceLimitExceeded(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Compile without executing anything
    async fn check_syntax(&self, source: &str) -> Result<SyntaxCheck, SandboxError>;

    /// Execute the module body and resolve `entry_point`, without calling it
    async fn load(&self, source: &str, entry_point: &str, deadline: Duration) -> Result<LoadOutcome, SandboxError>;

    /// Load into a fresh context and call `entry_point(*args)`
    async fn invoke(
        &self,
        source: &str,
        entry_point: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<ExecutionOutcome, SandboxError>;
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_limit: f32,
    pub max_processes: i64,
}

impl ResourceLimits {
    pub fn from_config(config: &LanguageConfig) -> Self {
        Self {
            memory_bytes: u64::from(config.memory_limit_mb) * 1024 * 1024,
            cpu_limit: config.cpu_limit,
            max_processes: config.max_processes,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_limit: 1.0,
            max_processes: 16,
        }
    }
}

/// Where the runner script actually executes
#[async_trait]
pub trait RunnerBackend: Send + Sync {
    async fn execute(
        &self,
        envelope: &Envelope,
        limits: &ResourceLimits,
        deadline: Duration,
    ) -> Result<RunnerExit, SandboxError>;
}

/// Python sandbox driving the embedded runner through a backend
pub struct PythonSandbox<B> {
    backend: B,
    limits: ResourceLimits,
}

impl<B: RunnerBackend> PythonSandbox<B> {
    pub fn new(backend: B, limits: ResourceLimits) -> Self {
        Self { backend, limits }
    }

    async fn run(&self, envelope: Envelope, deadline: Duration) -> Result<RunnerResult, SandboxError> {
        let exit = self.backend.execute(&envelope, &self.limits, deadline).await?;
        let result = protocol::classify(&exit, &envelope.nonce)?;
        if let RunnerResult::Report(report) = &result {
            if !report.stdout.is_empty() {
                debug!(captured_bytes = report.stdout.len(), "Submission wrote to stdout");
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl<B: RunnerBackend> Sandbox for PythonSandbox<B> {
    async fn check_syntax(&self, source: &str) -> Result<SyntaxCheck, SandboxError> {
        let envelope = Envelope::new(RunMode::Syntax, source, "", Vec::new());
        interpret_syntax(self.run(envelope, SYNTAX_DEADLINE).await?)
    }

    async fn load(&self, source: &str, entry_point: &str, deadline: Duration) -> Result<LoadOutcome, SandboxError> {
        let envelope = Envelope::new(RunMode::Probe, source, entry_point, Vec::new());
        Ok(interpret_load(self.run(envelope, deadline).await?))
    }

    async fn invoke(
        &self,
        source: &str,
        entry_point: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let envelope = Envelope::new(RunMode::Call, source, entry_point, args);
        let outcome = interpret_call(self.run(envelope, deadline).await?);
        debug!(entry_point, outcome = ?outcome_label(&outcome), "Invocation finished");
        Ok(outcome)
    }
}

fn outcome_label(outcome: &ExecutionOutcome) -> &'static str {
    match outcome {
        ExecutionOutcome::Value(_) => "value",
        ExecutionOutcome::RuntimeFailure(_) => "runtime_failure",
        ExecutionOutcome::Timeout => "timeout",
        ExecutionOutcome::ResourceLimitExceeded(_) => "resource_limit",
        ExecutionOutcome::DefinitionMissing => "definition_missing",
    }
}

fn interpret_syntax(result: RunnerResult) -> Result<SyntaxCheck, SandboxError> {
    match result {
        RunnerResult::Report(report) => match report.status {
            ReportStatus::Ok => Ok(SyntaxCheck::Valid),
            ReportStatus::ParseError => Ok(SyntaxCheck::Invalid(report.message)),
            other => Err(SandboxError::Protocol(format!(
                "unexpected status {:?} for a syntax check",
                other
            ))),
        },
        RunnerResult::Timeout => Ok(SyntaxCheck::Invalid("compilation exceeded the time limit".to_string())),
        RunnerResult::ResourceLimit(message) => Ok(SyntaxCheck::Invalid(message)),
        RunnerResult::Crashed(message) => Err(SandboxError::Protocol(format!(
            "syntax check crashed: {}",
            message
        ))),
    }
}

fn interpret_load(result: RunnerResult) -> LoadOutcome {
    match result {
        RunnerResult::Report(report) => match report.status {
            ReportStatus::Ok => LoadOutcome::Loaded {
                functions: report.functions,
            },
            ReportStatus::ParseError => LoadOutcome::ParseError(report.message),
            ReportStatus::DefinitionMissing => LoadOutcome::DefinitionMissing {
                functions: report.functions,
            },
            ReportStatus::ResourceLimit => LoadOutcome::ResourceLimitExceeded(report.message),
            ReportStatus::LoadError | ReportStatus::RuntimeError => LoadOutcome::LoadFailure(report.message),
        },
        RunnerResult::Timeout => LoadOutcome::Timeout,
        RunnerResult::ResourceLimit(message) => LoadOutcome::ResourceLimitExceeded(message),
        RunnerResult::Crashed(message) => LoadOutcome::LoadFailure(message),
    }
}

/// Parse and load failures surface as runtime failures at call time
fn interpret_call(result: RunnerResult) -> ExecutionOutcome {
    match result {
        RunnerResult::Report(report) => match report.status {
            ReportStatus::Ok => ExecutionOutcome::Value(report.value),
            ReportStatus::DefinitionMissing => ExecutionOutcome::DefinitionMissing,
            ReportStatus::ParseError => ExecutionOutcome::RuntimeFailure(format!("SyntaxError: {}", report.message)),
            ReportStatus::LoadError | ReportStatus::RuntimeError => ExecutionOutcome::RuntimeFailure(report.message),
            ReportStatus::ResourceLimit => ExecutionOutcome::ResourceLimitExceeded(report.message),
        },
        RunnerResult::Timeout => ExecutionOutcome::Timeout,
        RunnerResult::ResourceLimit(message) => ExecutionOutcome::ResourceLimitExceeded(message),
        RunnerResult::Crashed(message) => ExecutionOutcome::RuntimeFailure(message),
    }
}
