//! In-memory sandbox for harness, validator and service tests. Sources are
//! looked up verbatim in a table of scripted programs, so no interpreter runs.
use super::{ExecutionOutcome, LoadOutcome, Sandbox, SyntaxCheck};
use crate::error::SandboxError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Behavior = Arc<dyn Fn(&str, &[Value]) -> ExecutionOutcome + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Program {
    functions: Vec<String>,
    parse_error: Option<String>,
    load_failure: Option<String>,
    faulty: bool,
    behavior: Behavior,
}

impl Program {
    /// Defines `functions`; every call goes through `behavior(entry_point, args)`
    pub(crate) fn defining<F>(functions: &[&str], behavior: F) -> Self
    where
        F: Fn(&str, &[Value]) -> ExecutionOutcome + Send + Sync + 'static,
    {
        Self {
            functions: functions.iter().map(|f| f.to_string()).collect(),
            parse_error: None,
            load_failure: None,
            faulty: false,
            behavior: Arc::new(behavior),
        }
    }

    pub(crate) fn parse_error(message: &str) -> Self {
        Self {
            parse_error: Some(message.to_string()),
            ..Self::defining(&[], |_, _| ExecutionOutcome::DefinitionMissing)
        }
    }

    pub(crate) fn load_failure(message: &str) -> Self {
        Self {
            load_failure: Some(message.to_string()),
            ..Self::defining(&[], |_, _| ExecutionOutcome::DefinitionMissing)
        }
    }

    /// Every operation fails inside the sandbox machinery
    pub(crate) fn faulty() -> Self {
        Self {
            faulty: true,
            ..Self::defining(&[], |_, _| ExecutionOutcome::DefinitionMissing)
        }
    }
}

/// Integer binary operation over the first two arguments
pub(crate) fn binary(functions: &[&str], op: fn(i64, i64) -> i64) -> Program {
    Program::defining(functions, move |_, args| {
        match (args.first().and_then(Value::as_i64), args.get(1).and_then(Value::as_i64)) {
            (Some(a), Some(b)) => ExecutionOutcome::Value(Value::from(op(a, b))),
            _ => ExecutionOutcome::RuntimeFailure("TypeError: expected two integers".to_string()),
        }
    })
}

#[derive(Default)]
pub(crate) struct ScriptedSandbox {
    programs: HashMap<String, Program>,
    pub(crate) invocations: AtomicUsize,
    pub(crate) loads: AtomicUsize,
}

impl ScriptedSandbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, source: &str, program: Program) -> Self {
        self.programs.insert(source.to_string(), program);
        self
    }

    pub(crate) fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn program(&self, source: &str) -> Result<&Program, SandboxError> {
        let program = self
            .programs
            .get(source)
            .ok_or_else(|| SandboxError::Protocol(format!("unscripted source: {}", source)))?;
        if program.faulty {
            return Err(SandboxError::Spawn("scripted sandbox fault".to_string()));
        }
        Ok(program)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn check_syntax(&self, source: &str) -> Result<SyntaxCheck, SandboxError> {
        let program = self.program(source)?;
        Ok(match &program.parse_error {
            Some(message) => SyntaxCheck::Invalid(message.clone()),
            None => SyntaxCheck::Valid,
        })
    }

    async fn load(&self, source: &str, entry_point: &str, _deadline: Duration) -> Result<LoadOutcome, SandboxError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let program = self.program(source)?;
        if let Some(message) = &program.parse_error {
            return Ok(LoadOutcome::ParseError(message.clone()));
        }
        if let Some(message) = &program.load_failure {
            return Ok(LoadOutcome::LoadFailure(message.clone()));
        }
        let functions = program.functions.clone();
        if functions.iter().any(|f| f == entry_point) {
            Ok(LoadOutcome::Loaded { functions })
        } else {
            Ok(LoadOutcome::DefinitionMissing { functions })
        }
    }

    async fn invoke(
        &self,
        source: &str,
        entry_point: &str,
        args: Vec<Value>,
        _deadline: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let program = self.program(source)?;
        if let Some(message) = &program.parse_error {
            return Ok(ExecutionOutcome::RuntimeFailure(format!("SyntaxError: {}", message)));
        }
        if let Some(message) = &program.load_failure {
            return Ok(ExecutionOutcome::RuntimeFailure(message.clone()));
        }
        if !program.functions.iter().any(|f| f == entry_point) {
            return Ok(ExecutionOutcome::DefinitionMissing);
        }
        Ok((program.behavior)(entry_point, &args))
    }
}
