/// Test Harness
///
/// **Responsibility:**
/// Run one submission against an ordered list of test cases through a
/// sandbox and aggregate the outcomes into a Verdict.
///
/// **Policy:**
/// - The module is loaded once up front. A missing entry point (or a source
///   that cannot even be loaded) short-circuits before any case runs.
/// - Every case is a separate invocation in a fresh sandbox context.
/// - `stop_on_first_failure` selects fast feedback (interactive practice)
///   or full diagnostics (batch grading).
/// - A case passes only when it returns a value equal to the expected one.
///
/// Knows nothing about HTTP, Redis or response shapes.
use crate::adapter::{canonical_args, values_match};
use crate::error::{JudgeError, SandboxError};
use crate::sandbox::{ExecutionOutcome, LoadOutcome, Sandbox};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};
use tribunal_common::types::{FailedCase, TestCase};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub stop_on_first_failure: bool,
    pub case_timeout: Duration,
    /// Ignored (treated as 1) when `stop_on_first_failure` is set
    pub max_parallel_cases: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            stop_on_first_failure: false,
            case_timeout: Duration::from_secs(5),
            max_parallel_cases: 4,
        }
    }
}

/// The code under judgement
#[derive(Debug, Clone)]
pub struct Submission {
    pub source: String,
    pub entry_point: String,
}

impl Submission {
    pub fn new(source: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseResult {
    pub index: usize,
    pub input: Value,
    pub expected: Value,
    pub outcome: ExecutionOutcome,
    pub passed: bool,
}

impl CaseResult {
    pub(crate) fn new(index: usize, case: &TestCase, outcome: ExecutionOutcome) -> Self {
        let passed = matches!(&outcome, ExecutionOutcome::Value(actual) if values_match(actual, &case.expected_output));
        Self {
            index,
            input: case.input.clone(),
            expected: case.expected_output.clone(),
            outcome,
            passed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub entry_point: String,
    pub case_timeout: Duration,
    /// Cases that actually ran, in test-case order
    pub cases: Vec<CaseResult>,
    pub total_cases: usize,
    pub stopped_early: bool,
}

impl Verdict {
    pub fn passed_cases(&self) -> usize {
        self.cases.iter().filter(|case| case.passed).count()
    }

    pub fn first_failure(&self) -> Option<&CaseResult> {
        self.cases.iter().find(|case| !case.passed)
    }

    pub fn failed_cases(&self) -> Vec<FailedCase> {
        self.cases
            .iter()
            .filter(|case| !case.passed)
            .map(|case| failed_case(case, &self.entry_point, self.case_timeout))
            .collect()
    }
}

/// `{input, expected, actual}` for wrong answers, `{input, error}` for everything else
pub fn failed_case(case: &CaseResult, entry_point: &str, case_timeout: Duration) -> FailedCase {
    let error = match &case.outcome {
        ExecutionOutcome::Value(actual) => {
            return FailedCase::Mismatch {
                index: case.index,
                input: case.input.clone(),
                expected: case.expected.clone(),
                actual: actual.clone(),
            }
        }
        ExecutionOutcome::RuntimeFailure(message) => message.clone(),
        ExecutionOutcome::Timeout => JudgeError::Timeout(case_timeout.as_millis() as u64).to_string(),
        ExecutionOutcome::ResourceLimitExceeded(message) => {
            JudgeError::ResourceLimitExceeded(message.clone()).to_string()
        }
        ExecutionOutcome::DefinitionMissing => JudgeError::MissingEntryPoint(entry_point.to_string()).to_string(),
    };
    FailedCase::Errored {
        index: case.index,
        input: case.input.clone(),
        error,
    }
}

/// Load once and turn anything but a successful load into a terminal error
pub async fn precheck(sandbox: &dyn Sandbox, submission: &Submission, deadline: Duration) -> Result<Vec<String>, JudgeError> {
    match sandbox.load(&submission.source, &submission.entry_point, deadline).await? {
        LoadOutcome::Loaded { functions } => Ok(functions),
        LoadOutcome::ParseError(message) => Err(JudgeError::Parse(message)),
        LoadOutcome::DefinitionMissing { .. } => Err(JudgeError::MissingEntryPoint(submission.entry_point.clone())),
        LoadOutcome::LoadFailure(message) => Err(JudgeError::RuntimeFailure(message)),
        LoadOutcome::Timeout => Err(JudgeError::Timeout(deadline.as_millis() as u64)),
        LoadOutcome::ResourceLimitExceeded(message) => Err(JudgeError::ResourceLimitExceeded(message)),
    }
}

async fn run_case(
    sandbox: &dyn Sandbox,
    submission: &Submission,
    index: usize,
    case: &TestCase,
    deadline: Duration,
) -> Result<CaseResult, SandboxError> {
    let outcome = sandbox
        .invoke(&submission.source, &submission.entry_point, canonical_args(&case.input), deadline)
        .await?;
    let result = CaseResult::new(index, case, outcome);
    debug!(case = index, passed = result.passed, "Test case finished");
    Ok(result)
}

#[instrument(skip_all, fields(entry_point = %submission.entry_point, cases = test_cases.len()))]
pub async fn run_tests(
    sandbox: &dyn Sandbox,
    submission: &Submission,
    test_cases: &[TestCase],
    config: &HarnessConfig,
) -> Result<Verdict, JudgeError> {
    precheck(sandbox, submission, config.case_timeout).await?;

    let parallelism = if config.stop_on_first_failure {
        1
    } else {
        config.max_parallel_cases.max(1)
    };

    // Futures are lazy: nothing runs until the stream polls it
    let runs: Vec<_> = test_cases
        .iter()
        .enumerate()
        .map(|(index, case)| run_case(sandbox, submission, index, case, config.case_timeout))
        .collect();
    // Order-preserving; dropping the stream cancels in-flight invocations
    let mut results = stream::iter(runs).buffered(parallelism);

    let mut cases = Vec::with_capacity(test_cases.len());
    let mut stopped_early = false;
    while let Some(result) = results.next().await {
        let case = result?;
        let failed = !case.passed;
        cases.push(case);
        if failed && config.stop_on_first_failure {
            stopped_early = cases.len() < test_cases.len();
            break;
        }
    }

    let passed = cases.len() == test_cases.len() && cases.iter().all(|case| case.passed);
    Ok(Verdict {
        passed,
        entry_point: submission.entry_point.clone(),
        case_timeout: config.case_timeout,
        cases,
        total_cases: test_cases.len(),
        stopped_early,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::scripted::{binary, Program, ScriptedSandbox};
    use serde_json::json;

    const ADD: &str = "def solution(a, b): return a + b";

    fn cases() -> Vec<TestCase> {
        vec![
            TestCase::new(json!([2, 3]), json!(5)),
            TestCase::new(json!([10, -4]), json!(6)),
            TestCase::new(json!([0, 0]), json!(0)),
        ]
    }

    fn config(stop_on_first_failure: bool) -> HarnessConfig {
        HarnessConfig {
            stop_on_first_failure,
            case_timeout: Duration::from_millis(500),
            max_parallel_cases: 4,
        }
    }

    #[tokio::test]
    async fn test_runs_on_a_spawned_task() {
        let sandbox: std::sync::Arc<dyn Sandbox> =
            std::sync::Arc::new(ScriptedSandbox::new().with(ADD, binary(&["solution"], |a, b| a + b)));
        let verdict = tokio::spawn(async move {
            let submission = Submission::new(ADD, "solution");
            run_tests(sandbox.as_ref(), &submission, &cases(), &config(false)).await
        })
        .await
        .unwrap()
        .unwrap();

        assert!(verdict.passed);
        assert_eq!(verdict.cases.len(), 3);
    }

    #[tokio::test]
    async fn test_correct_submission_passes() {
        let sandbox = ScriptedSandbox::new().with(ADD, binary(&["solution"], |a, b| a + b));
        let verdict = run_tests(&sandbox, &Submission::new(ADD, "solution"), &cases(), &config(false))
            .await
            .unwrap();

        assert!(verdict.passed);
        assert_eq!(verdict.passed_cases(), 3);
        assert!(verdict.failed_cases().is_empty());
        assert!(!verdict.stopped_early);
    }

    #[tokio::test]
    async fn test_missing_entry_point_short_circuits() {
        let source = "def add(a, b): return a + b";
        let sandbox = ScriptedSandbox::new().with(source, binary(&["add"], |a, b| a + b));

        let err = run_tests(&sandbox, &Submission::new(source, "solution"), &cases(), &config(false))
            .await
            .unwrap_err();

        assert!(matches!(err, JudgeError::MissingEntryPoint(ref name) if name == "solution"));
        assert_eq!(sandbox.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_parse_error_short_circuits() {
        let source = "def solution(a, b) return a";
        let sandbox = ScriptedSandbox::new().with(source, Program::parse_error("expected ':' (line 1)"));

        let err = run_tests(&sandbox, &Submission::new(source, "solution"), &cases(), &config(false))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Parse(_)));
        assert_eq!(sandbox.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_full_aggregation_records_every_failure() {
        let source = "def solution(a, b): return a * b";
        let sandbox = ScriptedSandbox::new().with(source, binary(&["solution"], |a, b| a * b));

        let verdict = run_tests(&sandbox, &Submission::new(source, "solution"), &cases(), &config(false))
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert_eq!(verdict.cases.len(), 3);
        assert_eq!(
            verdict.failed_cases(),
            vec![
                FailedCase::Mismatch {
                    index: 0,
                    input: json!([2, 3]),
                    expected: json!(5),
                    actual: json!(6),
                },
                FailedCase::Mismatch {
                    index: 1,
                    input: json!([10, -4]),
                    expected: json!(6),
                    actual: json!(-40),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_on_first_failure() {
        let source = "def solution(a, b): return a * b";
        let sandbox = ScriptedSandbox::new().with(source, binary(&["solution"], |a, b| a * b));

        let verdict = run_tests(&sandbox, &Submission::new(source, "solution"), &cases(), &config(true))
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert!(verdict.stopped_early);
        assert_eq!(verdict.cases.len(), 1);
        assert_eq!(sandbox.invocation_count(), 1);
    }

    #[tokio::test]
    async fn test_errors_and_timeouts_do_not_abort_other_cases() {
        let source = "def solution(x): ...";
        let program = Program::defining(&["solution"], |_, args| match args[0].as_i64() {
            Some(0) => ExecutionOutcome::RuntimeFailure("ZeroDivisionError: division by zero".into()),
            Some(-1) => ExecutionOutcome::Timeout,
            Some(n) => ExecutionOutcome::Value(json!(100 / n)),
            None => ExecutionOutcome::RuntimeFailure("TypeError".into()),
        });
        let sandbox = ScriptedSandbox::new().with(source, program);
        let cases = vec![
            TestCase::new(json!(0), json!(0)),
            TestCase::new(json!(-1), json!(-100)),
            TestCase::new(json!(4), json!(25)),
        ];

        let verdict = run_tests(&sandbox, &Submission::new(source, "solution"), &cases, &config(false))
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert_eq!(verdict.passed_cases(), 1);
        let failed = verdict.failed_cases();
        assert_eq!(
            failed[0],
            FailedCase::Errored {
                index: 0,
                input: json!(0),
                error: "ZeroDivisionError: division by zero".into(),
            }
        );
        assert_eq!(
            failed[1],
            FailedCase::Errored {
                index: 1,
                input: json!(-1),
                error: "Execution timed out after 500ms".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_scalar_and_list_inputs_use_same_adapter() {
        let source = "def solution(xs): return sum(xs)";
        let program = Program::defining(&["solution"], |_, args| match args {
            [Value::Array(items)] => ExecutionOutcome::Value(json!(items.iter().filter_map(Value::as_i64).sum::<i64>())),
            _ => ExecutionOutcome::RuntimeFailure(format!("TypeError: got {} arguments", args.len())),
        });
        let sandbox = ScriptedSandbox::new().with(source, program);
        let cases = vec![
            TestCase::new(json!([[1, 2, 3]]), json!(6)),
            TestCase::new(json!([1, 2, 3]), json!(6)),
        ];

        let verdict = run_tests(&sandbox, &Submission::new(source, "solution"), &cases, &config(false))
            .await
            .unwrap();

        assert!(verdict.cases[0].passed);
        assert!(!verdict.cases[1].passed);
        assert!(matches!(
            &verdict.failed_cases()[0],
            FailedCase::Errored { error, .. } if error == "TypeError: got 3 arguments"
        ));
    }

    #[tokio::test]
    async fn test_sandbox_fault_is_internal() {
        let source = "boom";
        let sandbox = ScriptedSandbox::new().with(source, Program::faulty());

        let err = run_tests(&sandbox, &Submission::new(source, "solution"), &cases(), &config(false))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Internal(_)));
    }

    #[tokio::test]
    async fn test_judging_twice_is_idempotent() {
        let sandbox = ScriptedSandbox::new().with(ADD, binary(&["solution"], |a, b| a + b));
        let submission = Submission::new(ADD, "solution");

        let first = run_tests(&sandbox, &submission, &cases(), &config(false)).await.unwrap();
        let second = run_tests(&sandbox, &submission, &cases(), &config(false)).await.unwrap();

        assert_eq!(first.passed, second.passed);
        assert_eq!(first.failed_cases(), second.failed_cases());
        assert_eq!(sandbox.invocation_count(), 6);
    }
}
