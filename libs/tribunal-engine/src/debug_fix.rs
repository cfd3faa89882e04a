/// Debug-Fix Validator
///
/// Decides whether a candidate's fix actually repairs the defect seeded in
/// the original code. Two separate questions are asked per test case:
/// - did the fix change observable behaviour relative to the original?
/// - does the fix return the expected value?
///
/// The original code's output is only ever used for the first question.
/// A fix is valid when every case is correct and at least one case changed.
use crate::adapter::{canonical_args, values_match};
use crate::advisor::{Advice, AdviceRequest, Advisor};
use crate::error::{JudgeError, SandboxError};
use crate::harness::{self, CaseResult, Submission};
use crate::sandbox::{ExecutionOutcome, LoadOutcome, Sandbox, SyntaxCheck};
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use tribunal_common::types::{FailedCase, TestCase};

#[derive(Debug, Clone)]
pub struct FixConfig {
    pub case_timeout: Duration,
    pub max_parallel_cases: usize,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            case_timeout: Duration::from_secs(5),
            max_parallel_cases: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixCase {
    /// Any non-value outcome of the original counts as its crash sentinel
    pub original: ExecutionOutcome,
    pub fixed: CaseResult,
    pub changed: bool,
}

impl FixCase {
    pub fn correct(&self) -> bool {
        self.fixed.passed
    }
}

#[derive(Debug, Clone)]
pub struct FixAssessment {
    pub syntax_valid: bool,
    pub behavior_changed: bool,
    pub matches_expected: bool,
    pub valid: bool,
    pub message: String,
    pub entry_point: String,
    pub original_entry_point: String,
    pub case_timeout: Duration,
    pub cases: Vec<FixCase>,
    pub advice: Option<Advice>,
}

impl FixAssessment {
    /// Cases where the fix did not return the expected value
    pub fn failed_cases(&self) -> Vec<FailedCase> {
        self.cases
            .iter()
            .filter(|case| !case.correct())
            .map(|case| harness::failed_case(&case.fixed, &self.entry_point, self.case_timeout))
            .collect()
    }

    fn summary(&self) -> String {
        format!(
            "valid={} behavior_changed={} matches_expected={}: {}",
            self.valid, self.behavior_changed, self.matches_expected, self.message
        )
    }
}

/// Value vs value compares by value; value vs failure is a change;
/// failure vs failure is not.
pub fn behavior_changed(original: &ExecutionOutcome, fixed: &ExecutionOutcome) -> bool {
    match (original, fixed) {
        (ExecutionOutcome::Value(before), ExecutionOutcome::Value(after)) => !values_match(before, after),
        (ExecutionOutcome::Value(_), _) | (_, ExecutionOutcome::Value(_)) => true,
        _ => false,
    }
}

/// Which function of the original code corresponds to the fix's entry point
async fn resolve_original_entry_point(
    sandbox: &dyn Sandbox,
    original_code: &str,
    fix_entry_point: &str,
    explicit: Option<&str>,
    deadline: Duration,
) -> Result<String, JudgeError> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }

    match sandbox.load(original_code, fix_entry_point, deadline).await? {
        LoadOutcome::Loaded { .. } => Ok(fix_entry_point.to_string()),
        LoadOutcome::DefinitionMissing { functions } => match functions.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(JudgeError::InvalidRequest(format!(
                "Cannot tell which function of the original code to compare against (found {}); set original_entry_point",
                if functions.is_empty() {
                    "none".to_string()
                } else {
                    functions.join(", ")
                }
            ))),
        },
        // Unloadable original: every run of it is the crash sentinel
        other => {
            debug!(outcome = ?other, "Original code does not load");
            Ok(fix_entry_point.to_string())
        }
    }
}

async fn run_pair(
    sandbox: &dyn Sandbox,
    original: &Submission,
    fix: &Submission,
    index: usize,
    case: &TestCase,
    deadline: Duration,
) -> Result<FixCase, SandboxError> {
    // Independent invocations, each in its own fresh context
    let (original_outcome, fixed_outcome) = tokio::join!(
        sandbox.invoke(&original.source, &original.entry_point, canonical_args(&case.input), deadline),
        sandbox.invoke(&fix.source, &fix.entry_point, canonical_args(&case.input), deadline),
    );
    let original_outcome = original_outcome?;
    let fixed = CaseResult::new(index, case, fixed_outcome?);
    let changed = behavior_changed(&original_outcome, &fixed.outcome);

    Ok(FixCase {
        original: original_outcome,
        fixed,
        changed,
    })
}

#[instrument(skip_all, fields(entry_point = %fix.entry_point, cases = test_cases.len()))]
pub async fn validate_fix(
    sandbox: &dyn Sandbox,
    original_code: &str,
    fix: &Submission,
    original_entry_point: Option<&str>,
    test_cases: &[TestCase],
    config: &FixConfig,
) -> Result<FixAssessment, JudgeError> {
    if let SyntaxCheck::Invalid(message) = sandbox.check_syntax(&fix.source).await? {
        return Err(JudgeError::Parse(message));
    }

    harness::precheck(sandbox, fix, config.case_timeout).await?;

    let original_entry = resolve_original_entry_point(
        sandbox,
        original_code,
        &fix.entry_point,
        original_entry_point,
        config.case_timeout,
    )
    .await?;
    let original = Submission::new(original_code, original_entry);

    let pairs: Vec<_> = test_cases
        .iter()
        .enumerate()
        .map(|(index, case)| run_pair(sandbox, &original, fix, index, case, config.case_timeout))
        .collect();
    let cases: Vec<FixCase> = stream::iter(pairs)
        .buffered(config.max_parallel_cases.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    let behavior_changed = cases.iter().any(|case| case.changed);
    let incorrect = cases.iter().filter(|case| !case.correct()).count();
    let matches_expected = incorrect == 0;
    let valid = behavior_changed && matches_expected;

    let message = if valid {
        "All bugs fixed!".to_string()
    } else if !behavior_changed {
        "Bug still exists: the fix behaves exactly like the original code on every test case".to_string()
    } else {
        format!(
            "Fix does not produce the expected output for {}/{} test cases",
            incorrect,
            cases.len()
        )
    };

    Ok(FixAssessment {
        syntax_valid: true,
        behavior_changed,
        matches_expected,
        valid,
        message,
        entry_point: fix.entry_point.clone(),
        original_entry_point: original.entry_point,
        case_timeout: config.case_timeout,
        cases,
        advice: None,
    })
}

/// Ask the advisor for an explanation; never changes the mechanical verdict
pub async fn attach_advice(
    mut assessment: FixAssessment,
    advisor: &dyn Advisor,
    original_code: &str,
    fix: &Submission,
    test_cases: &[TestCase],
) -> FixAssessment {
    let summary = assessment.summary();
    let request = AdviceRequest {
        original_code,
        fixed_code: &fix.source,
        test_cases,
        verdict: &summary,
    };

    match tokio::time::timeout(advisor.timeout(), advisor.advise(&request)).await {
        Ok(Ok(advice)) => assessment.advice = Some(advice),
        Ok(Err(e)) => warn!(error = %e, "Advisor unavailable, continuing without explanation"),
        Err(_) => warn!(
            timeout_ms = advisor.timeout().as_millis() as u64,
            "Advisor timed out, continuing without explanation"
        ),
    }
    assessment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::AdvisorError;
    use crate::sandbox::scripted::{binary, Program, ScriptedSandbox};
    use async_trait::async_trait;
    use serde_json::json;

    const BUGGY: &str = "def add(a, b):\n    return a * b\n";
    const FIXED: &str = "def add(a, b):\n    return a + b\n";
    const FIXED_SOLUTION: &str = "def solution(a, b):\n    return a + b\n";

    fn sandbox() -> ScriptedSandbox {
        ScriptedSandbox::new()
            .with(BUGGY, binary(&["add"], |a, b| a * b))
            .with(FIXED, binary(&["add"], |a, b| a + b))
            .with(FIXED_SOLUTION, binary(&["solution"], |a, b| a + b))
    }

    fn config() -> FixConfig {
        FixConfig {
            case_timeout: Duration::from_millis(500),
            max_parallel_cases: 2,
        }
    }

    #[tokio::test]
    async fn test_operator_fix_is_valid() {
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        let assessment = validate_fix(&sandbox(), BUGGY, &Submission::new(FIXED, "add"), None, &cases, &config())
            .await
            .unwrap();

        assert!(assessment.valid);
        assert!(assessment.behavior_changed);
        assert!(assessment.matches_expected);
        assert_eq!(assessment.message, "All bugs fixed!");
        assert_eq!(assessment.cases[0].original, ExecutionOutcome::Value(json!(6)));
    }

    #[tokio::test]
    async fn test_validates_on_a_spawned_task() {
        let sandbox: std::sync::Arc<dyn Sandbox> = std::sync::Arc::new(sandbox());
        let assessment = tokio::spawn(async move {
            let cases = vec![TestCase::new(json!([2, 3]), json!(5)), TestCase::new(json!([4, 4]), json!(8))];
            validate_fix(sandbox.as_ref(), BUGGY, &Submission::new(FIXED, "add"), None, &cases, &config()).await
        })
        .await
        .unwrap()
        .unwrap();

        assert!(assessment.valid);
        assert_eq!(assessment.cases.len(), 2);
    }

    #[tokio::test]
    async fn test_noop_fix_is_invalid() {
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        let assessment = validate_fix(&sandbox(), BUGGY, &Submission::new(BUGGY, "add"), None, &cases, &config())
            .await
            .unwrap();

        assert!(!assessment.valid);
        assert!(!assessment.behavior_changed);
        assert!(assessment.message.starts_with("Bug still exists"));
        assert_eq!(
            assessment.failed_cases(),
            vec![FailedCase::Mismatch {
                index: 0,
                input: json!([2, 3]),
                expected: json!(5),
                actual: json!(6),
            }]
        );
    }

    #[tokio::test]
    async fn test_original_entry_point_is_discovered() {
        // The defective code defines `add`, the fix defines `solution`
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        let assessment = validate_fix(
            &sandbox(),
            BUGGY,
            &Submission::new(FIXED_SOLUTION, "solution"),
            None,
            &cases,
            &config(),
        )
        .await
        .unwrap();

        assert_eq!(assessment.original_entry_point, "add");
        assert!(assessment.valid);
    }

    #[tokio::test]
    async fn test_unchanged_case_that_was_already_right_is_fine() {
        // 2 * 2 == 2 + 2 so the first case cannot reveal the defect
        let cases = vec![
            TestCase::new(json!([2, 2]), json!(4)),
            TestCase::new(json!([2, 3]), json!(5)),
        ];
        let assessment = validate_fix(&sandbox(), BUGGY, &Submission::new(FIXED, "add"), None, &cases, &config())
            .await
            .unwrap();

        assert!(!assessment.cases[0].changed);
        assert!(assessment.cases[1].changed);
        assert!(assessment.valid);
    }

    #[tokio::test]
    async fn test_partial_fix_gets_no_credit() {
        let wrong = "def add(a, b):\n    return a - b\n";
        let sandbox = sandbox().with(wrong, binary(&["add"], |a, b| a - b));
        let cases = vec![
            TestCase::new(json!([2, 3]), json!(5)),
            TestCase::new(json!([0, 0]), json!(0)),
        ];

        let assessment = validate_fix(&sandbox, BUGGY, &Submission::new(wrong, "add"), None, &cases, &config())
            .await
            .unwrap();

        assert!(assessment.behavior_changed);
        assert!(!assessment.matches_expected);
        assert!(!assessment.valid);
        assert_eq!(assessment.message, "Fix does not produce the expected output for 1/2 test cases");
    }

    #[tokio::test]
    async fn test_crashing_original_uses_sentinel() {
        let crashing = "def add(a, b):\n    return a / 0\n";
        let sandbox = sandbox().with(
            crashing,
            Program::defining(&["add"], |_, _| {
                ExecutionOutcome::RuntimeFailure("ZeroDivisionError: division by zero".into())
            }),
        );
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];

        let assessment = validate_fix(&sandbox, crashing, &Submission::new(FIXED, "add"), None, &cases, &config())
            .await
            .unwrap();

        assert!(matches!(assessment.cases[0].original, ExecutionOutcome::RuntimeFailure(_)));
        assert!(assessment.cases[0].changed);
        assert!(assessment.valid);
    }

    #[test]
    fn test_failure_vs_failure_is_unchanged() {
        assert!(!behavior_changed(
            &ExecutionOutcome::RuntimeFailure("a".into()),
            &ExecutionOutcome::Timeout
        ));
        assert!(behavior_changed(&ExecutionOutcome::Timeout, &ExecutionOutcome::Value(json!(1))));
        assert!(!behavior_changed(
            &ExecutionOutcome::Value(json!(5)),
            &ExecutionOutcome::Value(json!(5.0))
        ));
    }

    #[tokio::test]
    async fn test_syntax_error_is_terminal() {
        let broken = "def add(a, b)\n    return a + b\n";
        let sandbox = sandbox().with(broken, Program::parse_error("expected ':' (line 1)"));
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];

        let err = validate_fix(&sandbox, BUGGY, &Submission::new(broken, "add"), None, &cases, &config())
            .await
            .unwrap_err();

        assert!(matches!(err, JudgeError::Parse(ref m) if m == "expected ':' (line 1)"));
        assert_eq!(sandbox.invocation_count(), 0);
        assert_eq!(sandbox.loads.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fix_missing_entry_point_is_terminal() {
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        let err = validate_fix(&sandbox(), BUGGY, &Submission::new(FIXED, "solution"), None, &cases, &config())
            .await
            .unwrap_err();

        assert!(matches!(err, JudgeError::MissingEntryPoint(_)));
    }

    #[tokio::test]
    async fn test_ambiguous_original_is_invalid_request() {
        let two = "def add(a, b): ...\ndef mul(a, b): ...\n";
        let sandbox = sandbox().with(two, binary(&["add", "mul"], |a, b| a * b));
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];

        let err = validate_fix(&sandbox, two, &Submission::new(FIXED_SOLUTION, "solution"), None, &cases, &config())
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::InvalidRequest(_)));

        let assessment = validate_fix(
            &sandbox,
            two,
            &Submission::new(FIXED_SOLUTION, "solution"),
            Some("mul"),
            &cases,
            &config(),
        )
        .await
        .unwrap();
        assert_eq!(assessment.original_entry_point, "mul");
        assert!(assessment.valid);
    }

    struct CannedAdvisor {
        result: Result<Advice, ()>,
        delay: Duration,
    }

    #[async_trait]
    impl Advisor for CannedAdvisor {
        async fn advise(&self, _request: &AdviceRequest<'_>) -> Result<Advice, AdvisorError> {
            tokio::time::sleep(self.delay).await;
            self.result
                .clone()
                .map_err(|_| AdvisorError::Unavailable("connection refused".into()))
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }
    }

    async fn assessed() -> FixAssessment {
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        validate_fix(&sandbox(), BUGGY, &Submission::new(FIXED, "add"), None, &cases, &config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_advice_is_attached_without_changing_verdict() {
        let advisor = CannedAdvisor {
            result: Ok(Advice {
                explanation: Some("The operator was wrong.".into()),
                reference_solution: Some("def add(a, b):\n    return a + b".into()),
            }),
            delay: Duration::ZERO,
        };
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        let assessment = attach_advice(assessed().await, &advisor, BUGGY, &Submission::new(FIXED, "add"), &cases).await;

        assert!(assessment.valid);
        assert_eq!(
            assessment.advice.unwrap().explanation.as_deref(),
            Some("The operator was wrong.")
        );
    }

    #[tokio::test]
    async fn test_advisor_failure_and_timeout_degrade() {
        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        let failing = CannedAdvisor {
            result: Err(()),
            delay: Duration::ZERO,
        };
        let assessment = attach_advice(assessed().await, &failing, BUGGY, &Submission::new(FIXED, "add"), &cases).await;
        assert!(assessment.valid);
        assert!(assessment.advice.is_none());

        let slow = CannedAdvisor {
            result: Ok(Advice::default()),
            delay: Duration::from_secs(5),
        };
        let assessment = attach_advice(assessed().await, &slow, BUGGY, &Submission::new(FIXED, "add"), &cases).await;
        assert!(assessment.advice.is_none());
    }
}
