/// Verdict Reporter
///
/// Total mapping from judging results onto the response contract. Internal
/// faults are the only case logged for operators.
use crate::debug_fix::FixAssessment;
use crate::error::JudgeError;
use crate::harness::Verdict;
use crate::sandbox::ExecutionOutcome;
use tracing::error;
use tribunal_common::types::{DebugFixResponse, JudgeResponse, OutcomeKind};

fn log_if_internal(err: &JudgeError) {
    if let JudgeError::Internal(message) = err {
        error!(error = %message, "Internal judge fault");
    }
}

/// Overall outcome of a failed verdict follows its first failing case
fn failure_outcome(outcome: &ExecutionOutcome) -> OutcomeKind {
    match outcome {
        ExecutionOutcome::Value(_) => OutcomeKind::Rejected,
        ExecutionOutcome::RuntimeFailure(_) => OutcomeKind::RuntimeFailure,
        ExecutionOutcome::Timeout => OutcomeKind::Timeout,
        ExecutionOutcome::ResourceLimitExceeded(_) => OutcomeKind::ResourceLimitExceeded,
        ExecutionOutcome::DefinitionMissing => OutcomeKind::MissingEntryPoint,
    }
}

pub fn report_verdict(result: Result<Verdict, JudgeError>) -> JudgeResponse {
    let verdict = match result {
        Ok(verdict) => verdict,
        Err(err) => {
            log_if_internal(&err);
            return JudgeResponse::without_cases(err.outcome(), err.to_string());
        }
    };

    let passed_cases = verdict.passed_cases();
    let (outcome, message) = match verdict.first_failure() {
        None if verdict.passed => (
            OutcomeKind::Accepted,
            format!("All {} test cases passed", verdict.total_cases),
        ),
        // Unreachable in practice: not passed yet no failing case
        None => (OutcomeKind::Rejected, "Not every test case ran".to_string()),
        Some(first) if verdict.stopped_early => (
            failure_outcome(&first.outcome),
            format!("Failed test case {} of {}", first.index + 1, verdict.total_cases),
        ),
        Some(first) => (
            failure_outcome(&first.outcome),
            format!(
                "Failed {}/{} test cases",
                verdict.cases.len() - passed_cases,
                verdict.total_cases
            ),
        ),
    };

    JudgeResponse {
        passed: verdict.passed,
        outcome,
        message,
        failed_cases: verdict.failed_cases(),
        total_cases: verdict.total_cases,
        passed_cases,
        stopped_early: verdict.stopped_early,
    }
}

pub fn report_fix(result: Result<FixAssessment, JudgeError>) -> DebugFixResponse {
    let assessment = match result {
        Ok(assessment) => assessment,
        Err(err) => {
            log_if_internal(&err);
            let message = match &err {
                JudgeError::Parse(message) => format!("Syntax Error in fixed code: {}", message),
                JudgeError::MissingEntryPoint(name) => format!("Function must be named '{}'", name),
                JudgeError::RuntimeFailure(message) => format!("Runtime Error in fixed code: {}", message),
                other => other.to_string(),
            };
            return DebugFixResponse::invalid(err.outcome(), message);
        }
    };

    let failed_cases = assessment.failed_cases();
    let advice = assessment.advice.unwrap_or_default();
    DebugFixResponse {
        valid: assessment.valid,
        passed: assessment.matches_expected,
        outcome: if assessment.valid {
            OutcomeKind::Accepted
        } else {
            OutcomeKind::Rejected
        },
        message: assessment.message,
        behavior_changed: assessment.behavior_changed,
        matches_expected: assessment.matches_expected,
        failed_cases,
        explanation: advice.explanation,
        reference_solution: advice.reference_solution,
    }
}
