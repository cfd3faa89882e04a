// Local judging commands
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tribunal_common::config::{JudgeSettings, LanguageConfigManager};
use tribunal_common::types::{DebugFixRequest, DebugFixResponse, EvaluateRequest, FailedCase, JudgeResponse, TestCase};
use tribunal_engine::JudgeService;

pub struct EvaluateArgs<'a> {
    pub code: &'a Path,
    pub tests: &'a Path,
    pub language: String,
    pub entry_point: Option<String>,
    pub timeout_ms: Option<u64>,
    pub run_all: bool,
    pub json: bool,
}

pub struct DebugFixArgs<'a> {
    pub original: &'a Path,
    pub fix: &'a Path,
    pub tests: &'a Path,
    pub language: String,
    pub entry_point: Option<String>,
    pub original_entry_point: Option<String>,
    pub explain: bool,
    pub json: bool,
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Accepts both `[{"input": .., "expected_output": ..}]` and `[[input, expected]]`
fn parse_test_cases(content: &str) -> Result<Vec<TestCase>> {
    serde_json::from_str(content).context("Test file must be a JSON array of test cases")
}

fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    parse_test_cases(&read_source(path)?).with_context(|| format!("Invalid test file {}", path.display()))
}

fn build_service() -> Result<JudgeService> {
    let settings = JudgeSettings::from_env()?;
    let languages = LanguageConfigManager::load(&settings.languages_path)
        .context("Failed to load language configurations")?;
    JudgeService::from_settings(settings, &languages)
}

fn describe_failure(case: &FailedCase) -> String {
    match case {
        FailedCase::Mismatch {
            index,
            input,
            expected,
            actual,
        } => format!(
            "  ❌ case {}: input {} expected {} got {}",
            index + 1,
            input,
            expected,
            actual
        ),
        FailedCase::Errored { index, input, error } => {
            format!("  ❌ case {}: input {} raised {}", index + 1, input, error)
        }
    }
}

fn render_judge(response: &JudgeResponse) -> String {
    let mut out = String::new();
    let mark = if response.passed { "✅" } else { "❌" };
    let _ = writeln!(out, "{} {} [{}]", mark, response.message, response.outcome);
    if response.total_cases > 0 {
        let _ = writeln!(out, "   {}/{} passed", response.passed_cases, response.total_cases);
    }
    for case in &response.failed_cases {
        let _ = writeln!(out, "{}", describe_failure(case));
    }
    if response.stopped_early {
        let _ = writeln!(out, "   (stopped at the first failure, pass --all to run every case)");
    }
    out
}

fn render_fix(response: &DebugFixResponse) -> String {
    let mut out = String::new();
    let mark = if response.valid { "✅" } else { "❌" };
    let _ = writeln!(out, "{} {} [{}]", mark, response.message, response.outcome);
    let _ = writeln!(
        out,
        "   behavior changed: {}, matches expected: {}",
        response.behavior_changed, response.matches_expected
    );
    for case in &response.failed_cases {
        let _ = writeln!(out, "{}", describe_failure(case));
    }
    if let Some(explanation) = &response.explanation {
        let _ = writeln!(out, "\n💡 {}", explanation);
    }
    if let Some(solution) = &response.reference_solution {
        let _ = writeln!(out, "\n📄 Reference solution:\n{}", solution);
    }
    out
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize response")?);
    Ok(())
}

/// Interactive practice: stops at the first failure unless `run_all`
pub async fn evaluate(args: EvaluateArgs<'_>) -> Result<bool> {
    let mut request = EvaluateRequest::new(args.language, read_source(args.code)?, load_test_cases(args.tests)?);
    request.entry_point = args.entry_point;
    request.timeout_ms = args.timeout_ms;
    request.stop_on_first_failure = Some(!args.run_all);

    let response = build_service()?.evaluate(request, !args.run_all).await;
    if args.json {
        print_json(&response)?;
    } else {
        print!("{}", render_judge(&response));
    }
    Ok(response.passed)
}

pub async fn debug_fix(args: DebugFixArgs<'_>) -> Result<bool> {
    let mut request = DebugFixRequest::new(
        args.language,
        read_source(args.original)?,
        read_source(args.fix)?,
        load_test_cases(args.tests)?,
    );
    request.entry_point = args.entry_point;
    request.original_entry_point = args.original_entry_point;
    request.explain = args.explain;

    let response = build_service()?.evaluate_fix(request).await;
    if args.json {
        print_json(&response)?;
    } else {
        print!("{}", render_fix(&response));
    }
    Ok(response.valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tribunal_common::types::OutcomeKind;

    #[test]
    fn test_parse_both_test_case_forms() {
        let cases = parse_test_cases(r#"[{"input": [2, 3], "expected_output": 5}, [[1, 1], 2], ["abc", "cba"]]"#).unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[1], TestCase::new(json!([1, 1]), json!(2)));
        assert_eq!(cases[2].input, json!("abc"));

        assert!(parse_test_cases(r#"{"input": 1}"#).is_err());
    }

    #[test]
    fn test_render_failures() {
        let response = JudgeResponse {
            passed: false,
            outcome: OutcomeKind::Rejected,
            message: "Failed test case 1 of 3".into(),
            failed_cases: vec![FailedCase::Mismatch {
                index: 0,
                input: json!([2, 3]),
                expected: json!(5),
                actual: json!(6),
            }],
            total_cases: 3,
            passed_cases: 0,
            stopped_early: true,
        };
        let text = render_judge(&response);
        assert!(text.contains("case 1: input [2,3] expected 5 got 6"));
        assert!(text.contains("--all"));
    }

    #[test]
    fn test_render_fix_with_advice() {
        let mut response = DebugFixResponse::invalid(OutcomeKind::Rejected, "Bug still exists");
        response.explanation = Some("Same operator as before.".into());
        let text = render_fix(&response);
        assert!(text.contains("Bug still exists"));
        assert!(text.contains("Same operator as before."));
        assert!(!text.contains("Reference solution"));
    }
}
