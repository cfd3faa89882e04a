use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Function name a submission must define unless the request names another one
pub const DEFAULT_ENTRY_POINT: &str = "solution";

/// Safety limits applied before anything reaches a sandbox
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_CASES: usize = 256;
pub const MAX_TEST_INPUT_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    #[serde(alias = "c++")]
    Cpp,
    Go,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::Cpp,
        Language::Go,
    ];

    /// Lenient, case-insensitive lookup used for request payloads
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "java" => Some(Language::Java),
            "cpp" | "c++" => Some(Language::Cpp),
            "go" | "golang" => Some(Language::Go),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (input, expected output) pair. Inputs are polymorphic: an array is
/// spread into positional arguments, any other value is the sole argument.
///
/// Accepted wire shapes: `{"input": .., "expected_output": ..}` (alias
/// `expected`) or the `[input, expected]` pairs produced by generated coding
/// challenges. Always serialised in the object form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCase {
    pub input: Value,
    pub expected_output: Value,
}

impl TestCase {
    pub fn new(input: Value, expected_output: Value) -> Self {
        Self {
            input,
            expected_output,
        }
    }
}

impl<'de> Deserialize<'de> for TestCase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Array(mut pair) if pair.len() == 2 => {
                let expected_output = pair.pop().unwrap_or_default();
                let input = pair.pop().unwrap_or_default();
                Ok(TestCase::new(input, expected_output))
            }
            Value::Object(mut fields) => {
                let input = fields
                    .remove("input")
                    .ok_or_else(|| <D::Error as de::Error>::missing_field("input"))?;
                let expected_output = fields
                    .remove("expected_output")
                    .or_else(|| fields.remove("expected"))
                    .ok_or_else(|| <D::Error as de::Error>::missing_field("expected_output"))?;
                Ok(TestCase::new(input, expected_output))
            }
            _ => Err(de::Error::custom(
                "test case must be {\"input\", \"expected_output\"} or an [input, expected] pair",
            )),
        }
    }
}

// Enum-shaped wire types below decode through `Value`: serde's buffering for
// tagged and untagged enums cannot carry `arbitrary_precision` numbers into
// typed integer fields.

/// Split an internally tagged object into its `kind` and the full value
fn tagged<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(String, Value), D::Error> {
    let value = Value::deserialize(deserializer)?;
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| <D::Error as de::Error>::missing_field("kind"))?;
    Ok((kind, value))
}

fn decode<T: de::DeserializeOwned, E: de::Error>(value: Value) -> Result<T, E> {
    serde_json::from_value(value).map_err(E::custom)
}

fn default_language() -> String {
    Language::Python.to_string()
}

fn default_true() -> bool {
    true
}

/// POST /evaluate-code payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default = "default_language")]
    pub language: String,
    pub code: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on_first_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl EvaluateRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>, test_cases: Vec<TestCase>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            test_cases,
            entry_point: None,
            stop_on_first_failure: None,
            timeout_ms: None,
        }
    }

    pub fn entry_point(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)
    }

    /// Structural checks that make a request malformed rather than wrong
    pub fn validate(&self) -> Result<(), String> {
        if self.code.trim().is_empty() || self.test_cases.is_empty() {
            return Err("Code and test cases are required".to_string());
        }
        check_source_size("code", &self.code)?;
        check_test_cases(&self.test_cases)?;
        check_entry_point(self.entry_point())
    }
}

/// POST /evaluate-debug-fix payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugFixRequest {
    #[serde(default = "default_language")]
    pub language: String,
    pub original_code: String,
    #[serde(alias = "user_fix")]
    pub code: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_entry_point: Option<String>,
    #[serde(default = "default_true")]
    pub explain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl DebugFixRequest {
    pub fn new(
        language: impl Into<String>,
        original_code: impl Into<String>,
        code: impl Into<String>,
        test_cases: Vec<TestCase>,
    ) -> Self {
        Self {
            language: language.into(),
            original_code: original_code.into(),
            code: code.into(),
            test_cases,
            entry_point: None,
            original_entry_point: None,
            explain: true,
            timeout_ms: None,
        }
    }

    pub fn entry_point(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.original_code.trim().is_empty()
            || self.code.trim().is_empty()
            || self.test_cases.is_empty()
        {
            return Err("Original code, user fix, and test cases are required".to_string());
        }
        check_source_size("original_code", &self.original_code)?;
        check_source_size("code", &self.code)?;
        check_test_cases(&self.test_cases)?;
        check_entry_point(self.entry_point())?;
        if let Some(name) = &self.original_entry_point {
            check_entry_point(name)?;
        }
        Ok(())
    }
}

fn check_source_size(field: &str, source: &str) -> Result<(), String> {
    if source.len() > MAX_SOURCE_CODE_BYTES {
        return Err(format!(
            "'{}' exceeds maximum size of {} bytes",
            field, MAX_SOURCE_CODE_BYTES
        ));
    }
    Ok(())
}

fn check_test_cases(test_cases: &[TestCase]) -> Result<(), String> {
    if test_cases.len() > MAX_TEST_CASES {
        return Err(format!(
            "Too many test cases: {} (maximum {})",
            test_cases.len(),
            MAX_TEST_CASES
        ));
    }
    for (idx, case) in test_cases.iter().enumerate() {
        let size = serde_json::to_vec(&case.input).map(|v| v.len()).unwrap_or(0);
        if size > MAX_TEST_INPUT_BYTES {
            return Err(format!(
                "Test case {} input exceeds maximum size of {} bytes",
                idx, MAX_TEST_INPUT_BYTES
            ));
        }
    }
    Ok(())
}

fn check_entry_point(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c == '_' || c.is_ascii_alphabetic())
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c == '_' || c.is_ascii_alphanumeric()) {
        return Err(format!("'{}' is not a valid entry point name", name));
    }
    Ok(())
}

/// A failing test case as reported to the candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FailedCase {
    Mismatch {
        index: usize,
        input: Value,
        expected: Value,
        actual: Value,
    },
    Errored {
        index: usize,
        input: Value,
        error: String,
    },
}

#[derive(Deserialize)]
struct MismatchFields {
    index: usize,
    input: Value,
    expected: Value,
    actual: Value,
}

#[derive(Deserialize)]
struct ErroredFields {
    index: usize,
    input: Value,
    error: String,
}

impl<'de> Deserialize<'de> for FailedCase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.get("error").is_some() {
            let fields: ErroredFields = decode::<_, D::Error>(value)?;
            Ok(FailedCase::Errored {
                index: fields.index,
                input: fields.input,
                error: fields.error,
            })
        } else {
            let fields: MismatchFields = decode::<_, D::Error>(value)?;
            Ok(FailedCase::Mismatch {
                index: fields.index,
                input: fields.input,
                expected: fields.expected,
                actual: fields.actual,
            })
        }
    }
}

impl FailedCase {
    pub fn index(&self) -> usize {
        match self {
            FailedCase::Mismatch { index, .. } | FailedCase::Errored { index, .. } => *index,
        }
    }
}

/// Coarse HTTP-style classification of an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    ClientError,
    ServerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Accepted,
    Rejected,
    ParseError,
    MissingEntryPoint,
    RuntimeFailure,
    Timeout,
    ResourceLimitExceeded,
    UnsupportedLanguage,
    InvalidRequest,
    JudgeError,
}

impl OutcomeKind {
    pub fn status_class(&self) -> StatusClass {
        match self {
            OutcomeKind::UnsupportedLanguage | OutcomeKind::InvalidRequest => StatusClass::ClientError,
            OutcomeKind::JudgeError => StatusClass::ServerError,
            _ => StatusClass::Success,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Accepted => "accepted",
            OutcomeKind::Rejected => "rejected",
            OutcomeKind::ParseError => "parse_error",
            OutcomeKind::MissingEntryPoint => "missing_entry_point",
            OutcomeKind::RuntimeFailure => "runtime_failure",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::ResourceLimitExceeded => "resource_limit_exceeded",
            OutcomeKind::UnsupportedLanguage => "unsupported_language",
            OutcomeKind::InvalidRequest => "invalid_request",
            OutcomeKind::JudgeError => "judge_error",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to a judge request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResponse {
    pub passed: bool,
    pub outcome: OutcomeKind,
    pub message: String,
    #[serde(default)]
    pub failed_cases: Vec<FailedCase>,
    #[serde(default)]
    pub total_cases: usize,
    #[serde(default)]
    pub passed_cases: usize,
    #[serde(default)]
    pub stopped_early: bool,
}

impl JudgeResponse {
    /// A response for a request that never reached execution
    pub fn without_cases(outcome: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            outcome,
            message: message.into(),
            failed_cases: Vec::new(),
            total_cases: 0,
            passed_cases: 0,
            stopped_early: false,
        }
    }
}

/// Response to a debug-fix request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugFixResponse {
    pub valid: bool,
    pub passed: bool,
    pub outcome: OutcomeKind,
    pub message: String,
    #[serde(default)]
    pub behavior_changed: bool,
    #[serde(default)]
    pub matches_expected: bool,
    #[serde(default)]
    pub failed_cases: Vec<FailedCase>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub reference_solution: Option<String>,
}

impl DebugFixResponse {
    pub fn invalid(outcome: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            passed: false,
            outcome,
            message: message.into(),
            behavior_changed: false,
            matches_expected: false,
            failed_cases: Vec::new(),
            explanation: None,
            reference_solution: None,
        }
    }
}

/// Work item for the batch grader
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Evaluate(EvaluateRequest),
    DebugFix(DebugFixRequest),
}

impl<'de> Deserialize<'de> for JobPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match tagged(deserializer)? {
            (kind, value) if kind == "evaluate" => decode(value).map(JobPayload::Evaluate),
            (kind, value) if kind == "debug_fix" => decode(value).map(JobPayload::DebugFix),
            (kind, _) => Err(de::Error::unknown_variant(&kind, &["evaluate", "debug_fix"])),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeJob {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub payload: JobPayload,
}

impl JudgeJob {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            JobPayload::Evaluate(_) => "evaluate",
            JobPayload::DebugFix(_) => "debug_fix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReport {
    Evaluate(JudgeResponse),
    DebugFix(DebugFixResponse),
}

impl<'de> Deserialize<'de> for JobReport {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match tagged(deserializer)? {
            (kind, value) if kind == "evaluate" => decode(value).map(JobReport::Evaluate),
            (kind, value) if kind == "debug_fix" => decode(value).map(JobReport::DebugFix),
            (kind, _) => Err(de::Error::unknown_variant(&kind, &["evaluate", "debug_fix"])),
        }
    }
}

impl JobReport {
    pub fn outcome(&self) -> OutcomeKind {
        match self {
            JobReport::Evaluate(response) => response.outcome,
            JobReport::DebugFix(response) => response.outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub completed_at: DateTime<Utc>,
    pub report: JobReport,
}

impl JobRecord {
    pub fn completed(job_id: Uuid, report: JobReport) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            completed_at: Utc::now(),
            report,
        }
    }
}
