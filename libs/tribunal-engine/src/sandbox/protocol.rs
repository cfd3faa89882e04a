/// Wire protocol between the judge and the embedded runner script.
///
/// The runner reads one JSON envelope on stdin and answers with exactly one
/// report line on its original stdout, prefixed with the per-run nonce so
/// nothing the submission manages to write can be mistaken for the report.
use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

pub const RUNNER_SCRIPT: &str = include_str!("runner.py");

const SIGSEGV: i32 = 11;
const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// Bytes of runner stdout kept by a backend; the report is always the last line
pub const STDOUT_CAP: usize = 4 * 1024 * 1024;
/// Bytes of runner stderr kept; only the tail feeds crash messages
pub const STDERR_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Compile only
    Syntax,
    /// Compile, execute, resolve the entry point
    Probe,
    /// Everything `Probe` does, then call the entry point
    Call,
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub mode: RunMode,
    pub source: String,
    pub entry_point: String,
    pub args: Vec<Value>,
    pub nonce: String,
}

impl Envelope {
    pub fn new(mode: RunMode, source: &str, entry_point: &str, args: Vec<Value>) -> Self {
        Self {
            mode,
            source: source.to_string(),
            entry_point: entry_point.to_string(),
            args,
            nonce: format!("@@{}@@", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SandboxError> {
        serde_json::to_vec(self).map_err(|e| SandboxError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Ok,
    ParseError,
    LoadError,
    DefinitionMissing,
    RuntimeError,
    ResourceLimit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerReport {
    pub status: ReportStatus,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub stdout: String,
}

/// How the runner process ended, as observed by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i64),
    Signaled(i32),
    /// The wall-clock deadline elapsed and the process was killed
    DeadlineElapsed,
}

#[derive(Debug, Clone)]
pub struct RunnerExit {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitKind,
    /// Earlier stdout bytes were discarded to stay under `STDOUT_CAP`
    pub stdout_truncated: bool,
}

impl RunnerExit {
    pub fn from_streams(stdout: TailBuffer, stderr: TailBuffer, exit: ExitKind) -> Self {
        Self {
            stdout_truncated: stdout.truncated(),
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit,
        }
    }

    pub fn deadline_elapsed() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit: ExitKind::DeadlineElapsed,
            stdout_truncated: false,
        }
    }
}

/// Keeps the last `cap` bytes written to it and counts what it dropped
#[derive(Debug)]
pub struct TailBuffer {
    bytes: VecDeque<u8>,
    cap: usize,
    dropped: u64,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            cap,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            self.dropped += (self.bytes.len() + chunk.len() - self.cap) as u64;
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.cap..]);
            return;
        }
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.cap);
        self.bytes.drain(..overflow);
        self.dropped += overflow as u64;
        self.bytes.extend(chunk);
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn into_string(self) -> String {
        let bytes: Vec<u8> = self.bytes.into();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// A runner exit interpreted against the protocol
#[derive(Debug, Clone)]
pub enum RunnerResult {
    Report(RunnerReport),
    Timeout,
    ResourceLimit(String),
    Crashed(String),
}

/// Find the report line carrying `nonce`, if any
pub fn parse_report(stdout: &str, nonce: &str) -> Result<Option<RunnerReport>, SandboxError> {
    // Raw writes to the report fd may leave the report mid-line
    let payload = stdout
        .rfind(nonce)
        .map(|at| stdout[at + nonce.len()..].lines().next().unwrap_or_default());
    match payload {
        Some(payload) => serde_json::from_str(payload)
            .map(Some)
            .map_err(|e| SandboxError::Protocol(e.to_string())),
        None => Ok(None),
    }
}

pub fn classify(exit: &RunnerExit, nonce: &str) -> Result<RunnerResult, SandboxError> {
    if exit.exit == ExitKind::DeadlineElapsed {
        return Ok(RunnerResult::Timeout);
    }
    if let Some(report) = parse_report(&exit.stdout, nonce)? {
        return Ok(RunnerResult::Report(report));
    }

    // Shells and container runtimes report signals as 128 + signo
    let signal = match exit.exit {
        ExitKind::Signaled(sig) => Some(sig),
        ExitKind::Exited(code) if code > 128 && code < 160 => Some((code - 128) as i32),
        _ => None,
    };

    Ok(match signal {
        Some(SIGXCPU) => RunnerResult::Timeout,
        Some(SIGKILL) => RunnerResult::ResourceLimit("process killed: memory limit exceeded".to_string()),
        Some(SIGSEGV) => RunnerResult::Crashed("segmentation fault".to_string()),
        Some(sig) => RunnerResult::Crashed(format!("process terminated by signal {}", sig)),
        None if exit.stdout_truncated => RunnerResult::ResourceLimit("output limit exceeded".to_string()),
        None => RunnerResult::Crashed(crash_message(&exit.stderr)),
    })
}

fn crash_message(stderr: &str) -> String {
    let tail: Vec<&str> = stderr
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(3)
        .collect();
    if tail.is_empty() {
        return "process exited without producing a result".to_string();
    }
    let mut message = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
    if message.len() > 2000 {
        let mut cut = message.len() - 2000;
        while !message.is_char_boundary(cut) {
            cut += 1;
        }
        message = message.split_off(cut);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exited(stdout: &str, stderr: &str, code: i64) -> RunnerExit {
        RunnerExit {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit: ExitKind::Exited(code),
            stdout_truncated: false,
        }
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope::new(RunMode::Call, "def solution(a): return a", "solution", vec![json!(1)]);
        let encoded: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(encoded["mode"], json!("call"));
        assert_eq!(encoded["args"], json!([1]));
        assert!(envelope.nonce.starts_with("@@"));
        assert_ne!(envelope.nonce, Envelope::new(RunMode::Call, "", "", vec![]).nonce);
    }

    #[test]
    fn test_report_needs_nonce() {
        let stdout = "{\"status\": \"ok\", \"value\": 99}\n@@n@@{\"status\": \"ok\", \"value\": 5, \"stdout\": \"hi\\n\"}\n";
        let report = parse_report(stdout, "@@n@@").unwrap().unwrap();

        assert_eq!(report.status, ReportStatus::Ok);
        assert_eq!(report.value, json!(5));
        assert_eq!(report.stdout, "hi\n");
        assert!(parse_report("{\"status\": \"ok\"}", "@@n@@").unwrap().is_none());
    }

    #[test]
    fn test_garbled_report_is_protocol_error() {
        let err = parse_report("@@n@@{not json", "@@n@@").unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
    }

    #[test]
    fn test_report_wins_over_exit_code() {
        let exit = exited("@@n@@{\"status\": \"runtime_error\", \"message\": \"ZeroDivisionError\"}", "", 0);
        match classify(&exit, "@@n@@").unwrap() {
            RunnerResult::Report(report) => assert_eq!(report.status, ReportStatus::RuntimeError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_signal_classification() {
        let cpu = RunnerExit {
            exit: ExitKind::Signaled(SIGXCPU),
            ..exited("", "", 0)
        };
        assert!(matches!(classify(&cpu, "@@n@@").unwrap(), RunnerResult::Timeout));
        assert!(matches!(classify(&exited("", "", 152), "@@n@@").unwrap(), RunnerResult::Timeout));
        assert!(matches!(
            classify(&exited("", "", 137), "@@n@@").unwrap(),
            RunnerResult::ResourceLimit(_)
        ));
        match classify(&exited("", "", 139), "@@n@@").unwrap() {
            RunnerResult::Crashed(message) => assert_eq!(message, "segmentation fault"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deadline_is_timeout() {
        let exit = RunnerExit {
            exit: ExitKind::DeadlineElapsed,
            ..exited("@@n@@{\"status\": \"ok\"}", "", 0)
        };
        assert!(matches!(classify(&exit, "@@n@@").unwrap(), RunnerResult::Timeout));
    }

    #[test]
    fn test_report_found_after_raw_output() {
        let stdout = format!("{}@@n@@{{\"status\": \"ok\", \"value\": 7}}\n", "x".repeat(100));
        let report = parse_report(&stdout, "@@n@@").unwrap().unwrap();
        assert_eq!(report.value, json!(7));
    }

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut tail = TailBuffer::new(8);
        tail.push(b"abc");
        assert!(!tail.truncated());
        tail.push(b"defghij");
        assert!(tail.truncated());
        tail.push(&[b'z'; 20]);
        tail.push(b"\nend");
        assert_eq!(tail.into_string(), "zzzz\nend");
    }

    #[test]
    fn test_lost_report_after_flood_is_resource_limit() {
        let exit = RunnerExit {
            stdout_truncated: true,
            ..exited("xxxx", "", 0)
        };
        match classify(&exit, "@@n@@").unwrap() {
            RunnerResult::ResourceLimit(message) => assert_eq!(message, "output limit exceeded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_crash_uses_stderr_tail() {
        let exit = exited("", "Traceback\n  a\n  b\nFatal Python error: boom\n\n", 1);
        match classify(&exit, "@@n@@").unwrap() {
            RunnerResult::Crashed(message) => {
                assert!(message.ends_with("Fatal Python error: boom"));
                assert!(!message.contains("Traceback"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match classify(&exited("", "", 0), "@@n@@").unwrap() {
            RunnerResult::Crashed(message) => assert!(message.contains("without producing")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
