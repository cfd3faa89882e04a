//! Advisory explanations for debug-fix attempts.
//!
//! The advisor only ever adds an explanation and a reference solution next
//! to a verdict that has already been decided mechanically.
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use tribunal_common::config::AdvisorSettings;
use tribunal_common::types::TestCase;

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor request failed: {0}")]
    Unavailable(String),

    #[error("advisor returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("advisor response is malformed: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for AdvisorError {
    fn from(err: reqwest::Error) -> Self {
        AdvisorError::Unavailable(err.to_string())
    }
}

pub struct AdviceRequest<'a> {
    pub original_code: &'a str,
    pub fixed_code: &'a str,
    pub test_cases: &'a [TestCase],
    /// One-line summary of the mechanical verdict
    pub verdict: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "AdviceFields")]
pub struct Advice {
    pub explanation: Option<String>,
    pub reference_solution: Option<String>,
}

/// Models answer with `explanation`, `message`, or both
#[derive(Deserialize)]
struct AdviceFields {
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reference_solution: Option<String>,
}

impl From<AdviceFields> for Advice {
    fn from(fields: AdviceFields) -> Self {
        Self {
            explanation: fields.explanation.or(fields.message),
            reference_solution: fields.reference_solution,
        }
    }
}

#[async_trait]
pub trait Advisor: Send + Sync {
    async fn advise(&self, request: &AdviceRequest<'_>) -> Result<Advice, AdvisorError>;

    /// Upper bound the caller puts around `advise`
    fn timeout(&self) -> Duration;
}

const SYSTEM_PROMPT: &str = "You review bug fixes for coding exercises. \
The fix has already been executed against the test cases and the verdict is final. \
Explain in two or three sentences what the defect in the original code was and whether the fix addresses it. \
Respond with a single JSON object with keys \"explanation\" (string) and \"reference_solution\" (string, complete corrected code).";

/// OpenAI-compatible chat completion client (Groq by default)
pub struct ChatAdvisor {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl ChatAdvisor {
    pub fn from_settings(settings: &AdvisorSettings) -> Result<Self, AdvisorError> {
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            timeout: settings.timeout,
        })
    }

    fn prompt(request: &AdviceRequest<'_>) -> String {
        let cases: Vec<Value> = request
            .test_cases
            .iter()
            .map(|case| json!({ "input": case.input, "expected_output": case.expected_output }))
            .collect();

        format!(
            "Original (defective) code:\n{}\n\nCandidate's fix:\n{}\n\nTest cases: {}\n\nVerdict: {}",
            request.original_code,
            request.fixed_code,
            Value::Array(cases),
            request.verdict
        )
    }
}

#[async_trait]
impl Advisor for ChatAdvisor {
    async fn advise(&self, request: &AdviceRequest<'_>) -> Result<Advice, AdvisorError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": Self::prompt(request) },
            ],
            "response_format": { "type": "json_object" },
        });

        debug!(model = %self.model, "Requesting fix explanation");
        let resp = self.client.post(&url).bearer_auth(&self.api_key).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdvisorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = resp.json().await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AdvisorError::Malformed("missing choices[0].message.content".to_string()))?;

        serde_json::from_str(content.trim()).map_err(|e| AdvisorError::Malformed(e.to_string()))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn advisor(server: &MockServer) -> ChatAdvisor {
        ChatAdvisor::from_settings(&AdvisorSettings {
            api_key: "test-key".into(),
            api_base: format!("{}/v1/", server.uri()),
            model: "llama-3.3-70b-versatile".into(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    fn request(cases: &[TestCase]) -> AdviceRequest<'_> {
        AdviceRequest {
            original_code: "def add(a, b):\n    return a * b",
            fixed_code: "def add(a, b):\n    return a + b",
            test_cases: cases,
            verdict: "valid=true",
        }
    }

    fn completion(content: &str) -> Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    #[tokio::test]
    async fn test_parses_explanation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"explanation": "Multiplication instead of addition.", "reference_solution": "def add(a, b):\n    return a + b"}"#,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let cases = vec![TestCase::new(json!([2, 3]), json!(5))];
        let advice = advisor(&server).advise(&request(&cases)).await.unwrap();

        assert_eq!(advice.explanation.as_deref(), Some("Multiplication instead of addition."));
        assert!(advice.reference_solution.unwrap().contains("a + b"));
    }

    #[tokio::test]
    async fn test_accepts_message_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion(r#"{"valid": true, "message": "Looks right."}"#)),
            )
            .mount(&server)
            .await;

        let cases = vec![];
        let advice = advisor(&server).advise(&request(&cases)).await.unwrap();
        assert_eq!(advice.explanation.as_deref(), Some("Looks right."));
        assert_eq!(advice.reference_solution, None);
    }

    #[tokio::test]
    async fn test_explanation_wins_over_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"message": "Fix accepted.", "explanation": "The operator was wrong.", "reference_solution": null}"#,
            )))
            .mount(&server)
            .await;

        let cases = vec![];
        let advice = advisor(&server).advise(&request(&cases)).await.unwrap();
        assert_eq!(advice.explanation.as_deref(), Some("The operator was wrong."));
        assert_eq!(advice.reference_solution, None);
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let cases = vec![];
        let err = advisor(&server).advise(&request(&cases)).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Status { status: 429, .. }));
    }

    #[tokio::test]
    async fn test_non_json_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("sure, here you go")))
            .mount(&server)
            .await;

        let cases = vec![];
        let err = advisor(&server).advise(&request(&cases)).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Malformed(_)));
    }
}
