/// JudgeService
///
/// Facade shared by the HTTP API, the batch worker and the CLI. Each request
/// is judged on its own task; nothing mutable is shared between requests.
use crate::advisor::{Advisor, ChatAdvisor};
use crate::debug_fix::{self, FixAssessment, FixConfig};
use crate::error::JudgeError;
use crate::harness::{self, HarnessConfig, Submission, Verdict};
use crate::reporter::{report_fix, report_verdict};
use crate::sandbox::docker::DockerBackend;
use crate::sandbox::process::ProcessBackend;
use crate::sandbox::{PythonSandbox, ResourceLimits, Sandbox};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{info, instrument, warn, Instrument, Span};
use tribunal_common::config::{JudgeSettings, LanguageConfigManager, SandboxKind};
use tribunal_common::types::{
    DebugFixRequest, DebugFixResponse, EvaluateRequest, JobPayload, JobReport, JudgeJob, JudgeResponse, Language,
};

struct Inner {
    sandboxes: HashMap<Language, Arc<dyn Sandbox>>,
    advisor: Option<Arc<dyn Advisor>>,
    settings: JudgeSettings,
}

#[derive(Clone)]
pub struct JudgeService {
    inner: Arc<Inner>,
}

impl JudgeService {
    /// A service with no executable language; add them with `with_sandbox`
    pub fn new(settings: JudgeSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                sandboxes: HashMap::new(),
                advisor: None,
                settings,
            }),
        }
    }

    pub fn with_sandbox(mut self, language: Language, sandbox: Arc<dyn Sandbox>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.sandboxes.insert(language, sandbox);
        }
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.advisor = Some(advisor);
        }
        self
    }

    /// Wire up one sandbox per configured language with the selected backend
    pub fn from_settings(settings: JudgeSettings, languages: &LanguageConfigManager) -> Result<Self> {
        let advisor = match &settings.advisor {
            Some(advisor_settings) => Some(
                ChatAdvisor::from_settings(advisor_settings).context("Failed to build advisory client")?,
            ),
            None => None,
        };
        let sandbox_kind = settings.sandbox;
        let mut service = Self::new(settings);

        for config in languages.configs() {
            let language = match Language::parse(&config.name) {
                Some(Language::Python) => Language::Python,
                _ => {
                    warn!(language = %config.name, "No runner available for language, leaving it unsupported");
                    continue;
                }
            };
            let limits = ResourceLimits::from_config(config);
            let sandbox: Arc<dyn Sandbox> = match sandbox_kind {
                SandboxKind::Process => Arc::new(PythonSandbox::new(ProcessBackend::from_config(config), limits)),
                SandboxKind::Docker => {
                    let backend = DockerBackend::new(config).context("Failed to connect to Docker")?;
                    Arc::new(PythonSandbox::new(backend, limits))
                }
            };
            info!(language = %language, sandbox = ?sandbox_kind, image = %config.image, "Sandbox ready");
            service = service.with_sandbox(language, sandbox);
        }

        if let Some(advisor) = advisor {
            service = service.with_advisor(Arc::new(advisor));
        }
        Ok(service)
    }

    pub fn settings(&self) -> &JudgeSettings {
        &self.inner.settings
    }

    pub fn is_executable(&self, language: Language) -> bool {
        self.inner.sandboxes.contains_key(&language)
    }

    fn sandbox_for(&self, language: &str) -> Result<Arc<dyn Sandbox>, JudgeError> {
        Language::parse(language)
            .and_then(|parsed| self.inner.sandboxes.get(&parsed))
            .cloned()
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Judge a submission. `default_stop` applies when the request leaves
    /// `stop_on_first_failure` unset.
    #[instrument(skip_all, fields(language = %request.language, cases = request.test_cases.len()))]
    pub async fn evaluate(&self, request: EvaluateRequest, default_stop: bool) -> JudgeResponse {
        let service = self.clone();
        report_verdict(isolated(async move { service.judge(request, default_stop).await }).await)
    }

    #[instrument(skip_all, fields(language = %request.language, cases = request.test_cases.len()))]
    pub async fn evaluate_fix(&self, request: DebugFixRequest) -> DebugFixResponse {
        let service = self.clone();
        report_fix(isolated(async move { service.assess_fix(request).await }).await)
    }

    /// Batch jobs always get full diagnostics
    pub async fn run_job(&self, job: JudgeJob) -> JobReport {
        match job.payload {
            JobPayload::Evaluate(request) => JobReport::Evaluate(self.evaluate(request, false).await),
            JobPayload::DebugFix(request) => JobReport::DebugFix(self.evaluate_fix(request).await),
        }
    }

    async fn judge(&self, request: EvaluateRequest, default_stop: bool) -> Result<Verdict, JudgeError> {
        request.validate().map_err(JudgeError::InvalidRequest)?;
        let sandbox = self.sandbox_for(&request.language)?;

        let config = HarnessConfig {
            stop_on_first_failure: request.stop_on_first_failure.unwrap_or(default_stop),
            case_timeout: self.inner.settings.case_timeout(request.timeout_ms),
            max_parallel_cases: self.inner.settings.max_parallel_cases,
        };
        let submission = Submission::new(request.code.as_str(), request.entry_point());

        harness::run_tests(sandbox.as_ref(), &submission, &request.test_cases, &config).await
    }

    async fn assess_fix(&self, request: DebugFixRequest) -> Result<FixAssessment, JudgeError> {
        request.validate().map_err(JudgeError::InvalidRequest)?;
        let sandbox = self.sandbox_for(&request.language)?;

        let config = FixConfig {
            case_timeout: self.inner.settings.case_timeout(request.timeout_ms),
            max_parallel_cases: self.inner.settings.max_parallel_cases,
        };
        let fix = Submission::new(request.code.as_str(), request.entry_point());

        let assessment = debug_fix::validate_fix(
            sandbox.as_ref(),
            &request.original_code,
            &fix,
            request.original_entry_point.as_deref(),
            &request.test_cases,
            &config,
        )
        .await?;

        match (&self.inner.advisor, request.explain) {
            (Some(advisor), true) => Ok(debug_fix::attach_advice(
                assessment,
                advisor.as_ref(),
                &request.original_code,
                &fix,
                &request.test_cases,
            )
            .await),
            _ => Ok(assessment),
        }
    }
}

/// Run on a separate task so a panic in judging becomes an internal fault
async fn isolated<T, F>(work: F) -> Result<T, JudgeError>
where
    F: Future<Output = Result<T, JudgeError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work.instrument(Span::current()))
        .await
        .unwrap_or_else(|e: JoinError| Err(JudgeError::Internal(format!("judging task failed: {}", e))))
}
