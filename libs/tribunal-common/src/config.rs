// Runtime configuration shared by the API, worker and CLI
use crate::types::Language;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub interpreter: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default = "default_max_processes")]
    pub max_processes: i64,
}

fn default_max_processes() -> i64 {
    16
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Executable languages, keyed by canonical name
#[derive(Debug, Clone, Default)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json_str(&content)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(Path::new(DEFAULT_LANGUAGES_PATH))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            let canonical = Language::parse(&lang.name)
                .with_context(|| format!("Unknown language in languages.json: {}", lang.name))?;
            if lang.memory_limit_mb == 0 {
                bail!("memory_limit_mb for {} must be positive", lang.name);
            }
            configs.insert(canonical.to_string(), lang);
        }

        Ok(Self { configs })
    }

    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language.as_str())
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    pub fn get_image(&self, language: &Language) -> Result<String> {
        Ok(self.get_config(language)?.image.clone())
    }

    pub fn is_executable(&self, language: &Language) -> bool {
        self.configs.contains_key(language.as_str())
    }

    /// Sorted so output is stable across runs
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn configs(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.configs.values()
    }
}

/// Where untrusted code runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    /// Local interpreter under rlimits
    Process,
    /// One container per run
    Docker,
}

impl FromStr for SandboxKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "process" => Ok(SandboxKind::Process),
            "docker" => Ok(SandboxKind::Docker),
            other => bail!("Unknown sandbox kind '{}' (expected 'process' or 'docker')", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdvisorSettings {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JudgeSettings {
    pub sandbox: SandboxKind,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_parallel_cases: usize,
    pub languages_path: PathBuf,
    pub redis_url: String,
    pub bind_addr: String,
    /// `None` disables the advisory step
    pub advisor: Option<AdvisorSettings>,
}

impl JudgeSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (environment in production, a map in tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sandbox = match lookup("JUDGE_SANDBOX") {
            Some(value) => value.parse()?,
            None => SandboxKind::Process,
        };

        let default_timeout_ms = parse_or(&lookup, "JUDGE_TIMEOUT_MS", 5000u64)?;
        let max_timeout_ms = parse_or(&lookup, "JUDGE_MAX_TIMEOUT_MS", 30_000u64)?;
        if default_timeout_ms == 0 || max_timeout_ms == 0 {
            bail!("Judge timeouts must be positive");
        }
        let max_parallel_cases = parse_or(&lookup, "JUDGE_MAX_PARALLEL_CASES", 4usize)?.max(1);

        let advisor = match lookup("ADVISOR_API_KEY").or_else(|| lookup("GROQ_API_KEY")) {
            Some(api_key) if !api_key.trim().is_empty() => Some(AdvisorSettings {
                api_key,
                api_base: lookup("ADVISOR_API_BASE")
                    .unwrap_or_else(|| "https://api.groq.com/openai/v1".to_string()),
                model: lookup("ADVISOR_MODEL").unwrap_or_else(|| "llama-3.3-70b-versatile".to_string()),
                timeout: Duration::from_millis(parse_or(&lookup, "ADVISOR_TIMEOUT_MS", 15_000u64)?),
            }),
            _ => None,
        };

        Ok(Self {
            sandbox,
            default_timeout: Duration::from_millis(default_timeout_ms),
            max_timeout: Duration::from_millis(max_timeout_ms.max(default_timeout_ms)),
            max_parallel_cases,
            languages_path: lookup("JUDGE_LANGUAGES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LANGUAGES_PATH)),
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            bind_addr: lookup("JUDGE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            advisor,
        })
    }

    /// Per-case deadline for a request, clamped to the configured ceiling
    pub fn case_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_timeout),
            _ => self.default_timeout,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}
