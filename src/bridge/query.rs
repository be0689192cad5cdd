//! Backend query client.
//!
//! [`QueryClient`] turns a question into a short answer string. It owns the
//! prompt wording, the per-attempt timeout and the retry loop; the actual
//! request goes through a [`Backend`], normally an [`OllamaBackend`] speaking the
//! `/api/generate` JSON protocol of a local Ollama server.
//!
//! `ask` never fails: every error path ends in a short `AI Error: ...` string
//! so the router always has something to send back. Errors that cannot get
//! better by retrying (unknown model, rejected request) skip the retry budget.
use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::types::{AttemptOutcome, QueryAttempt, RetryPolicy};
use crate::config::OllamaConfig;
use crate::logutil::preview;

/// Directive prepended to every question. The encoder enforces the real limit.
pub const CONCISE_DIRECTIVE: &str = "Answer concisely in under 120 chars:";

/// Answer substituted when the backend returns only whitespace.
pub const EMPTY_ANSWER: &str = "No response.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("cannot connect to backend: {0}")]
    Connect(String),

    #[error("backend timed out")]
    Timeout,

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("backend rejected request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("backend returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BackendError::ModelNotFound(_) | BackendError::Rejected { .. }
        )
    }
}

/// A text-generation service.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;

    fn model(&self) -> &str;

    fn endpoint(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Reachability of the backend server, as shown by `meshai check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Ready,
    CannotConnect,
    TimedOut,
    Error(String),
}

/// Ollama `/api/generate` client (non-streaming).
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f64,
}

impl OllamaBackend {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
            temperature,
        })
    }

    pub fn from_config(cfg: &OllamaConfig) -> anyhow::Result<Self> {
        Self::new(
            cfg.url.clone(),
            cfg.model.clone(),
            cfg.temperature,
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    /// Server root: the generate URL with its `/api/...` suffix removed.
    pub fn base_url(&self) -> &str {
        match self.url.rsplit_once("/api/") {
            Some((base, _)) => base,
            None => &self.url,
        }
    }

    /// Quick reachability check against the server root.
    pub async fn check(&self) -> BackendStatus {
        let request = self.client.get(self.base_url()).timeout(Duration::from_secs(5));
        match request.send().await {
            Ok(_) => BackendStatus::Ready,
            Err(e) if e.is_timeout() => BackendStatus::TimedOut,
            Err(e) if e.is_connect() => BackendStatus::CannotConnect,
            Err(e) => BackendStatus::Error(e.to_string()),
        }
    }
}

/// Ollama reports failures as `{"error": "..."}`; anything else is passed through.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn classify_request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Connect(e.to_string())
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };
        debug!("POST {} model={}", self.url, self.model);

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = preview(&error_detail(&body), 120);
            return Err(match status.as_u16() {
                404 => BackendError::ModelNotFound(self.model.clone()),
                408 | 429 => BackendError::Http {
                    status: status.as_u16(),
                    detail,
                },
                code @ 400..=499 => BackendError::Rejected {
                    status: code,
                    detail,
                },
                code => BackendError::Http {
                    status: code,
                    detail,
                },
            });
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::InvalidResponse(e.to_string())
            }
        })?;
        Ok(parsed.response)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Outcome of one `ask`, with the attempt log.
#[derive(Debug, Clone)]
pub struct QueryReport {
    pub answer: String,
    pub attempts: Vec<QueryAttempt>,
    /// Final error when the answer is a diagnostic.
    pub error: Option<BackendError>,
}

impl QueryReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct QueryClient {
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    timeout: Duration,
    include_datetime: bool,
}

impl QueryClient {
    pub fn new(backend: Arc<dyn Backend>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            timeout,
            include_datetime: false,
        }
    }

    /// Prefix prompts with the local date and time.
    pub fn with_datetime_context(mut self, enabled: bool) -> Self {
        self.include_datetime = enabled;
        self
    }

    pub fn from_config(cfg: &OllamaConfig) -> anyhow::Result<Self> {
        let backend = OllamaBackend::from_config(cfg)?;
        let policy = RetryPolicy::new(cfg.retries, Duration::from_secs(cfg.retry_delay_secs));
        Ok(Self::new(Arc::new(backend), policy, Duration::from_secs(cfg.timeout_secs))
            .with_datetime_context(cfg.include_datetime))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Answer `question`. Always returns a non-empty string.
    pub async fn ask(&self, question: &str) -> String {
        self.ask_detailed(question).await.answer
    }

    pub async fn ask_detailed(&self, question: &str) -> QueryReport {
        let now = self
            .include_datetime
            .then(|| chrono::Local::now().naive_local());
        let prompt = build_prompt(question, now);
        let mut attempts = Vec::new();
        let mut last_error = BackendError::Connect("no attempt made".to_string());

        for attempt_number in 1..=self.policy.max_attempts {
            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, self.backend.generate(&prompt)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(text) => {
                    let trimmed = text.trim();
                    let answer = if trimmed.is_empty() {
                        EMPTY_ANSWER.to_string()
                    } else {
                        trimmed.to_string()
                    };
                    debug!(
                        "backend answered in {}ms (attempt {}): {}",
                        elapsed.as_millis(),
                        attempt_number,
                        preview(&answer, 80)
                    );
                    attempts.push(QueryAttempt {
                        prompt,
                        attempt_number,
                        outcome: AttemptOutcome::Success(answer.clone()),
                        elapsed,
                    });
                    return QueryReport {
                        answer,
                        attempts,
                        error: None,
                    };
                }
                Err(e) if !e.is_retryable() => {
                    warn!("backend error (not retried): {}", e);
                    attempts.push(QueryAttempt {
                        prompt,
                        attempt_number,
                        outcome: AttemptOutcome::Terminal(e.to_string()),
                        elapsed,
                    });
                    return QueryReport {
                        answer: self.diagnostic(&e),
                        attempts,
                        error: Some(e),
                    };
                }
                Err(e) => {
                    attempts.push(QueryAttempt {
                        prompt: prompt.clone(),
                        attempt_number,
                        outcome: AttemptOutcome::Retryable(e.to_string()),
                        elapsed,
                    });
                    if self.policy.allows_retry(attempt_number) {
                        warn!(
                            "backend attempt {}/{} failed: {}. Retrying in {}s...",
                            attempt_number,
                            self.policy.max_attempts,
                            e,
                            self.policy.delay_between_attempts.as_secs_f32()
                        );
                        tokio::time::sleep(self.policy.delay_between_attempts).await;
                    } else {
                        warn!(
                            "backend attempt {}/{} failed: {}. Giving up.",
                            attempt_number, self.policy.max_attempts, e
                        );
                    }
                    last_error = e;
                }
            }
        }

        QueryReport {
            answer: self.diagnostic(&last_error),
            attempts,
            error: Some(last_error),
        }
    }

    /// Short operator-facing text for an error class. No internal detail.
    pub fn diagnostic(&self, err: &BackendError) -> String {
        match err {
            BackendError::Connect(_) => format!(
                "AI Error: Cannot connect to backend. Is it running? ({})",
                self.backend.endpoint()
            ),
            BackendError::Timeout => {
                "AI Error: Backend took too long to respond. Try again.".to_string()
            }
            BackendError::ModelNotFound(model) => {
                format!("AI Error: Model '{}' not found. Check config.", model)
            }
            BackendError::Rejected { status, .. } => {
                format!("AI Error: Backend rejected request ({}).", status)
            }
            BackendError::Http { status, .. } => {
                format!("AI Error: Backend returned HTTP {}.", status)
            }
            BackendError::InvalidResponse(_) => {
                "AI Error: Backend sent an unreadable response.".to_string()
            }
        }
    }
}

/// Prompt text for a question, optionally prefixed with a date/time context line.
pub fn build_prompt(question: &str, now: Option<NaiveDateTime>) -> String {
    match now {
        Some(ts) => format!(
            "Date and time: {}, {}. {} {}",
            ts.format("%A"),
            ts.format("%Y-%m-%d %H:%M:%S"),
            CONCISE_DIRECTIVE,
            question
        ),
        None => format!("{} {}", CONCISE_DIRECTIVE, question),
    }
}
