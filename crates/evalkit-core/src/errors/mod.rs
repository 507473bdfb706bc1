//! Error types shared across the engine.

use std::path::PathBuf;
use std::time::Duration;

/// Failures talking to an inference or judge endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (status 429): {body}")]
    RateLimited { body: String },

    #[error("server error (status {status}): {body}")]
    Server { status: u16, body: String },

    #[error("request rejected (status {status}): {body}")]
    Client { status: u16, body: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("media unavailable: {0}")]
    Media(String),
}

impl ProviderError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::Server { .. }
                | Self::Network { .. }
                | Self::InvalidResponse { .. }
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(Duration::ZERO);
        }
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result of a retried operation that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Fatal(E),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JudgeError {
    /// Every attempt failed; the verdict is unknown.
    #[error("judge unavailable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("judge request rejected: {0}")]
    Rejected(String),
}

/// Problems with a question item detected before any model call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("failed to read questions from {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("item {index} has no question_id")]
    MissingId { index: usize },

    #[error("question {id} is {kind} but has no usable options")]
    MissingOptions { id: String, kind: String },

    #[error("question {id} is {kind} but round {round} has no usable options")]
    MissingRoundOptions {
        id: String,
        kind: String,
        round: String,
    },

    #[error("question {id} references missing media: {sample}")]
    MissingMedia { id: String, sample: String },

    #[error("question {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(
        "refusing to rewrite {path}: replacement has {replacement} records, {on_disk} already on disk"
    )]
    ShrinkGuard {
        path: PathBuf,
        replacement: usize,
        on_disk: usize,
    },

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode artifact: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported config version {found} (supported: {supported})")]
    Version { found: u32, supported: u32 },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One entry of the run-level failure summary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TaskFailure {
    pub question_id: String,
    pub model: String,
    pub persona: String,
    pub reason: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "question_id: {} | {}/{} | reason: {}",
            self.question_id, self.model, self.persona, self.reason
        )
    }
}
