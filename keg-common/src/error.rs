use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KegError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    #[error("Git Error: {0}")]
    Git(#[from] Arc<git2::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Usage Error: {0}")]
    Usage(String),

    #[error("Unknown formula '{name}'{}{}", fmt_constraint(.constraint), fmt_required_by(.required_by))]
    UnknownFormula {
        name: String,
        constraint: Option<String>,
        /// Chain of formulae that led to the lookup, outermost first.
        required_by: Vec<String>,
    },

    #[error("Circular dependency detected: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Build of '{formula}' failed during {step}{}{}", fmt_exit_code(.exit_code), fmt_output_tail(.output_tail))]
    Build {
        formula: String,
        step: String,
        exit_code: Option<i32>,
        output_tail: String,
    },

    #[error("Internal error: dependency '{dependency}' of '{formula}' is not installed")]
    DependencyUnsatisfied { formula: String, dependency: String },

    #[error("Dependency Error: {0}")]
    DependencyError(String),

    #[error("Install state at {path} is corrupt: {reason}")]
    StateCorruption { path: PathBuf, reason: String },

    #[error("'{0}' is not installed")]
    NotInstalled(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("DownloadError: Failed to download '{0}' from '{1}': {2}")]
    DownloadError(String, String, String),

    #[error("Cache Error: {0}")]
    Cache(String),

    #[error("Installation Error: {0}")]
    InstallError(String),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Parsing Error in {0}: {1}")]
    ParseError(&'static str, String),

    #[error("Invalid build state transition for '{formula}': {from} -> {to}")]
    InvalidTransition {
        formula: String,
        from: String,
        to: String,
    },

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

fn fmt_constraint(constraint: &Option<String>) -> String {
    constraint
        .as_ref()
        .map(|c| format!(" matching '{c}'"))
        .unwrap_or_default()
}

fn fmt_required_by(chain: &[String]) -> String {
    if chain.is_empty() {
        String::new()
    } else {
        format!(" (required by {})", chain.join(" -> "))
    }
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    code.map(|c| format!(" (exit code {c})")).unwrap_or_default()
}

fn fmt_output_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(":\n{tail}")
    }
}

impl KegError {
    /// Process exit code for a failure surfaced to the command line.
    pub fn exit_code(&self) -> i32 {
        match self {
            KegError::Usage(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for KegError {
    fn from(err: std::io::Error) -> Self {
        KegError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KegError {
    fn from(err: reqwest::Error) -> Self {
        KegError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KegError {
    fn from(err: serde_json::Error) -> Self {
        KegError::Json(Arc::new(err))
    }
}

impl From<semver::Error> for KegError {
    fn from(err: semver::Error) -> Self {
        KegError::SemVer(Arc::new(err))
    }
}

impl From<git2::Error> for KegError {
    fn from(err: git2::Error) -> Self {
        KegError::Git(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KegError>;
