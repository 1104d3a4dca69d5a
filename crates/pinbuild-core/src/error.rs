//! Error types for pinbuild.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dependency manifest {} missing or malformed: {reason}", .path.display())]
    ManifestMissing { path: PathBuf, reason: String },

    #[error("revision {revision} not found for {component}: {message}")]
    RevisionNotFound {
        component: String,
        revision: String,
        message: String,
    },

    #[error("{component} build failed: {message}")]
    ComponentBuildFailed { component: String, message: String },

    #[error("cache write failed for {component}@{revision}: {message}")]
    CacheWrite {
        component: String,
        revision: String,
        message: String,
    },

    /// Raw failure of an external tool, kept verbatim for diagnostics.
    #[error("command `{command}` failed ({}){}", describe_exit(.exit_code), describe_diagnostic(.diagnostic))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pipeline error: {message}")]
    Pipeline {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an unexpected failure, keeping the original cause.
    pub fn pipeline(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Pipeline {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Short, stable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ManifestMissing { .. } => "manifest-missing",
            Error::RevisionNotFound { .. } => "revision-not-found",
            Error::ComponentBuildFailed { .. } => "component-build-failed",
            Error::CacheWrite { .. } => "cache-write",
            Error::CommandFailed { .. } => "command-failed",
            Error::InvalidInput(_) => "invalid-input",
            Error::Pipeline { .. } => "pipeline",
            Error::Io(_) => "io",
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

fn describe_diagnostic(diagnostic: &str) -> String {
    if diagnostic.is_empty() {
        String::new()
    } else {
        format!(": {}", diagnostic)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
