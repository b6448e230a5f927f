//! Error types for taskmill-core

use std::fmt::Write;
use thiserror::Error;

use crate::failure_queue::FailureQueueError;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for taskmill-core
#[derive(Error, Debug)]
pub enum Error {
    /// Search backend errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Durable failure queue errors
    #[error("Failure queue error: {0}")]
    Queue(#[from] FailureQueueError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A backend administrative call kept failing after every retry
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    MaxRetries {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (join failures, closed pipeline, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Backend(err) => Some(err.remediation()),
            Self::Queue(err) => Some(queue_remediation(err)),
            Self::Config(err) => Some(err.remediation()),
            Self::MaxRetries { operation, .. } => Some(
                Remediation::new(format!(
                    "The backend rejected `{operation}` repeatedly. Check cluster health."
                ))
                .command("Cluster health", "curl -s \"$TASKMILL_BACKEND_URL/_cluster/health\"")
                .alternative("Raise backend.max_retries in taskmill.toml for slow clusters."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => None,
        }
    }
}

fn queue_remediation(err: &FailureQueueError) -> Remediation {
    match err {
        FailureQueueError::MaxInsertTries { .. } => Remediation::new(
            "The failure queue could not store a batch. Check free disk space.",
        )
        .command("Queue status", "tm queue status")
        .alternative("Disable persistence to drop undeliverable batches instead."),
        FailureQueueError::Unhealthy(_) | FailureQueueError::SchemaTooNew { .. } => {
            Remediation::new("The failure queue database is unusable.")
                .command("Reset queue", "tm queue reset")
                .alternative("Move the queue file aside and restart with an empty queue.")
        }
        _ => Remediation::new("Failure queue operation failed. Check the queue file.")
            .command("Queue status", "tm queue status"),
    }
}

/// Errors returned by a search backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Network level failure: connection refused, reset, timeout
    #[error("transport failure: {0}")]
    Transport(String),

    /// Backend answered with a non-success HTTP status
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Backend answered but the body could not be understood
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    /// Index, alias or scroll context does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) => false,
            Self::NotFound(_) => false,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Transport(_) => Remediation::new(
                "Backend is unreachable. Failed batches are kept in the failure queue.",
            )
            .command("Queue status", "tm queue status")
            .alternative("Verify backend.url in taskmill.toml."),
            Self::Status { status, .. } => {
                Remediation::new(format!("Backend rejected the request with status {status}."))
                    .command("Cluster health", "curl -s \"$TASKMILL_BACKEND_URL/_cluster/health\"")
            }
            Self::InvalidResponse(_) => {
                Remediation::new("Backend response did not match the expected format.")
                    .alternative("Check that backend.url points at a compatible search server.")
            }
            Self::NotFound(_) => Remediation::new("The requested index or alias does not exist.")
                .alternative("Run `tm bootstrap` to create the index template and write alias."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseError(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Check config", "tm config check")
                .alternative("Validate the config file format."),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .alternative("Recreate the config from known-good defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Check config", "tm config check")
                    .alternative("Review validation errors and adjust taskmill.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
