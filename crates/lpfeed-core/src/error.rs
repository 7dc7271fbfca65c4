//! Error types for lpfeed-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
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

/// Main error type for lpfeed-core
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any state was touched
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A mutation passed validation but could not be applied
    #[error("Storage operation failed: {0}")]
    Operation(String),

    /// Load/save and lifecycle errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (channel failures, join errors, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A transaction handler panicked while processing an item
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Shorthand for [`Error::Operation`].
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation(message.into())
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Validation(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Operation(_) => Some(
                Remediation::new("The store rejected a conflicting change; state was left as-is.")
                    .alternative("Inspect the store with `lpfeed status` before retrying."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Each input line must be one complete JSON value."),
            ),
            Self::Runtime(_) | Self::Panicked(_) => None,
        }
    }
}

/// Input validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be a non-empty string")]
    EmptyField { field: &'static str },

    #[error("{field} must not contain the key delimiter ':'")]
    ContainsDelimiter { field: &'static str },

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: String },

    #[error("invalid {kind} key format: {input:?}")]
    MalformedKey { kind: &'static str, input: String },

    #[error("invalid payload: {0}")]
    Payload(String),
}

impl ValidationError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::EmptyField { field } | Self::ContainsDelimiter { field } => {
                Remediation::new(format!("Provide a non-empty `{field}` without ':' characters."))
            }
            Self::NonPositive { field, .. } => {
                Remediation::new(format!("`{field}` must be greater than zero."))
            }
            Self::MalformedKey { kind, .. } => Remediation::new(format!(
                "The stored {kind} key could not be parsed; the store file may be damaged."
            ))
            .alternative("Restore the store file from a backup or delete it to start empty."),
            Self::Payload(_) => Remediation::new("Check the webhook payload shape and resend."),
        }
    }
}

/// Load, save and lifecycle failures of a storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {store} state: {details}")]
    Encode { store: &'static str, details: String },

    #[error("failed to decode {store} state: {details}")]
    Decode { store: &'static str, details: String },

    #[error("{store} schema version {found} is newer than supported ({supported})")]
    UnsupportedVersion {
        store: &'static str,
        found: u32,
        supported: u32,
    },

    #[error("save of {path} failed after {attempts} attempts: {last_error}")]
    SaveExhausted {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("{store} store is not initialized")]
    NotInitialized { store: &'static str },

    #[error("{store} store is closed")]
    Closed { store: &'static str },
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Io { path, .. } => Remediation::new(format!(
                "Check that {} is readable and its directory is writable.",
                path.display()
            )),
            Self::Encode { .. } => Remediation::new("Report this as a bug; in-memory state could not be encoded."),
            Self::Decode { .. } => Remediation::new(
                "The store file is damaged or from an unrelated program. It will load as empty.",
            )
            .alternative("Restore the store file from a backup."),
            Self::UnsupportedVersion { found, supported, .. } => Remediation::new(format!(
                "Store schema {found} was written by a newer lpfeed (this build supports {supported}). Upgrade lpfeed."
            )),
            Self::SaveExhausted { path, .. } => Remediation::new(format!(
                "Free disk space or fix permissions for {}; saves are retried on the next tick.",
                path.display()
            )),
            Self::NotInitialized { .. } => {
                Remediation::new("Call initialize() on the store before mutating it.")
            }
            Self::Closed { .. } => Remediation::new("The store was closed; open a new instance."),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Config file not found: {path}. Verify the path and retry."))
                    .alternative("Omit --config to run with built-in defaults.")
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check read permissions for {path}."))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax and retry."),
            Self::ValidationError(_) => {
                Remediation::new("Adjust the offending config value; all intervals and sizes must be positive.")
            }
        }
    }
}
