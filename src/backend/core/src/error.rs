//! Structured errors for the queue.
//!
//! Every fallible operation returns [`FloodgateError`]: a stable
//! [`ErrorCode`], a message safe to show callers, an optional internal
//! message for logs, and structured details. Codes carry a category,
//! a severity and a retryability flag so the dispatcher and workers can
//! decide what to do without string matching.
//!
//! ```rust,ignore
//! match queue.complete(id).await {
//!     Err(e) if e.code() == ErrorCode::InvalidStateTransition => { /* already settled */ }
//!     Err(e) if e.is_retryable() => { /* store hiccup, try later */ }
//!     other => other?,
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::jobs::{JobId, JobState};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, FloodgateError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable, machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job lifecycle (1000-1099)
    JobNotFound,
    InvalidStateTransition,

    // Admission (1100-1199)
    TransactionConflict,
    AdmissionRetriesExhausted,

    // Storage (2000-2099)
    StorageError,
    StorageUnavailable,
    StorageTimeout,
    ScriptError,
    CorruptRecord,

    // Payload encoding (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::InvalidStateTransition => 1001,

            Self::TransactionConflict => 1100,
            Self::AdmissionRetriesExhausted => 1101,

            Self::StorageError => 2000,
            Self::StorageUnavailable => 2001,
            Self::StorageTimeout => 2002,
            Self::ScriptError => 2003,
            Self::CorruptRecord => 2004,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Transient failures: nothing was mutated and the call may be repeated.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionConflict
                | Self::StorageUnavailable
                | Self::StorageTimeout
                | Self::StorageError
        )
    }

    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "admission",
            2000..=2099 => "storage",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// How loudly an error is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes such as settling an unknown job
    Low,
    /// Contention and slow storage
    Medium,
    /// Broken records, scripts or configuration
    High,
    /// The store is unreachable
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::TransactionConflict | ErrorCode::StorageTimeout => Self::Medium,

            ErrorCode::AdmissionRetriesExhausted
            | ErrorCode::StorageError
            | ErrorCode::ScriptError
            | ErrorCode::CorruptRecord
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StorageUnavailable | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured context attached to an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Id of the job the error concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// FloodgateError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct FloodgateError {
    code: ErrorCode,
    user_message: Cow<'static, str>,
    /// Logged, never shown to callers
    internal_message: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for FloodgateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " ({})", internal)?;
        }
        Ok(())
    }
}

impl FloodgateError {
    /// Create an error and count it in `floodgate_errors_total`.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        counter!(
            "floodgate_errors_total",
            "code" => code.to_string(),
            "category" => code.category(),
            "retryable" => code.is_retryable().to_string(),
        )
        .increment(1);
        error
    }

    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_job(mut self, id: JobId) -> Self {
        self.details.job_id = Some(id);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Any of the configuration codes.
    pub fn is_configuration(&self) -> bool {
        self.code.category() == "configuration"
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Log at a level matching the severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let job_id = self.details.job_id.map(|id| id.0);

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                error_code = %code,
                category = self.code.category(),
                job_id = ?job_id,
                internal_message = ?self.internal_message,
                source = ?self.source,
                "{}",
                self.user_message
            ),
            ErrorSeverity::Medium => warn!(
                error_code = %code,
                job_id = ?job_id,
                "{}",
                self.user_message
            ),
            ErrorSeverity::Low => debug!(
                error_code = %code,
                job_id = ?job_id,
                "{}",
                self.user_message
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for FloodgateError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_io_error()
        {
            (ErrorCode::StorageUnavailable, "Unable to reach the job store")
        } else if error.is_timeout() {
            (ErrorCode::StorageTimeout, "Job store operation timed out")
        } else if matches!(
            error.kind(),
            redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
        ) || error.code() == Some("BUSY")
        {
            (ErrorCode::TransactionConflict, "Job store transaction conflicted")
        } else if matches!(
            error.kind(),
            redis::ErrorKind::NoScriptError | redis::ErrorKind::ResponseError
        ) {
            (ErrorCode::ScriptError, "Job store script failed")
        } else {
            (ErrorCode::StorageError, "Job store error")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for FloodgateError {
    fn from(error: serde_json::Error) -> Self {
        let code = match error.classify() {
            serde_json::error::Category::Io => ErrorCode::SerializationError,
            _ => ErrorCode::DeserializationError,
        };
        Self::with_internal(code, "Invalid job payload encoding", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for FloodgateError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<FloodgateError>() {
            Ok(inner) => inner,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                format!("{:#}", error),
            ),
        }
    }
}

impl From<config::ConfigError> for FloodgateError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration could not be loaded"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl FloodgateError {
    pub fn job_not_found(id: JobId) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id)).with_job(id)
    }

    /// A move was requested from a container the job is not in.
    pub fn invalid_state_transition(id: JobId, from: JobState, to: JobState) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition for {}: {} -> {}", id, from, to),
        )
        .with_job(id)
        .with_context("from_state", from.as_str())
        .with_context("to_state", to.as_str())
    }

    /// A required rate limiter field is unset.
    pub fn missing_configuration(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingConfiguration,
            format!("Rate limiter requires `{}` to be set", field),
        )
        .with_context("field", field)
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    pub fn transaction_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransactionConflict, message.into())
    }

    /// A stored job hash could not be decoded.
    pub fn corrupt_record(id: JobId, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::CorruptRecord,
            format!("Stored record for job {} is malformed", id),
            reason.into(),
        )
        .with_job(id)
    }
}
