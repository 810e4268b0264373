//! Error handling for redqueue.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! [`QuError`] carries:
//! - a machine-readable [`ErrorCode`] grouped into categories
//! - a human-readable message and an optional source error
//! - a severity used when logging and a retryability hint
//!
//! # Usage
//!
//! ```rust,ignore
//! use redqueue::error::{QuError, Result, ErrorCode};
//!
//! fn lookup(key: &str) -> Result<()> {
//!     Err(QuError::queue_not_found(key))
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for redqueue operations.
pub type Result<T> = std::result::Result<T, QuError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Setup races (1000-1099)
    GroupAlreadyExists,

    // Delivery (1100-1199)
    HandlerFailed,
    DeadLetterFailed,

    // Store / infrastructure (2000-2099)
    StoreError,
    StoreConnectionFailed,
    ScriptError,
    UnexpectedResponse,

    // Serialization (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration / usage (5000-5099)
    QueueNotFound,
    ConsumersAlreadySetup,
    AlreadyListening,
    InvalidCrontab,
    InvalidConfiguration,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::GroupAlreadyExists => 1000,

            Self::HandlerFailed => 1100,
            Self::DeadLetterFailed => 1101,

            Self::StoreError => 2000,
            Self::StoreConnectionFailed => 2001,
            Self::ScriptError => 2002,
            Self::UnexpectedResponse => 2003,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::QueueNotFound => 5000,
            Self::ConsumersAlreadySetup => 5001,
            Self::AlreadyListening => 5002,
            Self::InvalidCrontab => 5003,
            Self::InvalidConfiguration => 5004,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreError | Self::StoreConnectionFailed | Self::HandlerFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "setup",
            1100..=1199 => "delivery",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
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

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes and usage mistakes
    Low,
    /// Per-item failures the system recovers from
    Medium,
    /// Infrastructure failures
    High,
    /// The store is unreachable
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::GroupAlreadyExists
            | ErrorCode::QueueNotFound
            | ErrorCode::ConsumersAlreadySetup
            | ErrorCode::AlreadyListening
            | ErrorCode::InvalidCrontab
            | ErrorCode::InvalidConfiguration => Self::Low,

            ErrorCode::HandlerFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError => Self::Medium,

            ErrorCode::DeadLetterFailed
            | ErrorCode::StoreError
            | ErrorCode::ScriptError
            | ErrorCode::UnexpectedResponse => Self::High,

            ErrorCode::StoreConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for redqueue.
#[derive(Error, Debug)]
pub struct QuError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl QuError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// A consumer group that already exists on the stream.
    pub fn group_already_exists(stream: &str, group: &str) -> Self {
        Self::new(
            ErrorCode::GroupAlreadyExists,
            format!("consumer group {} already exists on {}", group, stream),
        )
    }

    /// A store call failed.
    pub fn store(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::StoreError, message)
    }

    /// The store answered with something we cannot interpret.
    pub fn unexpected_response(command: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::UnexpectedResponse,
            format!("unexpected {} response: {}", command, detail),
        )
    }

    /// A handler returned an error or panicked. The item stays pending.
    pub fn handler_failed(key: &str, message_id: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::HandlerFailed,
            format!("handler for {} failed on {}: {}", key, message_id, detail),
        )
    }

    /// Appending to the dead-letter stream failed.
    pub fn dead_letter_failed(dlq: &str, message_id: &str, source: QuError) -> Self {
        Self::new(
            ErrorCode::DeadLetterFailed,
            format!("failed to move {} to dead-letter stream {}", message_id, dlq),
        )
        .with_source(source)
    }

    /// `send` to a key that was never defined.
    pub fn queue_not_found(key: &str) -> Self {
        Self::new(
            ErrorCode::QueueNotFound,
            format!("key {} was not found in configuration", key),
        )
    }

    /// `setup_consumers` called twice.
    pub fn consumers_already_setup() -> Self {
        Self::new(ErrorCode::ConsumersAlreadySetup, "consumers already setup")
    }

    /// `start` called on a listening crontab.
    pub fn already_listening(key: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyListening,
            format!("crontab for {} is already listening", key),
        )
    }

    /// A crontab expression that cannot be parsed.
    pub fn invalid_crontab(expression: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidCrontab,
            format!("invalid crontab '{}': {}", expression, reason),
        )
    }

    /// A configuration value that fails validation.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// True for the "group already exists" setup race.
    pub fn is_group_already_exists(&self) -> bool {
        self.code == ErrorCode::GroupAlreadyExists
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    source = ?self.source,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "redqueue_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for QuError {
    fn from(error: redis::RedisError) -> Self {
        let busy_group =
            error.code() == Some("BUSYGROUP") || error.to_string().contains("BUSYGROUP");
        let (code, message) = if busy_group {
            (
                ErrorCode::GroupAlreadyExists,
                "Consumer group name already exists",
            )
        } else if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreConnectionFailed, "Unable to connect to Redis")
        } else if error.is_timeout() {
            (ErrorCode::StoreError, "Redis operation timed out")
        } else if error.kind() == redis::ErrorKind::NoScriptError {
            (ErrorCode::ScriptError, "Redis script is not loaded")
        } else if error.kind() == redis::ErrorKind::TypeError {
            (ErrorCode::UnexpectedResponse, "Unexpected Redis response")
        } else {
            (ErrorCode::StoreError, "A Redis error occurred")
        };

        Self::new(code, message).with_source(error)
    }
}

impl From<serde_json::Error> for QuError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::new(code, "Failed to process JSON payload").with_source(error)
    }
}

impl From<config::ConfigError> for QuError {
    fn from(error: config::ConfigError) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, "Failed to load configuration")
            .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
