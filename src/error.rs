//! Error types for the publisher connector
//!
//! Caller-facing errors raised synchronously by the connector facade, plus the
//! sanitizer used whenever broker error text ends up in logs or error values.

use crate::broker::BrokerError;
use crate::connector::state::StateSnapshot;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors surfaced to code calling into the connector
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Operation not allowed: {message}")]
    OperationNotAllowed { message: String },

    #[error("Could not connect to any broker node{}", authentication_hint(.authentication_failed))]
    CouldNotConnect { authentication_failed: bool },

    #[error("Connector already started")]
    AlreadyStarted,

    #[error("No broker nodes registered")]
    NoNodes,

    #[error("Failed to start event loop runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Message body could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Event loop thread panicked")]
    LoopPanicked,
}

impl ConnectorError {
    /// Create operation-not-allowed error
    pub fn operation_not_allowed<S: Into<String>>(message: S) -> Self {
        Self::OperationNotAllowed {
            message: message.into(),
        }
    }

    /// Map a terminal state to the error a late enqueue should see
    pub fn for_terminal_state(snapshot: &StateSnapshot) -> Self {
        if snapshot.could_not_connect {
            return Self::CouldNotConnect {
                authentication_failed: snapshot.authentication_failed,
            };
        }
        if snapshot.is_force_finished() {
            return Self::operation_not_allowed(
                "connector was force-finished, no more messages accepted",
            );
        }
        Self::operation_not_allowed(format!(
            "connector is permanently unavailable ({}), no more messages accepted",
            snapshot.state
        ))
    }
}

fn authentication_hint(authentication_failed: &bool) -> &'static str {
    if *authentication_failed {
        " (authentication failed)"
    } else {
        ""
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").expect("static regex is valid")
});

static URI_CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(amqps?://[^:/@\s]+):[^@\s]*@").expect("static regex is valid")
});

/// Strip credentials from error text before logging or returning it
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = URI_CREDENTIALS
        .replace_all(&sanitized, "${1}:***@")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;
