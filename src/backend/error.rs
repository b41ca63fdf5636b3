//! Stack backend error types.
//!
//! Errors are split by what the caller should do about them:
//!
//! - **Transient**: throttling, network failures, per-call timeouts. Retried
//!   with backoff.
//! - **Permanent**: invalid templates, missing permissions, stacks in a state
//!   that forbids the operation. Returned immediately.

use std::fmt;

use thiserror::Error;

/// The kind of backend error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Transient,
    Permanent,
}

impl BackendErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, BackendErrorKind::Transient)
    }
}

/// A backend error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct BackendError {
    pub kind: BackendErrorKind,

    pub message: String,

    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BackendErrorKind::Transient => write!(f, "transient backend error: {}", self.message),
            BackendErrorKind::Permanent => write!(f, "backend error: {}", self.message),
        }
    }
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Transient,
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Permanent,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Categorizes an error message reported by the backend.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_throttling_error(&message) || is_network_error(&message) {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Checks if a message indicates API throttling or a temporary service fault.
fn is_throttling_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("throttl")
        || message_lower.contains("rate exceeded")
        || message_lower.contains("requestlimitexceeded")
        || message_lower.contains("too many requests")
        || message_lower.contains("serviceunavailable")
        || message_lower.contains("service unavailable")
        || message_lower.contains("internalfailure")
        || message_lower.contains("internal error")
}

/// Checks if a message indicates a network-level failure.
fn is_network_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("could not connect")
        || message_lower.contains("connection was closed")
        || message_lower.contains("connection reset")
        || message_lower.contains("timed out")
        || message_lower.contains("timeout")
        || message_lower.contains("name resolution")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_detection() {
        assert!(is_throttling_error(
            "An error occurred (Throttling) when calling the DescribeStacks operation: Rate exceeded"
        ));
        assert!(is_throttling_error("RequestLimitExceeded"));
        assert!(is_throttling_error("ServiceUnavailable: try later"));
        assert!(!is_throttling_error("Template format error"));
    }

    #[test]
    fn network_error_detection() {
        assert!(is_network_error(
            "Could not connect to the endpoint URL: \"https://cloudformation.us-east-1.amazonaws.com/\""
        ));
        assert!(is_network_error("Read timeout on endpoint URL"));
        assert!(is_network_error("Connection was closed before we received a valid response"));
        assert!(!is_network_error("Stack [app] does not exist"));
    }

    #[test]
    fn from_message_categorizes() {
        assert!(BackendError::from_message("Rate exceeded").is_transient());
        assert!(!BackendError::from_message("AccessDenied: not authorized").is_transient());
        assert!(
            !BackendError::from_message("ValidationError: Template format error").is_transient()
        );
    }

    #[test]
    fn display_mentions_kind() {
        assert_eq!(
            BackendError::transient("Rate exceeded").to_string(),
            "transient backend error: Rate exceeded"
        );
        assert_eq!(
            BackendError::permanent("AccessDenied").to_string(),
            "backend error: AccessDenied"
        );
    }

    #[test]
    fn error_kind_retriable() {
        assert!(BackendErrorKind::Transient.is_retriable());
        assert!(!BackendErrorKind::Permanent.is_retriable());
    }
}
