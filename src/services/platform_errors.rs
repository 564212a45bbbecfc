//! Kameo API error differentiation
//!
//! Parses platform responses into structured error types so callers can
//! decide between retrying, re-authenticating, re-previewing a bid, or
//! surfacing the failure.

use serde::Deserialize;
use thiserror::Error;

/// Structured platform error types
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// Login or second-factor verification failed
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// A previously valid session was rejected mid-call
    #[error("session expired")]
    SessionExpired,
    /// Rate limited by the platform
    #[error("rate limited by the platform")]
    RateLimited { retry_after: Option<u64> },
    /// Sequence hash rejected as expired or already consumed
    #[error("sequence token rejected: {0}")]
    SequenceToken(String),
    /// Loan fails a local eligibility check
    #[error("loan {loan_id} not eligible: {reason}")]
    Ineligible { loan_id: i64, reason: String },
    /// Submit was accepted but the bid never showed up during verification
    #[error("bid on loan {loan_id} unverified: {detail}")]
    Unverified { loan_id: i64, detail: String },
    /// Network failure or server-side error (timeout, DNS, 5xx)
    #[error("network error: {0}")]
    Network(String),
    /// Request rejected as invalid input
    #[error("validation error: {0}")]
    Validation(String),
    /// Unclassified error with status code and body
    #[error("platform error {status}: {body}")]
    Unknown { status: u16, body: String },
}

/// Platform error response format
#[derive(Debug, Deserialize)]
struct PlatformErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl PlatformError {
    /// Parse a platform response into a structured error
    pub fn from_response(status: u16, body: &str) -> Self {
        // Try to parse JSON error response
        let error_msg = if let Ok(parsed) = serde_json::from_str::<PlatformErrorResponse>(body) {
            parsed.error.or(parsed.message).unwrap_or_default()
        } else {
            body.to_string()
        };

        let msg_lower = error_msg.to_lowercase();

        // Rate limiting
        if status == 429 || msg_lower.contains("rate limit") || msg_lower.contains("too many requests") {
            return PlatformError::RateLimited { retry_after: None };
        }

        // Session no longer accepted
        if status == 401 || status == 403 || msg_lower.contains("unauthorized") || msg_lower.contains("forbidden") || msg_lower.contains("not logged in") {
            return PlatformError::SessionExpired;
        }

        // Stale or consumed sequence hash
        if msg_lower.contains("sequence") || msg_lower.contains("hash") {
            return PlatformError::SequenceToken(error_msg);
        }

        // Server-side failures are transient
        if status >= 500 {
            return PlatformError::Network(format!("server error {}: {}", status, error_msg));
        }

        // Remaining client errors are input problems
        if (400..500).contains(&status) {
            return PlatformError::Validation(error_msg);
        }

        PlatformError::Unknown {
            status,
            body: error_msg,
        }
    }

    /// Parse a network/reqwest error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            PlatformError::Network("request timed out".to_string())
        } else if err.is_connect() {
            PlatformError::Network("connection failed".to_string())
        } else {
            PlatformError::Network(err.to_string())
        }
    }

    /// Whether this error is retryable with exponential backoff.
    ///
    /// Sequence token rejections are excluded: retrying the same submit
    /// would replay a consumed hash, so the bidding engine re-previews
    /// instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. } | PlatformError::Network(_) | PlatformError::SessionExpired
        )
    }

    /// Stable tag for audit records and job results
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformError::Authentication(_) => "authentication",
            PlatformError::SessionExpired => "session_expired",
            PlatformError::RateLimited { .. } => "rate_limited",
            PlatformError::SequenceToken(_) => "sequence_token",
            PlatformError::Ineligible { .. } => "ineligible",
            PlatformError::Unverified { .. } => "unverified",
            PlatformError::Network(_) => "network",
            PlatformError::Validation(_) => "validation",
            PlatformError::Unknown { .. } => "unknown",
        }
    }

    /// Human-readable error message for CLI output and the API surface
    pub fn user_message(&self) -> String {
        match self {
            PlatformError::Authentication(msg) => format!("Login failed: {}.", msg),
            PlatformError::SessionExpired => "Session expired. It will be renewed on the next call.".to_string(),
            PlatformError::RateLimited { retry_after } => match retry_after {
                Some(secs) => format!("Too many requests. Retry after {}s.", secs),
                None => "Too many requests. Please wait a moment and try again.".to_string(),
            },
            PlatformError::SequenceToken(msg) => format!("Bid sequence rejected: {}. A new preview is required.", msg),
            PlatformError::Ineligible { loan_id, reason } => format!("Loan {} is not biddable: {}.", loan_id, reason),
            PlatformError::Unverified { loan_id, detail } => {
                format!("Bid on loan {} was submitted but could not be verified: {}. Check the account manually.", loan_id, detail)
            }
            PlatformError::Network(msg) => format!("Network error: {}. Please check your connection.", msg),
            PlatformError::Validation(msg) => format!("Invalid request: {}.", msg),
            PlatformError::Unknown { status, body } => format!("Platform error {}: {}", status, body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited() {
        let err = PlatformError::from_response(429, "");
        assert!(err.is_retryable());
        assert!(matches!(err, PlatformError::RateLimited { retry_after: None }));
    }

    #[test]
    fn test_session_expired() {
        let err = PlatformError::from_response(401, r#"{"message":"Unauthorized"}"#);
        assert!(err.is_retryable());
        assert!(matches!(err, PlatformError::SessionExpired));
    }

    #[test]
    fn test_sequence_token_rejected() {
        let err = PlatformError::from_response(400, r#"{"error":"Invalid sequence hash"}"#);
        assert!(!err.is_retryable());
        assert!(matches!(err, PlatformError::SequenceToken(_)));
    }

    #[test]
    fn test_server_error_is_retryable() {
        let err = PlatformError::from_response(502, "Bad gateway");
        assert!(err.is_retryable());
        assert!(matches!(err, PlatformError::Network(_)));
    }

    #[test]
    fn test_validation_not_retryable() {
        let err = PlatformError::from_response(400, r#"{"error":"Amount below minimum bid"}"#);
        assert!(!err.is_retryable());
        assert!(matches!(err, PlatformError::Validation(_)));
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(PlatformError::SessionExpired.kind(), "session_expired");
        let err = PlatformError::Ineligible {
            loan_id: 4852,
            reason: "loan is closed".to_string(),
        };
        assert_eq!(err.kind(), "ineligible");
    }
}
