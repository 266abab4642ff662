use std::time::Duration;

/// Typed errors raised by an external responder.
/// Classifies errors as retryable or terminal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ResponderError {
    // Terminal
    #[error("content blocked by safety filter: {0}")]
    SafetyBlocked(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("quota exhausted: {0}")]
    QuotaExceeded(String),

    // Retryable
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("network error: {0}")]
    Network(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// Coarse failure buckets used to pick the apology shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Model down or overloaded: suggest retrying or asking a lawyer.
    Unavailable,
    /// Safety filter rejected the prompt: ask to rephrase.
    Safety,
    /// Quota or rate limit hit: ask to retry later.
    Quota,
    Generic,
}

impl ResponderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable(_) | Self::RateLimited { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::ModelUnavailable(_) => FailureClass::Unavailable,
            Self::SafetyBlocked(_) => FailureClass::Safety,
            Self::RateLimited { .. } | Self::QuotaExceeded(_) => FailureClass::Quota,
            Self::InvalidRequest(_) | Self::Network(_) | Self::Timeout(_) | Self::Other(_) => {
                FailureClass::Generic
            }
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SafetyBlocked(_) => "safety_blocked",
            Self::InvalidRequest(_) => "invalid_request",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Other(_) => "other",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 if body.contains("safety") || body.contains("content_filter") => {
                Self::SafetyBlocked(body)
            }
            400 | 401 | 403 | 404 => Self::InvalidRequest(body),
            402 => Self::QuotaExceeded(body),
            429 if body.contains("quota") => Self::QuotaExceeded(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ModelUnavailable(format!("status {status}: {body}")),
            _ => Self::Other(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ResponderError::ModelUnavailable("down".into()).is_retryable());
        assert!(ResponderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ResponderError::Network("tcp".into()).is_retryable());
        assert!(ResponderError::Timeout(Duration::from_secs(60)).is_retryable());
        assert!(!ResponderError::SafetyBlocked("x".into()).is_retryable());
        assert!(!ResponderError::QuotaExceeded("x".into()).is_retryable());
    }

    #[test]
    fn failure_classes() {
        assert_eq!(
            ResponderError::ModelUnavailable("x".into()).failure_class(),
            FailureClass::Unavailable
        );
        assert_eq!(
            ResponderError::SafetyBlocked("x".into()).failure_class(),
            FailureClass::Safety
        );
        assert_eq!(
            ResponderError::RateLimited { retry_after: None }.failure_class(),
            FailureClass::Quota
        );
        assert_eq!(
            ResponderError::QuotaExceeded("x".into()).failure_class(),
            FailureClass::Quota
        );
        assert_eq!(
            ResponderError::Timeout(Duration::from_secs(1)).failure_class(),
            FailureClass::Generic
        );
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            ResponderError::from_status(400, "blocked by content_filter".into()),
            ResponderError::SafetyBlocked(_)
        ));
        assert!(matches!(
            ResponderError::from_status(401, "unauthorized".into()),
            ResponderError::InvalidRequest(_)
        ));
        assert!(matches!(
            ResponderError::from_status(429, "slow down".into()),
            ResponderError::RateLimited { .. }
        ));
        assert!(matches!(
            ResponderError::from_status(429, "insufficient_quota".into()),
            ResponderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            ResponderError::from_status(503, "overloaded".into()),
            ResponderError::ModelUnavailable(_)
        ));
        assert!(matches!(
            ResponderError::from_status(302, "moved".into()),
            ResponderError::Other(_)
        ));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ResponderError::Other("x".into()).error_kind(), "other");
        assert_eq!(
            ResponderError::Timeout(Duration::from_secs(1)).error_kind(),
            "timeout"
        );
    }
}
