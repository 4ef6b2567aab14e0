use thiserror::Error;

use crate::crawler::sweep::SurveyReport;

/// Classified failure raised while driving the remote form.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortalError {
    /// The portal dropped our session; cookies must be cleared before retrying.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Generic "facing issues / try again later" page. Retry with backoff, keep the session.
    #[error("portal issue: {0}")]
    PortalIssue(String),

    /// The browser engine (or its driver) is gone and must be recreated.
    #[error("browser unavailable: {0}")]
    BrowserDead(String),

    /// A navigation wait exceeded its configured timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A select did not offer the requested label.
    #[error("option not offered: {0}")]
    MissingOption(String),

    /// Anything else the driver reported (missing element, stale reference, ...).
    #[error("navigation failed: {0}")]
    Navigation(String),
}

impl PortalError {
    /// Map a raw WebDriver error message onto a failure class.
    pub fn from_driver_message(message: &str) -> Self {
        let lower = message.to_lowercase();

        const DEAD: [&str; 8] = [
            "invalid session id",
            "no such window",
            "session deleted",
            "chrome not reachable",
            "disconnected",
            "connection refused",
            "session not created",
            "target window already closed",
        ];

        if DEAD.iter().any(|p| lower.contains(p)) {
            PortalError::BrowserDead(message.to_string())
        } else if lower.contains("timeout") || lower.contains("timed out") {
            PortalError::Timeout(message.to_string())
        } else if lower.contains("unexpected alert") {
            PortalError::PortalIssue(message.to_string())
        } else {
            PortalError::Navigation(message.to_string())
        }
    }

    pub fn retry_reason(&self) -> RetryReason {
        match self {
            PortalError::SessionExpired(_) => RetryReason::SessionExpired,
            PortalError::PortalIssue(_) => RetryReason::PortalIssue,
            PortalError::BrowserDead(_) => RetryReason::BrowserDead,
            PortalError::Timeout(_) | PortalError::MissingOption(_) | PortalError::Navigation(_) => RetryReason::Transient,
        }
    }
}

impl From<thirtyfour::error::WebDriverError> for PortalError {
    fn from(err: thirtyfour::error::WebDriverError) -> Self {
        PortalError::from_driver_message(&err.to_string())
    }
}

/// Why a task is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    SessionExpired,
    PortalIssue,
    BrowserDead,
    Transient,
    Storage,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::SessionExpired => "session_expired",
            RetryReason::PortalIssue => "portal_issue",
            RetryReason::BrowserDead => "browser_dead",
            RetryReason::Transient => "transient",
            RetryReason::Storage => "storage",
        }
    }
}

/// Result of executing one survey task, consumed by the worker loop.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed(SurveyReport),
    Retryable { reason: RetryReason, detail: String },
    Fatal(String),
}

impl TaskOutcome {
    pub fn retryable(err: &PortalError) -> Self {
        TaskOutcome::Retryable {
            reason: err.retry_reason(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_messages_are_classified() {
        assert_eq!(
            PortalError::from_driver_message("invalid session id: session deleted because of page crash"),
            PortalError::BrowserDead("invalid session id: session deleted because of page crash".into())
        );
        assert!(matches!(
            PortalError::from_driver_message("timeout: Timed out receiving message from renderer"),
            PortalError::Timeout(_)
        ));
        assert!(matches!(
            PortalError::from_driver_message("unexpected alert open: {Alert text : We are facing issues}"),
            PortalError::PortalIssue(_)
        ));
        assert!(matches!(
            PortalError::from_driver_message("no such element: Unable to locate element"),
            PortalError::Navigation(_)
        ));
    }

    #[test]
    fn test_retry_reasons() {
        assert_eq!(PortalError::SessionExpired("x".into()).retry_reason(), RetryReason::SessionExpired);
        assert_eq!(PortalError::Navigation("x".into()).retry_reason(), RetryReason::Transient);
        assert_eq!(RetryReason::BrowserDead.as_str(), "browser_dead");
    }
}
