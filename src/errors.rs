use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

const QUOTA_PHRASES: &[&str] = &["resource_exhausted", "quota", "rate limit"];

#[derive(Debug, Error)]
pub enum AppError {
    #[error("remote data source is rate limited: {0}")]
    RateLimited(String),
    #[error("remote data source returned an unreadable response: {0}")]
    MalformedResponse(String),
    #[error("remote data source failed: {0}")]
    Remote(String),
    #[error("local storage failed: {0}")]
    Storage(String),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// Rate-limit and quota exhaustion are the only failures worth retrying.
    /// Only remote failures are inspected; local and parse errors never qualify.
    pub fn is_quota_failure(&self) -> bool {
        match self {
            AppError::RateLimited(_) => true,
            AppError::Http(err) => err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS),
            AppError::Remote(message) => mentions_quota(message),
            AppError::MalformedResponse(_)
            | AppError::Storage(_)
            | AppError::Config(_)
            | AppError::Io(_)
            | AppError::Json(_) => false,
        }
    }
}

fn mentions_quota(message: &str) -> bool {
    let text = message.to_ascii_lowercase();
    QUOTA_PHRASES.iter().any(|phrase| text.contains(phrase))
        || text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "429")
}

/// What the view model shows for a failed listings or weather region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SearchFailure {
    TryAgainLater,
    BadResponseFormat,
    Unavailable(String),
}

impl From<&AppError> for SearchFailure {
    fn from(err: &AppError) -> Self {
        match err {
            AppError::MalformedResponse(_) | AppError::Json(_) => SearchFailure::BadResponseFormat,
            err if err.is_quota_failure() => SearchFailure::TryAgainLater,
            other => SearchFailure::Unavailable(sanitize_error_copy(&other.to_string())),
        }
    }
}

impl fmt::Display for SearchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchFailure::TryAgainLater => {
                f.write_str("The service is busy right now. Please try again later.")
            }
            SearchFailure::BadResponseFormat => {
                f.write_str("The service returned results in an unexpected format.")
            }
            SearchFailure::Unavailable(reason) => write!(f, "Results could not be loaded: {reason}"),
        }
    }
}

/// Strips anything that looks like an API key before an error reaches the UI or logs.
pub fn sanitize_error_copy(message: &str) -> String {
    message
        .split_whitespace()
        .map(|word| {
            if word.contains("key=") || (word.len() > 32 && word.starts_with("AIza")) {
                "[redacted]"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_quota_signatures() {
        assert!(AppError::RateLimited("slow down".into()).is_quota_failure());
        assert!(AppError::Remote("429 Too Many Requests".into()).is_quota_failure());
        assert!(AppError::Remote("RESOURCE_EXHAUSTED: Quota exceeded".into()).is_quota_failure());
        assert!(!AppError::Remote("500 Internal Server Error".into()).is_quota_failure());
        assert!(!AppError::MalformedResponse("expected `[`".into()).is_quota_failure());
    }

    #[test]
    fn quota_text_only_counts_for_remote_failures() {
        assert!(AppError::Remote("status 429".into()).is_quota_failure());
        assert!(!AppError::Remote("unexpected token at line 1 column 1429".into()).is_quota_failure());
        assert!(!AppError::MalformedResponse("EOF at line 1 column 429".into()).is_quota_failure());
        assert!(!AppError::Storage("quota exceeded on disk".into()).is_quota_failure());
        assert!(!AppError::Config("rate limit must be positive".into()).is_quota_failure());
    }

    #[test]
    fn maps_errors_to_view_failures() {
        assert_eq!(
            SearchFailure::from(&AppError::RateLimited("x".into())),
            SearchFailure::TryAgainLater
        );
        assert_eq!(
            SearchFailure::from(&AppError::MalformedResponse("x".into())),
            SearchFailure::BadResponseFormat
        );
        assert!(matches!(
            SearchFailure::from(&AppError::Remote("boom".into())),
            SearchFailure::Unavailable(_)
        ));
    }

    #[test]
    fn redacts_keys_from_error_copy() {
        let cleaned = sanitize_error_copy("request to https://x/?key=abc failed");
        assert_eq!(cleaned, "request to [redacted] failed");
    }
}
