use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderTag;

/// Terminal failure categories surfaced to the chat and the usage recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidLink,
    AuthRequired,
    NotFound,
    ProviderError,
    SynthesisError,
    Timeout,
    DeliveryError,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidLink => "invalid_link",
            FailureKind::AuthRequired => "auth_required",
            FailureKind::NotFound => "not_found",
            FailureKind::ProviderError => "provider_error",
            FailureKind::SynthesisError => "synthesis_error",
            FailureKind::Timeout => "timeout",
            FailureKind::DeliveryError => "delivery_error",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Short chat-facing notice. Never includes tool output.
    pub fn user_message(&self, provider: ProviderTag) -> String {
        let name = provider.display_name();
        match self {
            FailureKind::InvalidLink => format!("This {name} link is not supported."),
            FailureKind::AuthRequired => {
                format!("This {name} content requires login and no valid session is configured.")
            }
            FailureKind::NotFound => {
                format!("{name} content not found. It may be private or removed.")
            }
            FailureKind::ProviderError => {
                format!("{name} download failed. Please try again later.")
            }
            FailureKind::SynthesisError => {
                format!("Could not assemble the {name} slideshow into a video.")
            }
            FailureKind::Timeout => format!("{name} download took too long and was stopped."),
            FailureKind::DeliveryError => {
                format!("Downloaded the {name} media but could not upload it.")
            }
            FailureKind::Cancelled => format!("{name} download was cancelled."),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a provider adapter.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported url: {0}")]
    InvalidUrl(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The target exists but holds no video; a gallery extractor may handle it.
    #[error("no video content: {0}")]
    NonVideo(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::InvalidUrl(_) => FailureKind::InvalidLink,
            FetchError::AuthRequired(_) => FailureKind::AuthRequired,
            FetchError::NotFound(_) | FetchError::NonVideo(_) => FailureKind::NotFound,
            FetchError::Transient(_) | FetchError::Provider(_) | FetchError::Io(_) => {
                FailureKind::ProviderError
            }
            FetchError::Timeout(_) => FailureKind::Timeout,
            FetchError::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl From<process_utils::ProcessError> for FetchError {
    fn from(err: process_utils::ProcessError) -> Self {
        use process_utils::ProcessError;
        match err {
            ProcessError::Timeout { timeout, .. } => FetchError::Timeout(timeout),
            ProcessError::Cancelled { .. } => FetchError::Cancelled,
            ProcessError::Spawn { program, source } => {
                FetchError::Provider(format!("failed to launch {program}: {source}"))
            }
            ProcessError::Io { source, .. } => FetchError::Io(source),
        }
    }
}

/// Map extractor stderr to a typed error.
pub fn classify_stderr(tool: &str, stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    let snippet = last_error_line(stderr);
    let detail = format!("{tool}: {snippet}");

    const AUTH: &[&str] = &[
        "login required",
        "authentication required",
        "requires authentication",
        "use --cookies",
        "sign in to confirm",
        "age-restricted",
        "age restricted",
    ];
    const NOT_FOUND: &[&str] = &[
        "404",
        "not found",
        "unavailable",
        "private video",
        "private account",
        "is private",
        "has been removed",
        "no longer available",
    ];
    const NON_VIDEO: &[&str] = &[
        "no video formats found",
        "this post contains no media",
        "there is no video in this post",
        "no video could be found",
    ];
    const TRANSIENT: &[&str] = &[
        "timed out",
        "connection reset",
        "temporary failure",
        "too many requests",
        "http error 429",
        "http error 5",
        "network is unreachable",
        "connection refused",
        "remote end closed connection",
    ];

    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(AUTH) {
        FetchError::AuthRequired(detail)
    } else if has(NON_VIDEO) {
        FetchError::NonVideo(detail)
    } else if lower.contains("unsupported url") {
        FetchError::InvalidUrl(detail)
    } else if has(NOT_FOUND) {
        FetchError::NotFound(detail)
    } else if has(TRANSIENT) {
        FetchError::Transient(detail)
    } else {
        FetchError::Provider(detail)
    }
}

fn last_error_line(stderr: &str) -> &str {
    let lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty());
    lines
        .clone()
        .filter(|l| l.to_lowercase().contains("error"))
        .last()
        .or_else(|| lines.last())
        .unwrap_or("unknown error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ERROR: [instagram] abc: Login required to access this post", FailureKind::AuthRequired)]
    #[case("ERROR: [youtube] xyz: Private video. Sign in if you've been granted access", FailureKind::NotFound)]
    #[case("ERROR: [tiktok] 123: HTTP Error 404: Not Found", FailureKind::NotFound)]
    #[case("ERROR: Unsupported URL: https://example.com", FailureKind::InvalidLink)]
    #[case("ERROR: [tiktok] 1: No video formats found!", FailureKind::NotFound)]
    #[case("ERROR: Unable to download webpage: The read operation timed out", FailureKind::ProviderError)]
    #[case("something odd happened", FailureKind::ProviderError)]
    fn stderr_maps_to_failure_kind(#[case] stderr: &str, #[case] expected: FailureKind) {
        assert_eq!(classify_stderr("yt-dlp", stderr).kind(), expected);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(classify_stderr("yt-dlp", "ERROR: connection reset by peer").is_retryable());
        assert!(!classify_stderr("yt-dlp", "ERROR: login required").is_retryable());
        assert!(!FetchError::InvalidUrl("x".into()).is_retryable());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn non_video_is_distinct_from_invalid_url() {
        assert!(matches!(
            classify_stderr("yt-dlp", "ERROR: This post contains no media"),
            FetchError::NonVideo(_)
        ));
    }

    #[test]
    fn detail_keeps_last_error_line() {
        let err = classify_stderr("gallery-dl", "[info] start\n[error] HttpError: 404 Not Found\n");
        assert_eq!(err.to_string(), "not found: gallery-dl: [error] HttpError: 404 Not Found");
    }

    #[test]
    fn user_message_names_provider() {
        let msg = FailureKind::AuthRequired.user_message(ProviderTag::Instagram);
        assert!(msg.contains("Instagram"));
        assert!(msg.contains("login"));
    }
}
