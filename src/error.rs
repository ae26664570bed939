// Error types shared by the tracking core and the scrobbling backends

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure returned by a single call to an external scrobbling service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Connection failures and 5xx responses
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by service")]
    RateLimited { retry_after: Option<Duration> },

    /// The service no longer accepts the stored credentials
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The service refused the request itself (bad parameters, filtered track)
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

/// How the dispatcher treats a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying with backoff
    Transient,
    /// Retrying will not help
    Permanent,
    /// Permanent, and the binding must be re-authenticated
    AuthRejected,
}

impl ServiceError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network(_) | Self::Timeout | Self::RateLimited { .. } => FailureClass::Transient,
            Self::AuthRejected(_) => FailureClass::AuthRejected,
            Self::Rejected(_) | Self::Unsupported(_) => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Why a sample did not produce a trackable identity
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    /// Nothing identifiable is playing
    #[error("no artist or track")]
    MissingArtistAndTrack,

    #[error("no artist")]
    MissingArtist,

    #[error("no track")]
    MissingTrack,

    /// Artist or track matched a denylist entry
    #[error("matches denylist entry '{0}'")]
    Denylisted(String),
}

impl IneligibleReason {
    /// Whether a user correction can turn this sample into a trackable item
    pub fn is_correctable(&self) -> bool {
        matches!(self, Self::MissingArtist | Self::MissingTrack)
    }
}

/// The tracker's event loop has shut down
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("tracker is not running")]
pub struct TrackerStopped;
