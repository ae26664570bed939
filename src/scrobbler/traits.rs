// Common traits for scrobbling services

use crate::error::ServiceError;
use async_trait::async_trait;

/// Track information sent to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration: Option<u64>, // Duration in seconds
}

/// Common trait for all scrobbling services
#[async_trait]
pub trait ScrobbleService: Send + Sync {
    /// Stable identifier of this service instance, e.g. `lastfm` or `listenbrainz:Primary`
    fn id(&self) -> &str;

    /// Update "now playing" status
    async fn now_playing(&self, track: &Track) -> Result<(), ServiceError>;

    /// Submit a scrobble listened at `timestamp` (unix seconds)
    async fn scrobble(&self, track: &Track, timestamp: i64) -> Result<(), ServiceError>;

    /// Mark the track as loved or unloved
    async fn update_love(&self, _track: &Track, _loved: bool) -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported(format!("love updates on {}", self.id())))
    }
}
