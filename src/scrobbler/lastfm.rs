// Last.fm scrobbler implementation
// API Documentation: https://www.last.fm/api/scrobbling

use super::traits::{ScrobbleService, Track};
use crate::error::ServiceError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const API_URL: &str = "https://ws.audioscrobbler.com/2.0/";

pub struct LastFmScrobbler {
    api_key: String,
    api_secret: String,
    session_key: String,
    api_url: String,
    client: Client,
}

/// Error body returned by the Last.fm API
#[derive(Debug, Deserialize)]
struct ApiError {
    error: u32,
    #[serde(default)]
    message: String,
}

impl LastFmScrobbler {
    pub fn new(api_key: String, api_secret: String, session_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build Last.fm HTTP client")?;

        Ok(Self {
            api_key,
            api_secret,
            session_key,
            api_url: API_URL.to_string(),
            client,
        })
    }

    /// Call a signed write method of the API
    async fn call(&self, method: &str, mut params: BTreeMap<&str, String>) -> Result<(), ServiceError> {
        params.insert("method", method.to_string());
        params.insert("api_key", self.api_key.clone());
        params.insert("sk", self.session_key.clone());
        let signature = sign(&params, &self.api_secret);
        params.insert("api_sig", signature);
        params.insert("format", "json".to_string());

        let response = self.client.post(&self.api_url).form(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
            return Err(error_from_code(api_error.error, api_error.message));
        }

        if status.is_server_error() {
            return Err(ServiceError::Network(format!("Last.fm API error ({})", status)));
        }
        if !status.is_success() {
            return Err(ServiceError::Rejected(format!("Last.fm API error ({}): {}", status, body)));
        }

        Ok(())
    }

    fn track_params(track: &Track) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        params.insert("artist", track.artist.clone());
        params.insert("track", track.title.clone());
        if let Some(ref album) = track.album {
            params.insert("album", album.clone());
        }
        params
    }
}

/// Request signature: md5 of the params sorted by name, concatenated, plus the secret
fn sign(params: &BTreeMap<&str, String>, secret: &str) -> String {
    let mut raw = String::new();
    for (key, value) in params {
        if *key == "format" || *key == "callback" {
            continue;
        }
        raw.push_str(key);
        raw.push_str(value);
    }
    raw.push_str(secret);
    format!("{:x}", md5::compute(raw.as_bytes()))
}

/// Map Last.fm error codes onto failure classes
fn error_from_code(code: u32, message: String) -> ServiceError {
    match code {
        // Invalid session key, authentication failed, invalid API key, suspended key
        4 | 9 | 10 | 14 | 26 => ServiceError::AuthRejected(format!("Last.fm error {}: {}", code, message)),
        // Operation failed, service offline, temporarily unavailable
        8 | 11 | 16 => ServiceError::Network(format!("Last.fm error {}: {}", code, message)),
        29 => ServiceError::RateLimited { retry_after: None },
        _ => ServiceError::Rejected(format!("Last.fm error {}: {}", code, message)),
    }
}

#[async_trait]
impl ScrobbleService for LastFmScrobbler {
    fn id(&self) -> &str {
        "lastfm"
    }

    async fn now_playing(&self, track: &Track) -> Result<(), ServiceError> {
        let mut params = Self::track_params(track);
        if let Some(duration) = track.duration {
            params.insert("duration", duration.to_string());
        }
        self.call("track.updateNowPlaying", params).await?;
        log::info!("Last.fm: Now playing updated");
        Ok(())
    }

    async fn scrobble(&self, track: &Track, timestamp: i64) -> Result<(), ServiceError> {
        let mut params = Self::track_params(track);
        params.insert("timestamp", timestamp.to_string());
        if let Some(duration) = track.duration {
            params.insert("duration", duration.to_string());
        }
        self.call("track.scrobble", params).await?;
        log::info!("Last.fm: Scrobbled successfully");
        Ok(())
    }

    async fn update_love(&self, track: &Track, loved: bool) -> Result<(), ServiceError> {
        let mut params = BTreeMap::new();
        params.insert("artist", track.artist.clone());
        params.insert("track", track.title.clone());
        let method = if loved { "track.love" } else { "track.unlove" };
        self.call(method, params).await?;
        log::info!("Last.fm: {} - {} marked as {}", track.artist, track.title, if loved { "loved" } else { "unloved" });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_format_and_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("track", "T".to_string());
        a.insert("artist", "A".to_string());
        let mut b = BTreeMap::new();
        b.insert("artist", "A".to_string());
        b.insert("track", "T".to_string());
        b.insert("format", "json".to_string());

        let sig = sign(&a, "secret");
        assert_eq!(sig, sign(&b, "secret"));
        assert_eq!(sig.len(), 32);
        assert_eq!(sig, format!("{:x}", md5::compute(b"artistAtrackTsecret")));
        assert_ne!(sig, sign(&a, "other"));
    }

    #[test]
    fn maps_error_codes() {
        assert!(matches!(error_from_code(9, "Invalid session key".into()), ServiceError::AuthRejected(_)));
        assert!(error_from_code(16, "Try again".into()).is_transient());
        assert_eq!(error_from_code(29, String::new()), ServiceError::RateLimited { retry_after: None });
        assert!(matches!(error_from_code(6, "Invalid parameters".into()), ServiceError::Rejected(_)));
    }

    #[test]
    fn track_params_skip_missing_album() {
        let track = Track {
            title: "T".into(),
            artist: "A".into(),
            album: None,
            duration: None,
        };
        let params = LastFmScrobbler::track_params(&track);
        assert_eq!(params.len(), 2);
        assert!(!params.contains_key("album"));
    }
}
