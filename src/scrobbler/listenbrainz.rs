// ListenBrainz scrobbler implementation
// API Documentation: https://listenbrainz.readthedocs.io/

use super::traits::{ScrobbleService, Track};
use crate::error::ServiceError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;

pub struct ListenBrainzScrobbler {
    id: String,
    name: String,
    token: String,
    api_url: String,
    client: Client,
}

impl ListenBrainzScrobbler {
    pub fn new(name: String, token: String, api_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build ListenBrainz HTTP client")?;

        Ok(Self {
            id: format!("listenbrainz:{}", name),
            name,
            token,
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Submit a listen to ListenBrainz
    async fn submit_listen(
        &self,
        listen_type: &str,
        track: &Track,
        timestamp: Option<i64>,
    ) -> Result<(), ServiceError> {
        let payload = listen_payload(listen_type, track, timestamp);
        let url = format!("{}/1/submit-listens", self.api_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.token))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get("X-RateLimit-Reset-In")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(classify_response(status, retry_after, body))
    }
}

/// Build the submit-listens payload; "single" listens carry a timestamp
fn listen_payload(listen_type: &str, track: &Track, timestamp: Option<i64>) -> serde_json::Value {
    let mut track_metadata = json!({
        "artist_name": track.artist,
        "track_name": track.title,
    });

    if let Some(ref album) = track.album {
        track_metadata["release_name"] = json!(album);
    }

    if let Some(duration) = track.duration {
        track_metadata["additional_info"] = json!({ "duration": duration });
    }

    if listen_type == "playing_now" {
        json!({
            "listen_type": listen_type,
            "payload": [{
                "track_metadata": track_metadata,
            }]
        })
    } else {
        let ts = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
        json!({
            "listen_type": listen_type,
            "payload": [{
                "listened_at": ts,
                "track_metadata": track_metadata,
            }]
        })
    }
}

fn classify_response(status: StatusCode, retry_after: Option<Duration>, body: String) -> ServiceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ServiceError::AuthRejected(format!("ListenBrainz API error ({}): {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => ServiceError::Timeout,
        s if s.is_server_error() => {
            ServiceError::Network(format!("ListenBrainz API error ({}): {}", status, body))
        }
        _ => ServiceError::Rejected(format!("ListenBrainz API error ({}): {}", status, body)),
    }
}

#[async_trait]
impl ScrobbleService for ListenBrainzScrobbler {
    fn id(&self) -> &str {
        &self.id
    }

    async fn now_playing(&self, track: &Track) -> Result<(), ServiceError> {
        log::debug!(
            "Sending now playing to ListenBrainz ({}): {} - {}",
            self.name,
            track.artist,
            track.title
        );

        self.submit_listen("playing_now", track, None).await?;

        log::info!("ListenBrainz ({}): Now playing updated", self.name);
        Ok(())
    }

    async fn scrobble(&self, track: &Track, timestamp: i64) -> Result<(), ServiceError> {
        log::debug!(
            "Scrobbling to ListenBrainz ({}): {} - {}",
            self.name,
            track.artist,
            track.title
        );

        self.submit_listen("single", track, Some(timestamp)).await?;

        log::info!("ListenBrainz ({}): Scrobbled successfully", self.name);
        Ok(())
    }

    async fn update_love(&self, _track: &Track, _loved: bool) -> Result<(), ServiceError> {
        // Feedback needs a recording MBID or MSID, which samples never carry
        Err(ServiceError::Unsupported(format!(
            "ListenBrainz ({}) feedback without a recording id",
            self.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> Track {
        Track {
            title: "Track".into(),
            artist: "Artist".into(),
            album: Some("Album".into()),
            duration: Some(200),
        }
    }

    #[test]
    fn playing_now_payload_has_no_timestamp() {
        let payload = listen_payload("playing_now", &track(), Some(10));
        assert_eq!(payload["listen_type"], "playing_now");
        assert!(payload["payload"][0].get("listened_at").is_none());
        assert_eq!(payload["payload"][0]["track_metadata"]["release_name"], "Album");
    }

    #[test]
    fn single_payload_carries_timestamp() {
        let payload = listen_payload("single", &track(), Some(1_700_000_000));
        assert_eq!(payload["payload"][0]["listened_at"], 1_700_000_000);
        assert_eq!(
            payload["payload"][0]["track_metadata"]["additional_info"]["duration"],
            200
        );
    }

    #[test]
    fn classifies_status_codes() {
        assert!(matches!(
            classify_response(StatusCode::UNAUTHORIZED, None, String::new()),
            ServiceError::AuthRejected(_)
        ));
        assert_eq!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), String::new()),
            ServiceError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(classify_response(StatusCode::BAD_GATEWAY, None, String::new()).is_transient());
        assert!(matches!(
            classify_response(StatusCode::BAD_REQUEST, None, "bad".into()),
            ServiceError::Rejected(_)
        ));
    }

    #[test]
    fn id_includes_instance_name() {
        let scrobbler = ListenBrainzScrobbler::new(
            "Primary".into(),
            "token".into(),
            "https://api.listenbrainz.org/".into(),
        )
        .unwrap();
        assert_eq!(scrobbler.id(), "listenbrainz:Primary");
        assert_eq!(scrobbler.api_url, "https://api.listenbrainz.org");
    }
}
