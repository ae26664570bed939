// Playback sampling module
// Polls a page connector and turns its raw readings into debounced samples

use crate::config::SamplerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Kind of media a connector reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Music,
    Podcast,
    Video,
}

/// One normalized reading of what a tab is playing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackSample {
    pub artist: Option<String>,
    pub track: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<u64>,
    pub position_secs: Option<f64>,
    pub is_playing: bool,
    #[serde(default)]
    pub media_type: MediaType,
    /// Love status as shown by the page, when the site exposes one
    #[serde(default)]
    pub loved: Option<bool>,
}

impl PlaybackSample {
    /// Convenience constructor for a playing music sample
    pub fn playing(artist: &str, track: &str) -> Self {
        Self {
            artist: Some(artist.to_string()),
            track: Some(track.to_string()),
            is_playing: true,
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn with_position(mut self, secs: f64) -> Self {
        self.position_secs = Some(secs);
        self
    }

    pub fn paused(mut self) -> Self {
        self.is_playing = false;
        self
    }

    /// Trim strings, drop blanks, and discard nonsensical numbers
    pub fn normalized(self) -> Self {
        fn text(value: Option<String>) -> Option<String> {
            value
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        }

        Self {
            artist: text(self.artist),
            track: text(self.track),
            album: text(self.album),
            duration_secs: self.duration_secs.filter(|d| *d > 0),
            position_secs: self.position_secs.filter(|p| p.is_finite() && *p >= 0.0),
            ..self
        }
    }

    /// Case-insensitive key of the raw artist/track pair
    pub fn raw_key(&self) -> (Option<String>, Option<String>) {
        (
            self.artist.as_ref().map(|s| s.to_lowercase()),
            self.track.as_ref().map(|s| s.to_lowercase()),
        )
    }
}

/// Per-site adapter that reads playback state out of a page
///
/// Every primitive is a cheap read of the page's current state. Sites that
/// cannot report a value return `None`.
pub trait Connector: Send {
    fn artist(&mut self) -> Option<String>;
    fn track(&mut self) -> Option<String>;
    fn album(&mut self) -> Option<String> {
        None
    }
    fn duration_secs(&mut self) -> Option<f64> {
        None
    }
    fn position_secs(&mut self) -> Option<f64> {
        None
    }
    fn is_playing(&mut self) -> bool;
    fn is_loved(&mut self) -> Option<bool> {
        None
    }
    fn media_type(&mut self) -> MediaType {
        MediaType::Music
    }
}

/// Debounces connector readings
///
/// A reading whose artist/track differs from the last emitted one is held back
/// until it has been observed for `debounce_polls` consecutive polls. Readings
/// of the already emitted track pass straight through.
#[derive(Debug)]
pub struct Sampler {
    debounce_polls: u32,
    emitted: Option<(Option<String>, Option<String>)>,
    candidate: Option<((Option<String>, Option<String>), u32)>,
}

impl Sampler {
    pub fn new(config: &SamplerConfig) -> Self {
        Self {
            debounce_polls: config.debounce_polls.max(1),
            emitted: None,
            candidate: None,
        }
    }

    /// Read every primitive of the connector once and debounce the result
    pub fn poll(&mut self, connector: &mut dyn Connector) -> Option<PlaybackSample> {
        let sample = PlaybackSample {
            artist: connector.artist(),
            track: connector.track(),
            album: connector.album(),
            duration_secs: connector
                .duration_secs()
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| d.round() as u64),
            position_secs: connector.position_secs(),
            is_playing: connector.is_playing(),
            media_type: connector.media_type(),
            loved: connector.is_loved(),
        };
        self.observe(sample)
    }

    /// Debounce an already captured reading
    pub fn observe(&mut self, sample: PlaybackSample) -> Option<PlaybackSample> {
        let sample = sample.normalized();
        let key = sample.raw_key();

        if self.emitted.as_ref() == Some(&key) {
            self.candidate = None;
            return Some(sample);
        }

        let seen = match self.candidate.take() {
            Some((candidate, count)) if candidate == key => count + 1,
            _ => 1,
        };

        if seen >= self.debounce_polls {
            log::debug!("Sampler settled on {:?}", key);
            self.emitted = Some(key);
            Some(sample)
        } else {
            self.candidate = Some((key, seen));
            None
        }
    }

    /// Poll `connector` every `interval` until `cancel` fires or `emit` returns false
    pub async fn run<F>(
        mut self,
        mut connector: Box<dyn Connector>,
        interval: Duration,
        cancel: CancellationToken,
        mut emit: F,
    ) where
        F: FnMut(PlaybackSample) -> bool + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(sample) = self.poll(connector.as_mut()) {
                        if !emit(sample) {
                            break;
                        }
                    }
                }
            }
        }

        log::debug!("Sampler stopped");
    }
}
