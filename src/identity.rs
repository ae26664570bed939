// Track identity resolution
// Turns raw samples into canonical identities, applying user corrections and the denylist

use crate::config::{CleanupConfig, FilterConfig};
use crate::error::IneligibleReason;
use crate::sample::PlaybackSample;
use crate::text_cleanup::TextCleaner;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Canonical identity of a track
///
/// Two identities are equal when artist and track match case-insensitively;
/// album and duration are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub artist: String,
    pub track: String,
    pub album: Option<String>,
    pub duration_secs: Option<u64>,
    /// Correction the user applied on top of the raw sample, if any
    pub correction: Option<Correction>,
}

/// Case-normalized (artist, track) pair, usable as a map key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub artist: String,
    pub track: String,
}

impl TrackIdentity {
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            artist: self.artist.to_lowercase(),
            track: self.track.to_lowercase(),
        }
    }

    /// Stricter than `==`: also compares album, used to detect user edits
    pub fn same_fields(&self, other: &Self) -> bool {
        self == other && self.album == other.album
    }
}

impl PartialEq for TrackIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TrackIdentity {}

impl Hash for TrackIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Field overrides supplied by the user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub artist: Option<String>,
    pub track: Option<String>,
    pub album: Option<String>,
}

impl Correction {
    pub fn is_empty(&self) -> bool {
        [&self.artist, &self.track, &self.album]
            .iter()
            .all(|field| field.as_deref().map_or(true, |s| s.trim().is_empty()))
    }

    /// Layer `newer` over `self`, newer non-empty fields winning
    pub fn merged(&self, newer: &Correction) -> Correction {
        fn pick(newer: &Option<String>, older: &Option<String>) -> Option<String> {
            non_empty(newer.as_deref())
                .or_else(|| non_empty(older.as_deref()))
                .map(str::to_string)
        }

        Correction {
            artist: pick(&newer.artist, &self.artist),
            track: pick(&newer.track, &self.track),
            album: pick(&newer.album, &self.album),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

pub struct IdentityResolver {
    cleaner: TextCleaner,
    denylist: Vec<String>,
}

impl IdentityResolver {
    pub fn new(cleanup: &CleanupConfig, filter: &FilterConfig) -> Self {
        let denylist = filter
            .denylist
            .iter()
            .map(|entry| entry.trim().to_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();

        Self {
            cleaner: TextCleaner::new(cleanup),
            denylist,
        }
    }

    /// Resolve a sample into an identity, correction fields winning over the sample's
    pub fn resolve(
        &self,
        sample: &PlaybackSample,
        correction: Option<&Correction>,
    ) -> Result<TrackIdentity, IneligibleReason> {
        let overlay = |corrected: Option<&String>, raw: Option<&String>| {
            match non_empty(corrected.map(String::as_str)) {
                Some(value) => Some(value.to_string()),
                None => self.cleaner.clean_option(raw.map(String::as_str)),
            }
        };

        let correction = correction.filter(|c| !c.is_empty());
        let artist = overlay(
            correction.and_then(|c| c.artist.as_ref()),
            sample.artist.as_ref(),
        );
        let track = overlay(
            correction.and_then(|c| c.track.as_ref()),
            sample.track.as_ref(),
        );
        let album = overlay(
            correction.and_then(|c| c.album.as_ref()),
            sample.album.as_ref(),
        );

        let (artist, track) = match (artist, track) {
            (Some(artist), Some(track)) => (artist, track),
            (None, None) => return Err(IneligibleReason::MissingArtistAndTrack),
            (None, Some(_)) => return Err(IneligibleReason::MissingArtist),
            (Some(_), None) => return Err(IneligibleReason::MissingTrack),
        };

        if let Some(entry) = self.denylisted(&artist, &track) {
            return Err(IneligibleReason::Denylisted(entry.to_string()));
        }

        Ok(TrackIdentity {
            artist,
            track,
            album,
            duration_secs: sample.duration_secs,
            correction: correction.cloned(),
        })
    }

    fn denylisted(&self, artist: &str, track: &str) -> Option<&str> {
        let artist = artist.to_lowercase();
        let track = track.to_lowercase();
        self.denylist
            .iter()
            .find(|entry| artist.contains(entry.as_str()) || track.contains(entry.as_str()))
            .map(String::as_str)
    }
}
