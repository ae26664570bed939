// Playback state machine
// One instance per tab: turns samples into lifecycle events and decides when an item is submittable

use crate::config::TrackingConfig;
use crate::dispatcher::{AggregateResult, SubmissionOutcome, SubmissionReport};
use crate::error::IneligibleReason;
use crate::identity::{Correction, IdentityKey, IdentityResolver, TrackIdentity};
use crate::sample::PlaybackSample;
use crate::scrobbler::Track;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tokio::time::Instant;

/// One logical playback of a track, from first detection to reset
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    /// Tab-scoped, increases with every new item
    pub seq: u64,
    identity: TrackIdentity,
    /// Reported duration, or the configured default
    pub duration_secs: u64,
    pub listened_secs: f64,
    pub loved: bool,
    pub is_replaying: bool,
    /// Skipped by the user earlier in this session; never submitted
    pub excluded: bool,
    /// Start of the current listen, sent as the scrobble timestamp
    pub started_at: DateTime<Utc>,
    pub outcomes: BTreeMap<String, SubmissionOutcome>,
}

impl Item {
    pub fn new(seq: u64, identity: TrackIdentity, duration_secs: u64) -> Self {
        Self {
            seq,
            identity,
            duration_secs,
            listened_secs: 0.0,
            loved: false,
            is_replaying: false,
            excluded: false,
            started_at: Utc::now(),
            outcomes: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &TrackIdentity {
        &self.identity
    }

    pub fn to_track(&self) -> Track {
        Track {
            title: self.identity.track.clone(),
            artist: self.identity.artist.clone(),
            album: self.identity.album.clone(),
            duration: Some(self.duration_secs),
        }
    }

    /// Same item and same listen (a replay starts a new listen)
    fn same_listen(&self, other: &Item) -> bool {
        self.seq == other.seq && self.started_at == other.started_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    NowPlaying,
    Unrecognized,
    Submittable,
    Submitted,
}

/// Events published to listeners, in emission order per tab
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Reset {
        item: Option<Item>,
    },
    NowPlaying {
        item: Item,
    },
    Unrecognized {
        sample: PlaybackSample,
        reason: IneligibleReason,
    },
    Submitted {
        item: Item,
        result: AggregateResult,
    },
}

/// Work the machine hands to the submission dispatcher
#[derive(Debug, Clone)]
pub enum DispatchRequest {
    Submit(Item),
    UpdateLove { item: Item, loved: bool },
    NowPlaying(Item),
}

/// Everything one input produced
#[derive(Debug, Default)]
pub struct Transition {
    pub events: Vec<LifecycleEvent>,
    pub requests: Vec<DispatchRequest>,
}

type RawKey = (Option<String>, Option<String>);

pub struct PlaybackStateMachine {
    config: TrackingConfig,
    state: PlaybackState,
    current: Option<Item>,
    next_seq: u64,
    last_sample: Option<PlaybackSample>,
    last_sample_at: Option<Instant>,
    /// User correction, bound to the raw artist/track it was made for
    correction: Option<(RawKey, Correction)>,
    skipped: HashSet<IdentityKey>,
    active: bool,
}

impl PlaybackStateMachine {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            state: PlaybackState::Idle,
            current: None,
            next_seq: 0,
            last_sample: None,
            last_sample_at: None,
            correction: None,
            skipped: HashSet::new(),
            active: true,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_item(&self) -> Option<&Item> {
        self.current.as_ref()
    }

    /// Whether this tab is the one the user activated last
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn on_sample(
        &mut self,
        resolver: &IdentityResolver,
        sample: PlaybackSample,
        now: Instant,
    ) -> Transition {
        let mut out = Transition::default();
        let raw_key = sample.raw_key();

        if self.correction.as_ref().is_some_and(|(key, _)| *key != raw_key) {
            log::debug!("Raw track changed, dropping user correction");
            self.correction = None;
        }

        let correction = self.correction.as_ref().map(|(_, c)| c);
        match resolver.resolve(&sample, correction) {
            Ok(identity) => {
                let continues = self
                    .current
                    .as_ref()
                    .is_some_and(|item| *item.identity() == identity);

                if continues {
                    self.continue_item(&sample, now, &mut out);
                } else {
                    self.reset(&mut out);
                    if sample.is_playing {
                        self.start_item(identity, &sample, &mut out);
                    }
                }
            }
            Err(reason) if reason.is_correctable() => {
                let already_reported = self.state == PlaybackState::Unrecognized
                    && self
                        .last_sample
                        .as_ref()
                        .is_some_and(|last| last.raw_key() == raw_key);

                if !already_reported {
                    self.reset(&mut out);
                    if sample.is_playing {
                        log::info!("Unrecognized track: {}", reason);
                        self.state = PlaybackState::Unrecognized;
                        out.events.push(LifecycleEvent::Unrecognized {
                            sample: sample.clone(),
                            reason,
                        });
                    }
                }
            }
            Err(reason) => {
                log::debug!("Ignoring ineligible sample: {}", reason);
                self.reset(&mut out);
            }
        }

        self.last_sample = Some(sample);
        self.last_sample_at = Some(now);
        out
    }

    /// Overlay user-supplied fields on what is playing
    pub fn correct(&mut self, resolver: &IdentityResolver, correction: Correction) -> Transition {
        let mut out = Transition::default();

        if correction.is_empty() || self.state == PlaybackState::Idle {
            log::debug!("Nothing to correct");
            return out;
        }
        let Some(sample) = self.last_sample.clone() else {
            return out;
        };

        let raw_key = sample.raw_key();
        let merged = match &self.correction {
            Some((key, existing)) if *key == raw_key => existing.merged(&correction),
            _ => Correction::default().merged(&correction),
        };
        let resolved = resolver.resolve(&sample, Some(&merged));
        self.correction = Some((raw_key, merged));

        match resolved {
            Ok(identity) => {
                let unchanged = self
                    .current
                    .as_ref()
                    .is_some_and(|item| item.identity().same_fields(&identity));
                if unchanged {
                    return out;
                }

                // Unrecognized has no item to reset
                if self.state == PlaybackState::Unrecognized {
                    self.state = PlaybackState::Idle;
                } else {
                    self.reset(&mut out);
                }
                self.start_item(identity, &sample, &mut out);
            }
            Err(reason) => {
                log::warn!("Correction does not make the track trackable: {}", reason);
            }
        }

        out
    }

    pub fn toggle_love(&mut self, loved: bool) -> Transition {
        let mut out = Transition::default();
        let Some(item) = self.current.as_mut() else {
            log::debug!("Love toggle without a current item");
            return out;
        };

        // A page-reported love may already match; the services still need the user's toggle
        let changed = item.loved != loved;
        item.loved = loved;

        if self.state == PlaybackState::Submitted {
            out.requests.push(DispatchRequest::UpdateLove {
                item: item.clone(),
                loved,
            });
        } else if !changed {
            log::debug!("Love already {} for the current item", loved);
        }
        out
    }

    /// Drop the current item; it will not be submitted if it shows up again this session
    pub fn skip(&mut self) -> Transition {
        let mut out = Transition::default();
        if let Some(item) = &self.current {
            log::info!("Skipped {} - {}", item.identity().artist, item.identity().track);
            self.skipped.insert(item.identity().key());
        }
        self.reset(&mut out);
        out
    }

    /// The dispatcher took the submission of `item`; `pending` lists the bindings contacted
    pub fn dispatch_accepted(&mut self, item: &Item, pending: impl IntoIterator<Item = String>) {
        if let Some(current) = self.current.as_mut() {
            if current.same_listen(item) && self.state == PlaybackState::Submittable {
                current.outcomes = pending
                    .into_iter()
                    .map(|id| (id, SubmissionOutcome::Pending))
                    .collect();
                self.state = PlaybackState::Submitted;
            }
        }
    }

    /// Record the outcome of a finished submission and build its `Submitted` event
    pub fn record_submission(&mut self, submitted: Item, report: &SubmissionReport) -> LifecycleEvent {
        let item = match self.current.as_mut() {
            Some(current) if current.same_listen(&submitted) => {
                current.outcomes = report.outcomes.clone();
                current.clone()
            }
            _ => Item {
                outcomes: report.outcomes.clone(),
                ..submitted
            },
        };

        LifecycleEvent::Submitted {
            item,
            result: report.aggregate,
        }
    }

    /// Called before the machine is dropped
    pub fn teardown(&mut self) -> Option<LifecycleEvent> {
        let mut out = Transition::default();
        if self.current.is_some() {
            self.reset(&mut out);
        }
        self.state = PlaybackState::Idle;
        out.events.pop()
    }

    fn counts_time(&self) -> bool {
        !self.config.count_only_active_tab || self.active
    }

    fn continue_item(&mut self, sample: &PlaybackSample, now: Instant, out: &mut Transition) {
        let counting = self.counts_time();
        let max_step = self.config.max_accrual_step_secs as f64;
        let replay_regression = self.config.replay_regression_secs as f64;
        let previous = self.last_sample.as_ref();
        let Some(item) = self.current.as_mut() else {
            return;
        };

        if let Some(loved) = sample.loved {
            item.loved = loved;
        }

        let previous_position = previous.and_then(|s| s.position_secs);
        if let (Some(before), Some(position)) = (previous_position, sample.position_secs) {
            if before - position > replay_regression {
                log::info!(
                    "Replaying {} - {} (position {:.0}s -> {:.0}s)",
                    item.identity().artist,
                    item.identity().track,
                    before,
                    position
                );
                item.listened_secs = 0.0;
                item.is_replaying = true;
                item.started_at = Utc::now();
                item.outcomes.clear();
                self.state = PlaybackState::NowPlaying;
                return;
            }
        }

        let was_playing = previous.is_some_and(|s| s.is_playing);
        if sample.is_playing && was_playing && counting {
            if let Some(last_at) = self.last_sample_at {
                let step = now.saturating_duration_since(last_at).as_secs_f64();
                if step <= max_step {
                    item.listened_secs += step;
                } else {
                    log::debug!("Not crediting a {:.0}s gap between samples", step);
                }
            }
        }

        self.check_threshold(out);
    }

    fn check_threshold(&mut self, out: &mut Transition) {
        if self.state != PlaybackState::NowPlaying {
            return;
        }
        let Some(item) = self.current.as_ref() else {
            return;
        };
        if item.excluded || item.duration_secs < self.config.min_trackable_duration_secs {
            return;
        }

        let threshold = self.config.submission_threshold_secs(item.duration_secs);
        if item.listened_secs >= threshold {
            log::info!(
                "Submittable: {} - {} (played {:.0}s / {}s)",
                item.identity().artist,
                item.identity().track,
                item.listened_secs,
                item.duration_secs
            );
            out.requests.push(DispatchRequest::Submit(item.clone()));
            self.state = PlaybackState::Submittable;
        }
    }

    fn start_item(&mut self, identity: TrackIdentity, sample: &PlaybackSample, out: &mut Transition) {
        self.next_seq += 1;
        let duration = identity
            .duration_secs
            .unwrap_or(self.config.default_duration_secs);

        let mut item = Item::new(self.next_seq, identity, duration);
        item.loved = sample.loved.unwrap_or(false);
        item.excluded = self.skipped.contains(&item.identity().key());

        log::info!(
            "Now playing: {} - {} ({}s)",
            item.identity().artist,
            item.identity().track,
            duration
        );

        self.state = PlaybackState::NowPlaying;
        out.events.push(LifecycleEvent::NowPlaying { item: item.clone() });
        if !item.excluded {
            out.requests.push(DispatchRequest::NowPlaying(item.clone()));
        }
        self.current = Some(item);
    }

    fn reset(&mut self, out: &mut Transition) {
        if self.state == PlaybackState::Idle {
            return;
        }

        let item = self.current.take();
        if let Some(ref item) = item {
            log::info!(
                "Reset: {} - {} after {:.0}s",
                item.identity().artist,
                item.identity().track,
                item.listened_secs
            );
        }
        self.state = PlaybackState::Idle;
        out.events.push(LifecycleEvent::Reset { item });
    }
}
