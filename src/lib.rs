// Tab scrobbler
// Per-tab now playing tracking with submission to several scrobbling services

pub mod bindings;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod machine;
pub mod registry;
pub mod sample;
pub mod scrobbler;
pub mod text_cleanup;
pub mod tracker;

pub use bindings::{BackendBinding, BindingChange, BindingRegistry};
pub use config::Config;
pub use dispatcher::{AggregateResult, SubmissionDispatcher, SubmissionOutcome, SubmissionReport};
pub use identity::{Correction, IdentityResolver, TrackIdentity};
pub use machine::{Item, LifecycleEvent, PlaybackState, PlaybackStateMachine};
pub use registry::{ChannelListener, LifecycleListener, MachineHandle, TabId, TabRegistry};
pub use sample::{Connector, MediaType, PlaybackSample, Sampler};
pub use tracker::{Tracker, TrackerHandle};
