// Scrobbler module
// Contains implementations for various scrobbling services

pub mod lastfm;
pub mod listenbrainz;
pub mod traits;

pub use traits::{ScrobbleService, Track};
