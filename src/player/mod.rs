//! Media players
//!
//! A [`PlaybackBackend`] plays either a URI or a capture [`MediaStream`]
//! attached through the shared pipeline, and reports to a
//! [`MediaPlayerClient`].
//!
//! [`MediaStream`]: crate::capture::MediaStream

pub mod backend;
pub mod client;
pub mod state;
pub mod stream;
pub mod uri;

pub use backend::{BackendKind, MediaResource, PlaybackBackend};
pub use client::{ClientEvent, MediaPlayerClient, NetworkState, ReadyState, RecordingClient};
pub use state::{PlayerState, StateReconciler};
