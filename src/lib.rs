//! Shared media pipeline hub and playback state machine
//!
//! A single long-running pipeline ([`hub::SharedPipeline`]) hosts capture
//! sources that any number of players attach to and detach from without
//! stopping it. Players ([`player::PlaybackBackend`]) turn graph state and bus
//! notifications into ready/network state for their client.

pub mod capture;
pub mod config;
pub mod error;
pub mod graph;
pub mod hub;
pub mod player;
pub mod utils;
