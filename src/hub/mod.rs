//! Central pipeline unit
//!
//! One long-lived pipeline shared by every consumer, a registry of the
//! sources running in it, and the drain-safe teardown that detaches
//! consumers without stopping the pipeline.

pub mod health;
pub mod idle;
pub mod registry;
pub mod shared;
pub mod teardown;

pub use health::{HealthSummary, HubHealth};
pub use registry::{SourceFactory, SourcePolicy};
pub use shared::SharedPipeline;
