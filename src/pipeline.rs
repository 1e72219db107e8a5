//! Concurrent front end for the fusion engine.
//!
//! Each camera gets a [`CameraFeed`] that validates messages in the caller's thread. All
//! feeds funnel into one fusion worker that owns the engine, so association never races.
//! Fused state leaves through a [`Publisher`] and can be read at any time through
//! [`FusionService::snapshot`].

mod builder;
mod publisher;
mod service;
mod stats;

pub use builder::DetectionBuilder;
pub use publisher::{Outbound, Publisher};
pub use service::{CameraFeed, FusionService};
pub use stats::ServiceStats;
