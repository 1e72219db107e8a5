//! Multi-camera scene fusion.
//!
//! Per-camera detections are projected into a shared metric scene frame, associated with
//! the objects already being tracked (spatially, and by appearance through a
//! re-identification store when that is ambiguous), and published as one scene-wide
//! object set.
//!
//! [`FusionEngine`] is the synchronous core. [`FusionService`] wraps it with per-camera
//! feeds and a single fusion worker.

pub mod config;
pub mod contract;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod reid;
pub mod scene;
pub mod tracker;

pub use config::FusionConfig;
pub use contract::{DetectionMessage, EventMessage, ItemRejection, SceneUpdateMessage};
pub use error::{FusionError, Result};
pub use geometry::{Camera, ScenePoint};
pub use pipeline::{CameraFeed, DetectionBuilder, FusionService, Publisher, ServiceStats};
pub use reid::{MemoryStore, ReidGate, ReidStore};
pub use scene::{SceneConfig, SceneSnapshot, SceneState, SnapshotHandle};
pub use tracker::{
    Association, CycleReport, Detection, DetectionBatch, DetectionLocation, FusionEngine,
    FusionEvent, ObjectId, TrackState, TrackedObject,
};
