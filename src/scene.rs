//! Scene model: static configuration plus the live tracked-object set.

mod config;
mod model;
mod region;
mod snapshot;

pub use config::{AreaConfig, CameraConfig, RegionConfig, SceneConfig, TripwireConfig};
pub use model::{SceneModel, SceneState, SnapshotHandle};
pub use region::{Area, Region, Tripwire};
pub use snapshot::{RejectedCamera, SceneSnapshot};
