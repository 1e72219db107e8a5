//! Camera geometry: intrinsics, pose, and projection between pixel space and the
//! shared scene frame.
//!
//! Camera space follows the pinhole convention (x right, y down, z forward). The scene
//! frame is metric with the ground plane at `z = 0`. Everything in this module is pure
//! and can be shared read-only across camera streams.

mod camera;
mod intrinsics;
mod polygon;
mod pose;
mod solve;

pub use camera::{Camera, ground_origin, project_to_camera, project_to_scene};
pub use intrinsics::{CameraIntrinsics, Distortion, IntrinsicsSpec};
pub use polygon::{Polygon, Segment};
pub use pose::{CameraPose, PoseSource, PoseSpec, ResolvedPose};
pub use solve::{MIN_COPLANAR_POINTS, MIN_GENERAL_POINTS, solve_pose};

/// Point in the shared scene frame.
pub type ScenePoint = nalgebra::Point3<f64>;

/// Point in image pixel coordinates.
pub type PixelPoint = nalgebra::Point2<f64>;
