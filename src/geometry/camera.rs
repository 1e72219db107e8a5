use nalgebra::{Point2, Point3, Vector2, Vector3};

use super::intrinsics::CameraIntrinsics;
use super::pose::{CameraPose, PoseSource, ResolvedPose};
use super::{PixelPoint, ScenePoint};
use crate::error::{FusionError, Result};

const PARALLEL_EPSILON: f64 = 1e-12;

/// A calibrated camera. Immutable once built; replaced wholesale on reconfiguration.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    id: String,
    intrinsics: CameraIntrinsics,
    pose: CameraPose,
    pose_source: PoseSource,
    max_view_distance: f64,
}

impl Camera {
    pub fn new(
        id: impl Into<String>,
        intrinsics: CameraIntrinsics,
        pose: ResolvedPose,
        max_view_distance: f64,
    ) -> Result<Self> {
        if !(max_view_distance.is_finite() && max_view_distance > 0.0) {
            return Err(FusionError::geometry("max view distance must be positive"));
        }
        Ok(Self {
            id: id.into(),
            intrinsics,
            pose: pose.pose,
            pose_source: pose.source,
            max_view_distance,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn pose(&self) -> &CameraPose {
        &self.pose
    }

    pub fn pose_source(&self) -> PoseSource {
        self.pose_source
    }

    pub fn max_view_distance(&self) -> f64 {
        self.max_view_distance
    }

    /// Ray through a pixel as scene-space origin and (unnormalized) direction.
    pub fn pixel_ray(&self, pixel: &PixelPoint) -> Result<(ScenePoint, Vector3<f64>)> {
        pixel_ray(&self.intrinsics, &self.pose, pixel)
    }

    pub fn project_to_scene(&self, pixel: &PixelPoint) -> Result<ScenePoint> {
        self.project_to_plane(pixel, 0.0)
    }

    /// Intersect the ray through `pixel` with the horizontal plane at height `z`.
    pub fn project_to_plane(&self, pixel: &PixelPoint, z: f64) -> Result<ScenePoint> {
        let (origin, dir) = self.pixel_ray(pixel)?;
        intersect_plane(&origin, &dir, z)
    }

    /// Move a metric camera-frame point into the scene.
    pub fn camera_point_to_scene(&self, point: &Point3<f64>) -> ScenePoint {
        self.pose.camera_to_scene(point)
    }

    pub fn project_to_camera(&self, point: &ScenePoint) -> Result<PixelPoint> {
        let cam = self.pose.scene_to_camera(point);
        if cam.z <= 0.0 {
            return Err(FusionError::BehindCamera);
        }
        Ok(self
            .intrinsics
            .denormalize(&Point2::new(cam.x / cam.z, cam.y / cam.z)))
    }

    /// Camera position, optionally moved to height `z`.
    pub fn ground_origin(&self, z: Option<f64>) -> ScenePoint {
        let mut origin = self.pose.position();
        if let Some(z) = z {
            origin.z = z;
        }
        origin
    }

    /// Geometric visibility: in front of the camera, inside the image and within the
    /// max view distance. Dead zones are handled by the scene.
    pub fn sees(&self, point: &ScenePoint) -> bool {
        let origin = self.pose.position();
        let horizontal = Vector2::new(point.x - origin.x, point.y - origin.y).norm();
        if horizontal > self.max_view_distance {
            return false;
        }
        match self.project_to_camera(point) {
            Ok(pixel) => self.intrinsics.contains_pixel(&pixel),
            Err(_) => false,
        }
    }
}

fn pixel_ray(
    intrinsics: &CameraIntrinsics,
    pose: &CameraPose,
    pixel: &PixelPoint,
) -> Result<(ScenePoint, Vector3<f64>)> {
    let n = intrinsics.normalize(pixel)?;
    let origin = pose.camera_to_scene(&Point3::origin());
    let through = pose.camera_to_scene(&Point3::new(n.x, n.y, 1.0));
    Ok((origin, through - origin))
}

fn intersect_plane(origin: &ScenePoint, dir: &Vector3<f64>, z: f64) -> Result<ScenePoint> {
    if dir.z.abs() < PARALLEL_EPSILON {
        return Err(FusionError::NoGroundIntersection);
    }
    let t = (z - origin.z) / dir.z;
    if t <= 0.0 || !t.is_finite() {
        return Err(FusionError::NoGroundIntersection);
    }
    Ok(*origin + *dir * t)
}

pub fn project_to_scene(camera: &Camera, pixel: &PixelPoint) -> Result<ScenePoint> {
    camera.project_to_scene(pixel)
}

pub fn project_to_camera(camera: &Camera, point: &ScenePoint) -> Result<PixelPoint> {
    camera.project_to_camera(point)
}

pub fn ground_origin(camera: &Camera, z: Option<f64>) -> ScenePoint {
    camera.ground_origin(z)
}
