//! Camera pose: the rigid (optionally scaled) transform from camera space to scene space.

use nalgebra::{
    Matrix3, Matrix4, Point2, Point3, Quaternion, Rotation3, UnitQuaternion, Vector3, Vector4,
};

use super::intrinsics::CameraIntrinsics;
use super::solve::solve_pose;
use crate::error::{FusionError, Result};

/// Pose as supplied by the scene configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum PoseSpec {
    /// Translation, rotation (3 Euler angles `XYZ` in degrees or a quaternion `x y z w`)
    /// and per-axis scale.
    Transform {
        translation: [f64; 3],
        rotation: Vec<f64>,
        scale: [f64; 3],
    },
    /// Camera-to-scene matrix, 3x4 or 4x4, row major.
    Matrix(Vec<Vec<f64>>),
    /// Pixel points paired with the scene points they image.
    Correspondence {
        camera_points: Vec<Point2<f64>>,
        map_points: Vec<Point3<f64>>,
    },
}

/// How a camera's pose was obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoseSource {
    Explicit,
    Matrix,
    /// Solved from correspondences with the given RMS reprojection error in pixels.
    Solved { rms_error: f64 },
    /// Nothing was supplied and the identity transform stands in.
    DefaultIdentity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPose {
    pub pose: CameraPose,
    pub source: PoseSource,
}

impl ResolvedPose {
    /// Resolve an optional pose specification. A missing specification falls back to the
    /// identity pose and is flagged through [`PoseSource::DefaultIdentity`].
    pub fn resolve(spec: Option<&PoseSpec>, intrinsics: &CameraIntrinsics) -> Result<Self> {
        let Some(spec) = spec else {
            return Ok(Self {
                pose: CameraPose::identity(),
                source: PoseSource::DefaultIdentity,
            });
        };
        match spec {
            PoseSpec::Transform {
                translation,
                rotation,
                scale,
            } => Ok(Self {
                pose: CameraPose::from_transform(*translation, rotation, *scale)?,
                source: PoseSource::Explicit,
            }),
            PoseSpec::Matrix(rows) => Ok(Self {
                pose: CameraPose::from_rows(rows)?,
                source: PoseSource::Matrix,
            }),
            PoseSpec::Correspondence {
                camera_points,
                map_points,
            } => {
                let (pose, rms_error) = solve_pose(intrinsics, camera_points, map_points)?;
                Ok(Self {
                    pose,
                    source: PoseSource::Solved { rms_error },
                })
            }
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == PoseSource::DefaultIdentity
    }
}

/// Camera-to-scene transform and its inverse.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    to_scene: Matrix4<f64>,
    to_camera: Matrix4<f64>,
}

impl CameraPose {
    pub fn identity() -> Self {
        Self {
            to_scene: Matrix4::identity(),
            to_camera: Matrix4::identity(),
        }
    }

    pub fn from_transform(
        translation: [f64; 3],
        rotation: &[f64],
        scale: [f64; 3],
    ) -> Result<Self> {
        let rotation = rotation_matrix(rotation)?;
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
        mat.fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&Vector3::from(translation));
        let scale = Vector4::new(scale[0], scale[1], scale[2], 1.0);
        Self::from_matrix(mat * Matrix4::from_diagonal(&scale))
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        if !(rows.len() == 3 || rows.len() == 4) || rows.iter().any(|r| r.len() != 4) {
            return Err(FusionError::geometry("pose matrix must be 3x4 or 4x4"));
        }
        let mut mat = Matrix4::identity();
        for (i, row) in rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                mat[(i, j)] = *value;
            }
        }
        Self::from_matrix(mat)
    }

    pub fn from_matrix(to_scene: Matrix4<f64>) -> Result<Self> {
        if to_scene.iter().any(|v| !v.is_finite()) {
            return Err(FusionError::geometry("pose matrix has non-finite entries"));
        }
        let to_camera = to_scene
            .try_inverse()
            .ok_or_else(|| FusionError::geometry("pose matrix is not invertible"))?;
        Ok(Self {
            to_scene,
            to_camera,
        })
    }

    /// Pose from an extrinsic (scene-to-camera) rotation and translation.
    pub fn from_extrinsic(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Result<Self> {
        let mut to_camera = Matrix4::identity();
        to_camera.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
        to_camera.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
        let to_scene = to_camera
            .try_inverse()
            .ok_or_else(|| FusionError::geometry("extrinsic rotation is singular"))?;
        Ok(Self {
            to_scene,
            to_camera,
        })
    }

    pub fn camera_to_scene(&self, point: &Point3<f64>) -> Point3<f64> {
        self.to_scene.transform_point(point)
    }

    pub fn scene_to_camera(&self, point: &Point3<f64>) -> Point3<f64> {
        self.to_camera.transform_point(point)
    }

    /// Camera centre in scene coordinates.
    pub fn position(&self) -> Point3<f64> {
        Point3::new(
            self.to_scene[(0, 3)],
            self.to_scene[(1, 3)],
            self.to_scene[(2, 3)],
        )
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.to_scene
    }
}

/// Euler `XYZ` (intrinsic, degrees) or quaternion `x y z w` to a rotation matrix.
fn rotation_matrix(rotation: &[f64]) -> Result<Matrix3<f64>> {
    if rotation.iter().any(|v| !v.is_finite()) {
        return Err(FusionError::geometry("rotation has non-finite values"));
    }
    match *rotation {
        [rx, ry, rz] => {
            let r = Rotation3::from_axis_angle(&Vector3::x_axis(), rx.to_radians())
                * Rotation3::from_axis_angle(&Vector3::y_axis(), ry.to_radians())
                * Rotation3::from_axis_angle(&Vector3::z_axis(), rz.to_radians());
            Ok(r.into_inner())
        }
        [x, y, z, w] => {
            let q = Quaternion::new(w, x, y, z);
            if q.norm() == 0.0 {
                return Err(FusionError::geometry("zero quaternion"));
            }
            Ok(UnitQuaternion::from_quaternion(q)
                .to_rotation_matrix()
                .into_inner())
        }
        _ => Err(FusionError::geometry(format!(
            "rotation needs 3 Euler angles or 4 quaternion values, got {}",
            rotation.len()
        ))),
    }
}
