//! Serialized scene configuration as supplied by the administration side.

use std::path::Path;

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::geometry::{IntrinsicsSpec, PoseSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub tripwires: Vec<TripwireConfig>,
}

impl SceneConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// One camera's calibration. The pose is given by at most one of: translation and
/// rotation, a raw matrix, or point correspondences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intrinsics: Option<IntrinsicsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<[f64; 3]>,
    /// Euler `XYZ` degrees or quaternion `x y z w`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose_matrix: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_points: Option<Vec<[f64; 2]>>,
    /// Scene points, `[x, y]` on the ground or `[x, y, z]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_points: Option<Vec<Vec<f64>>>,
    /// Scene polygons in which this camera does not count as seeing anything.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dead_zones: Vec<Vec<[f64; 2]>>,
}

impl CameraConfig {
    /// Pose specification in precedence order: explicit transform, matrix, point
    /// correspondences. `None` when nothing was supplied.
    pub fn pose_spec(&self) -> Result<Option<PoseSpec>> {
        match (&self.translation, &self.rotation) {
            (Some(translation), Some(rotation)) => {
                return Ok(Some(PoseSpec::Transform {
                    translation: *translation,
                    rotation: rotation.clone(),
                    scale: self.scale.unwrap_or([1.0, 1.0, 1.0]),
                }));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(FusionError::geometry(
                    "translation and rotation must be given together",
                ));
            }
            (None, None) => {}
        }
        if let Some(rows) = &self.pose_matrix {
            return Ok(Some(PoseSpec::Matrix(rows.clone())));
        }
        match (&self.camera_points, &self.map_points) {
            (Some(pixels), Some(points)) => {
                let camera_points = pixels.iter().map(|p| Point2::new(p[0], p[1])).collect();
                let map_points = points
                    .iter()
                    .map(|p| match p.as_slice() {
                        [x, y] => Ok(Point3::new(*x, *y, 0.0)),
                        [x, y, z] => Ok(Point3::new(*x, *y, *z)),
                        _ => Err(FusionError::geometry(format!(
                            "map point needs 2 or 3 coordinates, got {}",
                            p.len()
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(PoseSpec::Correspondence {
                    camera_points,
                    map_points,
                }))
            }
            (None, None) => Ok(None),
            _ => Err(FusionError::geometry(
                "camera_points and map_points must be given together",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub area: AreaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "area", rename_all = "lowercase")]
pub enum AreaConfig {
    Poly { points: Vec<[f64; 2]> },
    Circle { center: [f64; 2], radius: f64 },
    Scene,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripwireConfig {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    pub points: Vec<[f64; 2]>,
}
