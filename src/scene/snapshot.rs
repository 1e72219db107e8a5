//! Immutable, validated scene configuration.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::Point2;

use crate::error::{FusionError, Result};
use crate::geometry::{Camera, CameraIntrinsics, Polygon, ResolvedPose, ScenePoint};

use super::config::{CameraConfig, SceneConfig};
use super::region::{Region, Tripwire};

/// A camera that could not be built, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedCamera {
    pub id: String,
    pub reason: String,
}

/// Cameras, regions and tripwires of one configuration. Never mutated; reconfiguration
/// builds a new snapshot and swaps it in whole.
#[derive(Debug, Clone)]
pub struct SceneSnapshot {
    pub uid: String,
    pub name: String,
    cameras: BTreeMap<String, Camera>,
    dead_zones: HashMap<String, Vec<Polygon>>,
    regions: Vec<Region>,
    tripwires: Vec<Tripwire>,
    rejected: Vec<RejectedCamera>,
}

impl SceneSnapshot {
    /// Validate a configuration.
    ///
    /// A camera with unusable calibration is left out and reported through
    /// [`SceneSnapshot::rejected_cameras`]; the others still load. Fails with
    /// `EmptyConfiguration` when no camera survives.
    pub fn build(config: &SceneConfig, max_view_distance: f64) -> Result<Self> {
        let mut cameras = BTreeMap::new();
        let mut dead_zones = HashMap::new();
        let mut rejected = Vec::new();

        for camera_config in &config.cameras {
            if cameras.contains_key(&camera_config.id) {
                rejected.push(RejectedCamera {
                    id: camera_config.id.clone(),
                    reason: "duplicate camera id".to_string(),
                });
                continue;
            }
            match build_camera(camera_config, max_view_distance) {
                Ok((camera, zones)) => {
                    if !zones.is_empty() {
                        dead_zones.insert(camera_config.id.clone(), zones);
                    }
                    cameras.insert(camera_config.id.clone(), camera);
                }
                Err(e) => {
                    tracing::warn!(
                        scene = %config.uid,
                        camera_id = %camera_config.id,
                        error = %e,
                        "camera excluded from scene"
                    );
                    rejected.push(RejectedCamera {
                        id: camera_config.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if cameras.is_empty() {
            return Err(FusionError::EmptyConfiguration);
        }

        let regions = config
            .regions
            .iter()
            .map(|r| {
                Region::from_config(r)
                    .map_err(|e| FusionError::InvalidConfig(format!("region {}: {e}", r.uid)))
            })
            .collect::<Result<Vec<_>>>()?;
        let tripwires = config
            .tripwires
            .iter()
            .map(|t| {
                Tripwire::from_config(t)
                    .map_err(|e| FusionError::InvalidConfig(format!("tripwire {}: {e}", t.uid)))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            scene = %config.uid,
            cameras = cameras.len(),
            rejected = rejected.len(),
            regions = regions.len(),
            tripwires = tripwires.len(),
            "scene configuration loaded"
        );

        Ok(Self {
            uid: config.uid.clone(),
            name: config.name.clone(),
            cameras,
            dead_zones,
            regions,
            tripwires,
            rejected,
        })
    }

    pub fn camera_by_id(&self, id: &str) -> Result<&Camera> {
        self.cameras
            .get(id)
            .ok_or_else(|| FusionError::NotFound(format!("camera {id}")))
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn tripwires(&self) -> &[Tripwire] {
        &self.tripwires
    }

    pub fn rejected_cameras(&self) -> &[RejectedCamera] {
        &self.rejected
    }

    /// Cameras that geometrically see `point`, whether or not they reported it.
    pub fn compute_visibility(&self, point: &ScenePoint) -> BTreeSet<String> {
        let ground = Point2::new(point.x, point.y);
        self.cameras
            .iter()
            .filter(|(id, camera)| {
                camera.sees(point)
                    && !self
                        .dead_zones
                        .get(*id)
                        .is_some_and(|zones| zones.iter().any(|z| z.contains(&ground)))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn build_camera(config: &CameraConfig, max_view_distance: f64) -> Result<(Camera, Vec<Polygon>)> {
    let spec = config
        .intrinsics
        .as_ref()
        .ok_or_else(|| FusionError::geometry("no intrinsics supplied"))?;
    let intrinsics =
        CameraIntrinsics::new(spec, config.distortion.as_deref(), config.resolution)?;
    let pose = ResolvedPose::resolve(config.pose_spec()?.as_ref(), &intrinsics)?;
    if pose.is_default() {
        tracing::warn!(camera_id = %config.id, "no pose supplied, using identity");
    }
    let zones = config
        .dead_zones
        .iter()
        .map(|zone| Polygon::new(zone.iter().map(|p| Point2::new(p[0], p[1])).collect()))
        .collect::<Result<Vec<_>>>()?;
    let camera = Camera::new(config.id.clone(), intrinsics, pose, max_view_distance)?;
    Ok((camera, zones))
}
