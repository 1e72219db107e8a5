//! Per-camera observations handed to the fusion engine.

use chrono::{DateTime, Utc};
use nalgebra::{Point2, Point3};

use crate::error::{FusionError, Result};
use crate::geometry::{Camera, ScenePoint};
use crate::reid::Embedding;

/// Where in the camera a detection lies.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionLocation {
    /// Pixel bounding box, top-left corner plus size. The object stands on the
    /// bottom-centre of the box.
    BoundingBox {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    /// Pixel point on the ground.
    Point { x: f64, y: f64 },
    /// Metric position in the camera frame, from a 3D-capable sensor.
    CameraPoint([f64; 3]),
}

/// One camera's observation of one object in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: String,
    /// Sensor-local track id, if the sensor tracks.
    pub track_id: Option<String>,
    pub location: DetectionLocation,
    pub confidence: Option<f64>,
    pub embedding: Option<Embedding>,
}

impl Detection {
    pub fn new(class: impl Into<String>, location: DetectionLocation) -> Self {
        Self {
            class: class.into(),
            track_id: None,
            location,
            confidence: None,
            embedding: None,
        }
    }

    /// Pixel the object touches the ground at, if the location is in pixels.
    pub fn foot_pixel(&self) -> Option<Point2<f64>> {
        match self.location {
            DetectionLocation::BoundingBox {
                x,
                y,
                width,
                height,
            } => Some(Point2::new(x + width / 2.0, y + height)),
            DetectionLocation::Point { x, y } => Some(Point2::new(x, y)),
            DetectionLocation::CameraPoint(_) => None,
        }
    }

    /// Scene position of the detection as seen by `camera`.
    pub fn project(&self, camera: &Camera) -> Result<ScenePoint> {
        let point = match self.location {
            DetectionLocation::CameraPoint([x, y, z]) => {
                camera.camera_point_to_scene(&Point3::new(x, y, z))
            }
            _ => {
                let pixel = self
                    .foot_pixel()
                    .ok_or_else(|| FusionError::geometry("detection has no pixel location"))?;
                camera.project_to_scene(&pixel)?
            }
        };
        if !(point.x.is_finite() && point.y.is_finite() && point.z.is_finite()) {
            return Err(FusionError::NoGroundIntersection);
        }
        Ok(point)
    }
}

/// All detections one camera produced for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    /// Frames per second the camera reported, if any.
    pub frame_rate: Option<f64>,
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn new(camera_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            camera_id: camera_id.into(),
            timestamp,
            frame_rate: None,
            detections: Vec::new(),
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_detection(mut self, detection: Detection) -> Self {
        self.detections.push(detection);
        self
    }
}
