//! Builder for creating `Detection` objects from various box formats.

use crate::error::{FusionError, Result};
use crate::reid::Embedding;
use crate::tracker::{Detection, DetectionLocation};

/// Builder for creating [`Detection`] objects from the box conventions detectors use.
#[derive(Debug, Clone, Default)]
pub struct DetectionBuilder {
    class: String,
    location: Option<DetectionLocation>,
    track_id: Option<String>,
    confidence: Option<f64>,
    embedding: Option<Embedding>,
}

impl DetectionBuilder {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Self::default()
        }
    }

    /// Set bounding box in TLBR format (x1, y1, x2, y2).
    pub fn tlbr(mut self, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        self.location = Some(DetectionLocation::BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        });
        self
    }

    /// Set bounding box in XYWH format (center_x, center_y, width, height).
    pub fn xywh(mut self, cx: f64, cy: f64, w: f64, h: f64) -> Self {
        self.location = Some(DetectionLocation::BoundingBox {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            width: w,
            height: h,
        });
        self
    }

    /// Set bounding box in TLWH format (left, top, width, height).
    pub fn tlwh(mut self, left: f64, top: f64, w: f64, h: f64) -> Self {
        self.location = Some(DetectionLocation::BoundingBox {
            x: left,
            y: top,
            width: w,
            height: h,
        });
        self
    }

    /// Ground contact pixel.
    pub fn center(mut self, x: f64, y: f64) -> Self {
        self.location = Some(DetectionLocation::Point { x, y });
        self
    }

    /// Metric position in the camera frame.
    pub fn camera_point(mut self, x: f64, y: f64, z: f64) -> Self {
        self.location = Some(DetectionLocation::CameraPoint([x, y, z]));
        self
    }

    pub fn track_id(mut self, track_id: impl Into<String>) -> Self {
        self.track_id = Some(track_id.into());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Fails when no location was set or the box is inverted.
    pub fn build(self) -> Result<Detection> {
        let location = self
            .location
            .ok_or_else(|| FusionError::validation("location", "no location set"))?;
        if let DetectionLocation::BoundingBox { width, height, .. } = location {
            if width < 0.0 || height < 0.0 {
                return Err(FusionError::validation("bounding_box_px", "negative size"));
            }
        }
        Ok(Detection {
            class: self.class,
            track_id: self.track_id,
            location,
            confidence: self.confidence,
            embedding: self.embedding,
        })
    }
}
