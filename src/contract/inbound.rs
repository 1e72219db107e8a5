//! Inbound detection message.
//!
//! ```json
//! {
//!   "id": "camera1",
//!   "timestamp": "2024-05-01T12:00:00.250Z",
//!   "frame_rate": 15,
//!   "objects": {
//!     "person": [
//!       {"id": "7", "bounding_box_px": {"x": 10, "y": 20, "width": 40, "height": 90},
//!        "confidence": 0.93, "reid": "<base64 f32 LE>"}
//!     ]
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{FusionError, Result};
use crate::reid::{Embedding, decode_embedding};
use crate::tracker::{Detection, DetectionBatch, DetectionLocation};

/// An object dropped from an otherwise valid message.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRejection {
    /// Location of the problem, e.g. `objects.person[2].confidence`.
    pub path: String,
    pub reason: String,
}

impl ItemRejection {
    fn from_error(error: FusionError, item_path: &str) -> Self {
        match error {
            FusionError::ValidationFailure { path, reason } => Self { path, reason },
            other => Self {
                path: item_path.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// A validated detection message.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionMessage {
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub frame_rate: Option<f64>,
    /// Valid objects in message order, classes sorted by name.
    pub detections: Vec<Detection>,
    pub rejected: Vec<ItemRejection>,
}

impl DetectionMessage {
    /// Validate an already parsed JSON value. `expected_dims` fixes the length every
    /// re-identification vector must have.
    pub fn from_value(value: &Value, expected_dims: Option<usize>) -> Result<Self> {
        let message = value
            .as_object()
            .ok_or_else(|| FusionError::validation("$", "message must be an object"))?;

        let camera_id = match message.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => return Err(FusionError::validation("id", "must be a non-empty string")),
            None => return Err(FusionError::validation("id", "missing")),
        };
        let timestamp = match message.get("timestamp") {
            Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
                .map_err(|e| FusionError::validation("timestamp", format!("not RFC 3339: {e}")))?
                .with_timezone(&Utc),
            Some(_) => return Err(FusionError::validation("timestamp", "must be a string")),
            None => return Err(FusionError::validation("timestamp", "missing")),
        };
        let frame_rate = match message.get("frame_rate") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_f64() {
                Some(rate) if rate.is_finite() && rate > 0.0 => Some(rate),
                _ => {
                    return Err(FusionError::validation(
                        "frame_rate",
                        "must be a positive number",
                    ));
                }
            },
        };
        let objects = match message.get("objects") {
            Some(Value::Object(objects)) => objects,
            Some(_) => {
                return Err(FusionError::validation(
                    "objects",
                    "must be an object keyed by class",
                ));
            }
            None => return Err(FusionError::validation("objects", "missing")),
        };

        let mut detections = Vec::new();
        let mut rejected = Vec::new();
        for (class, items) in objects {
            let class_path = format!("objects.{class}");
            let items = match items.as_array() {
                Some(items) if !class.is_empty() => items,
                Some(_) => {
                    rejected.push(ItemRejection {
                        path: class_path,
                        reason: "class name is empty".to_string(),
                    });
                    continue;
                }
                None => {
                    rejected.push(ItemRejection {
                        path: class_path,
                        reason: "must be an array".to_string(),
                    });
                    continue;
                }
            };
            for (i, item) in items.iter().enumerate() {
                let path = format!("{class_path}[{i}]");
                match parse_item(class, item, &path, expected_dims) {
                    Ok(detection) => detections.push(detection),
                    Err(e) => rejected.push(ItemRejection::from_error(e, &path)),
                }
            }
        }

        for rejection in &rejected {
            tracing::warn!(
                camera_id = %camera_id,
                path = %rejection.path,
                reason = %rejection.reason,
                "detection item rejected"
            );
        }

        Ok(Self {
            camera_id,
            timestamp,
            frame_rate,
            detections,
            rejected,
        })
    }

    pub fn into_batch(self) -> DetectionBatch {
        DetectionBatch {
            camera_id: self.camera_id,
            timestamp: self.timestamp,
            frame_rate: self.frame_rate,
            detections: self.detections,
        }
    }
}

/// Parse and validate a raw detection message.
pub fn parse_detection_message(json: &str, expected_dims: Option<usize>) -> Result<DetectionMessage> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| FusionError::validation("$", format!("not valid JSON: {e}")))?;
    DetectionMessage::from_value(&value, expected_dims)
}

fn parse_item(
    class: &str,
    item: &Value,
    path: &str,
    expected_dims: Option<usize>,
) -> Result<Detection> {
    let item = item
        .as_object()
        .ok_or_else(|| FusionError::validation(path, "must be an object"))?;

    let mut detection = Detection::new(class, parse_location(item, path)?);
    detection.track_id = match item.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        Some(_) => {
            return Err(FusionError::validation(
                format!("{path}.id"),
                "must be a string or number",
            ));
        }
    };
    if let Some(value) = item.get("confidence").filter(|v| !v.is_null()) {
        let path = format!("{path}.confidence");
        let confidence = number(value, &path)?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(FusionError::validation(path, "must be within [0, 1]"));
        }
        detection.confidence = Some(confidence);
    }
    if let Some(value) = item.get("reid").filter(|v| !v.is_null()) {
        let path = format!("{path}.reid");
        detection.embedding = Some(parse_embedding(value, &path, expected_dims)?);
    }
    Ok(detection)
}

/// A metric `translation` wins over pixel locations; a box wins over a centre point.
fn parse_location(item: &Map<String, Value>, path: &str) -> Result<DetectionLocation> {
    if let Some(value) = item.get("translation") {
        let path = format!("{path}.translation");
        let coords = value
            .as_array()
            .filter(|coords| coords.len() == 3)
            .ok_or_else(|| FusionError::validation(&path, "must be an array of 3 numbers"))?;
        let mut xyz = [0.0; 3];
        for (slot, value) in xyz.iter_mut().zip(coords) {
            *slot = number(value, &path)?;
        }
        return Ok(DetectionLocation::CameraPoint(xyz));
    }

    if let Some(value) = item.get("bounding_box_px") {
        let path = format!("{path}.bounding_box_px");
        let bbox = value
            .as_object()
            .ok_or_else(|| FusionError::validation(&path, "must be an object"))?;
        let width = member(bbox, "width", &path)?;
        let height = member(bbox, "height", &path)?;
        if width < 0.0 || height < 0.0 {
            return Err(FusionError::validation(path, "negative size"));
        }
        return Ok(DetectionLocation::BoundingBox {
            x: member(bbox, "x", &path)?,
            y: member(bbox, "y", &path)?,
            width,
            height,
        });
    }

    if let Some(value) = item.get("center_px") {
        let path = format!("{path}.center_px");
        let center = value
            .as_object()
            .ok_or_else(|| FusionError::validation(&path, "must be an object"))?;
        return Ok(DetectionLocation::Point {
            x: member(center, "x", &path)?,
            y: member(center, "y", &path)?,
        });
    }

    Err(FusionError::validation(
        path,
        "no location, expected translation, bounding_box_px or center_px",
    ))
}

fn parse_embedding(value: &Value, path: &str, expected_dims: Option<usize>) -> Result<Embedding> {
    let embedding = match value {
        Value::String(encoded) => decode_embedding(encoded).map_err(|e| match e {
            FusionError::ValidationFailure { reason, .. } => FusionError::validation(path, reason),
            other => other,
        })?,
        Value::Array(values) => values
            .iter()
            .map(|v| number(v, path).map(|x| x as f32))
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(FusionError::validation(
                path,
                "must be base64 text or an array of numbers",
            ));
        }
    };
    if embedding.is_empty() {
        return Err(FusionError::validation(path, "empty vector"));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(FusionError::validation(path, "non-finite component"));
    }
    match expected_dims {
        Some(dims) if embedding.len() != dims => Err(FusionError::validation(
            path,
            format!("expected {dims} dimensions, got {}", embedding.len()),
        )),
        _ => Ok(embedding),
    }
}

fn member(object: &Map<String, Value>, key: &str, path: &str) -> Result<f64> {
    let path = format!("{path}.{key}");
    let value = object
        .get(key)
        .ok_or_else(|| FusionError::validation(&path, "missing"))?;
    number(value, &path)
}

fn number(value: &Value, path: &str) -> Result<f64> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| FusionError::validation(path, "must be a finite number"))
}
