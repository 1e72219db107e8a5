//! Outbound fused-state and event messages.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{FusionError, Result};
use crate::scene::SceneState;
use crate::tracker::{FusionEvent, ObjectId, TrackState, TrackedObject};

/// One fused object as consumers see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneObject {
    pub id: ObjectId,
    #[serde(rename = "type")]
    pub class: String,
    pub translation: [f64; 3],
    pub velocity: [f64; 3],
    pub visibility: Vec<String>,
    pub first_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
}

impl From<&TrackedObject> for SceneObject {
    fn from(object: &TrackedObject) -> Self {
        let [vx, vy] = object.velocity();
        Self {
            id: object.id,
            class: object.class.clone(),
            translation: [object.position.x, object.position.y, object.position.z],
            velocity: [vx, vy, 0.0],
            visibility: object.visibility.keys().cloned().collect(),
            first_seen: object.first_seen,
            similarity: object.similarity,
            regions: object.regions.keys().cloned().collect(),
        }
    }
}

/// Scene-wide fused state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneUpdateMessage {
    /// Scene uid.
    pub id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub objects: Vec<SceneObject>,
}

impl SceneUpdateMessage {
    /// Build from a published state. Only objects some camera currently sees are listed;
    /// stale ones reappear once seen again or are ended by expiry.
    pub fn from_state(state: &SceneState) -> Result<Self> {
        let timestamp = state
            .timestamp
            .ok_or_else(|| FusionError::validation("timestamp", "scene state was never published"))?;
        Ok(Self {
            id: state.snapshot.uid.clone(),
            name: state.snapshot.name.clone(),
            timestamp,
            objects: state
                .objects
                .iter()
                .filter(|o| o.state == TrackState::Active)
                .map(SceneObject::from)
                .collect(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FusionError::validation("id", "empty scene id"));
        }
        for (i, object) in self.objects.iter().enumerate() {
            let path = format!("objects[{i}]");
            if object.id.as_uuid().is_nil() {
                return Err(FusionError::validation(format!("{path}.id"), "nil object id"));
            }
            if object.class.is_empty() {
                return Err(FusionError::validation(format!("{path}.type"), "empty class"));
            }
            if !object.translation.iter().all(|v| v.is_finite()) {
                return Err(FusionError::validation(
                    format!("{path}.translation"),
                    "non-finite coordinate",
                ));
            }
            if !object.velocity.iter().all(|v| v.is_finite()) {
                return Err(FusionError::validation(
                    format!("{path}.velocity"),
                    "non-finite component",
                ));
            }
            if object.visibility.is_empty() {
                return Err(FusionError::validation(
                    format!("{path}.visibility"),
                    "object is not visible to any camera",
                ));
            }
            if object.similarity.is_some_and(|s| !s.is_finite()) {
                return Err(FusionError::validation(
                    format!("{path}.similarity"),
                    "non-finite similarity",
                ));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A region or tripwire event of one scene.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMessage {
    pub scene: String,
    #[serde(flatten)]
    pub event: FusionEvent,
}

impl EventMessage {
    pub fn new(scene: impl Into<String>, event: FusionEvent) -> Self {
        Self {
            scene: scene.into(),
            event,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scene.is_empty() {
            return Err(FusionError::validation("scene", "empty scene id"));
        }
        if self.event.source().is_empty() {
            return Err(FusionError::validation("source", "empty region or tripwire uid"));
        }
        match &self.event {
            FusionEvent::RegionEntered { class, .. } | FusionEvent::TripwireCrossed { class, .. }
                if class.is_empty() =>
            {
                Err(FusionError::validation("class", "empty class"))
            }
            FusionEvent::RegionExited { class, dwell, .. } => {
                if class.is_empty() {
                    Err(FusionError::validation("class", "empty class"))
                } else if !(dwell.is_finite() && *dwell >= 0.0) {
                    Err(FusionError::validation("dwell", "must be a non-negative number"))
                } else {
                    Ok(())
                }
            }
            FusionEvent::TripwireCrossed { direction, .. } if direction.abs() != 1 => {
                Err(FusionError::validation("direction", "must be 1 or -1"))
            }
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{IntrinsicsSpec, ScenePoint};
    use crate::scene::{CameraConfig, SceneConfig, SceneSnapshot};
    use crate::tracker::KalmanFilter;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn state(objects: Vec<TrackedObject>) -> SceneState {
        let config = SceneConfig {
            uid: "scene-1".into(),
            name: "Lobby".into(),
            cameras: vec![CameraConfig {
                id: "top".into(),
                resolution: Some([640, 480]),
                intrinsics: Some(IntrinsicsSpec::Diagonal { fov: 90.0 }),
                translation: Some([0.0, 0.0, 10.0]),
                rotation: Some(vec![180.0, 0.0, 0.0]),
                ..CameraConfig::default()
            }],
            regions: vec![],
            tripwires: vec![],
        };
        SceneState {
            snapshot: Arc::new(SceneSnapshot::build(&config, 100.0).unwrap()),
            objects,
            timestamp: Some(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    fn visible_object() -> TrackedObject {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let mut object = TrackedObject::new(
            "person",
            ScenePoint::new(1.0, 2.0, 0.0),
            "top",
            now,
            &KalmanFilter::new(),
        );
        object.set_visibility(BTreeSet::from(["top".to_string()]), now);
        object
    }

    #[test]
    fn test_scene_update_json_shape() {
        let object = visible_object();
        let id = object.id;
        let message = SceneUpdateMessage::from_state(&state(vec![object])).unwrap();
        message.validate().unwrap();

        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["id"], "scene-1");
        assert_eq!(json["name"], "Lobby");
        let first = &json["objects"][0];
        assert_eq!(first["id"], id.to_string());
        assert_eq!(first["type"], "person");
        assert_eq!(first["translation"][1], 2.0);
        assert_eq!(first["visibility"][0], "top");
        assert!(first.get("similarity").is_none());
        assert!(first.get("regions").is_none());
    }

    #[test]
    fn test_stale_objects_are_left_out() {
        let mut hidden = visible_object();
        hidden.set_visibility(BTreeSet::new(), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(hidden.state, TrackState::Stale);
        let message = SceneUpdateMessage::from_state(&state(vec![hidden])).unwrap();
        assert!(message.objects.is_empty());
    }

    #[test]
    fn test_validation_catches_bad_objects() {
        let mut message = SceneUpdateMessage::from_state(&state(vec![visible_object()])).unwrap();
        message.objects[0].translation[0] = f64::NAN;
        assert!(matches!(
            message.validate(),
            Err(FusionError::ValidationFailure { path, .. }) if path == "objects[0].translation"
        ));

        message.objects[0].translation[0] = 0.0;
        message.objects[0].visibility.clear();
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_event_message() {
        let event = FusionEvent::RegionExited {
            region: "queue".into(),
            object: ObjectId::new(),
            class: "person".into(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            dwell: 4.5,
        };
        let message = EventMessage::new("scene-1", event);
        message.validate().unwrap();
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "region_exited");
        assert_eq!(json["scene"], "scene-1");
        assert_eq!(json["dwell"], 4.5);

        let crossing = EventMessage::new(
            "scene-1",
            FusionEvent::TripwireCrossed {
                tripwire: "door".into(),
                object: ObjectId::new(),
                class: "person".into(),
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
                direction: 0,
            },
        );
        assert!(crossing.validate().is_err());
    }
}
