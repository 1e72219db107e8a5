//! Tagged association decisions.
//!
//! Spatial proximity proposes, re-identification overrides when it is confident, and
//! everything else starts a new identity.

use serde::Serialize;

use crate::reid::SimilarityMatch;
use crate::tracker::tracked_object::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Association {
    /// Nearest object inside the distance gate.
    Spatial { object: ObjectId, distance: f64 },
    /// Identity recovered from the similarity store, live or ended.
    Reid { object: ObjectId, similarity: f64 },
    /// Lost a conflict to a closer detection from another camera but lies within the
    /// gate of the same object. Counts as support without moving it.
    Corroborating { object: ObjectId, distance: f64 },
    NewObject,
}

impl Association {
    pub fn object(&self) -> Option<ObjectId> {
        match *self {
            Self::Spatial { object, .. }
            | Self::Reid { object, .. }
            | Self::Corroborating { object, .. } => Some(object),
            Self::NewObject => None,
        }
    }
}

/// Spatial association is ambiguous unless exactly one object lies inside the gate.
pub fn needs_reid(candidates_in_gate: usize) -> bool {
    candidates_in_gate != 1
}

/// Combine the spatial proposal with the best re-identification result.
///
/// A re-identification result wins when its similarity exceeds `threshold`. Otherwise the
/// spatial proposal stands, and without one the detection starts a new object.
pub fn decide(
    proposal: Option<(ObjectId, f64)>,
    reid: Option<&SimilarityMatch>,
    threshold: f64,
) -> Association {
    if let Some(found) = reid.filter(|m| m.similarity > threshold) {
        return Association::Reid {
            object: ObjectId::from(found.identity),
            similarity: found.similarity,
        };
    }
    match proposal {
        Some((object, distance)) => Association::Spatial { object, distance },
        None => Association::NewObject,
    }
}
