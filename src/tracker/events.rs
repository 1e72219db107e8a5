//! Region occupancy and tripwire events.

use chrono::{DateTime, Utc};
use nalgebra::Point2;
use serde::Serialize;

use crate::scene::SceneSnapshot;
use crate::tracker::tracked_object::{ObjectId, TrackedObject, seconds_between};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FusionEvent {
    RegionEntered {
        region: String,
        object: ObjectId,
        class: String,
        timestamp: DateTime<Utc>,
    },
    RegionExited {
        region: String,
        object: ObjectId,
        class: String,
        timestamp: DateTime<Utc>,
        /// Seconds spent inside.
        dwell: f64,
    },
    TripwireCrossed {
        tripwire: String,
        object: ObjectId,
        class: String,
        timestamp: DateTime<Utc>,
        direction: i8,
    },
}

impl FusionEvent {
    pub fn object(&self) -> ObjectId {
        match self {
            Self::RegionEntered { object, .. }
            | Self::RegionExited { object, .. }
            | Self::TripwireCrossed { object, .. } => *object,
        }
    }

    /// Uid of the region or tripwire.
    pub fn source(&self) -> &str {
        match self {
            Self::RegionEntered { region, .. } | Self::RegionExited { region, .. } => region,
            Self::TripwireCrossed { tripwire, .. } => tripwire,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RegionEntered { timestamp, .. }
            | Self::RegionExited { timestamp, .. }
            | Self::TripwireCrossed { timestamp, .. } => *timestamp,
        }
    }
}

/// Debounced region membership and tripwire crossing detection.
#[derive(Debug, Clone)]
pub struct RegionMonitor {
    debounce: f64,
    min_frames: u32,
}

impl RegionMonitor {
    pub fn new(debounce: f64, min_frames: u32) -> Self {
        Self {
            debounce,
            min_frames,
        }
    }

    /// Compare the object's position against every region and tripwire and commit the
    /// changes that are not within the debounce interval of the previous one.
    pub fn observe(
        &self,
        snapshot: &SceneSnapshot,
        object: &mut TrackedObject,
        now: DateTime<Utc>,
    ) -> Vec<FusionEvent> {
        if object.frame_count <= self.min_frames {
            return Vec::new();
        }
        let mut events = Vec::new();
        let here = Point2::new(object.position.x, object.position.y);

        for region in snapshot.regions() {
            let inside = region.contains(&here);
            let was_inside = object.regions.contains_key(&region.uid);
            if inside == was_inside || !self.may_change(object, &region.uid, now) {
                continue;
            }
            object.region_changes.insert(region.uid.clone(), now);
            if inside {
                object.regions.insert(region.uid.clone(), now);
                events.push(FusionEvent::RegionEntered {
                    region: region.uid.clone(),
                    object: object.id,
                    class: object.class.clone(),
                    timestamp: now,
                });
            } else if let Some(entered) = object.regions.remove(&region.uid) {
                events.push(FusionEvent::RegionExited {
                    region: region.uid.clone(),
                    object: object.id,
                    class: object.class.clone(),
                    timestamp: now,
                    dwell: seconds_between(entered, now),
                });
            }
        }

        let mut recent = object.history.iter().rev();
        if let (Some(to), Some(from)) = (recent.next(), recent.next()) {
            let (from, to) = (Point2::new(from.x, from.y), Point2::new(to.x, to.y));
            for tripwire in snapshot.tripwires() {
                let Some(direction) = tripwire.crossing(&from, &to) else {
                    continue;
                };
                if !self.may_change(object, &tripwire.uid, now) {
                    continue;
                }
                object.region_changes.insert(tripwire.uid.clone(), now);
                events.push(FusionEvent::TripwireCrossed {
                    tripwire: tripwire.uid.clone(),
                    object: object.id,
                    class: object.class.clone(),
                    timestamp: now,
                    direction,
                });
            }
        }
        events
    }

    /// Exit events for every region an ending object was inside.
    pub fn exit_all(&self, object: &TrackedObject, now: DateTime<Utc>) -> Vec<FusionEvent> {
        object
            .regions
            .iter()
            .map(|(region, entered)| FusionEvent::RegionExited {
                region: region.clone(),
                object: object.id,
                class: object.class.clone(),
                timestamp: now,
                dwell: seconds_between(*entered, now),
            })
            .collect()
    }

    fn may_change(&self, object: &TrackedObject, uid: &str, now: DateTime<Utc>) -> bool {
        object
            .region_changes
            .get(uid)
            .is_none_or(|last| seconds_between(*last, now) >= self.debounce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{IntrinsicsSpec, ScenePoint};
    use crate::scene::{AreaConfig, CameraConfig, RegionConfig, SceneConfig, TripwireConfig};
    use crate::tracker::KalmanFilter;
    use crate::tracker::tracked_object::offset_seconds;

    fn at(seconds: f64) -> DateTime<Utc> {
        offset_seconds(DateTime::<Utc>::UNIX_EPOCH, seconds)
    }

    fn snapshot() -> SceneSnapshot {
        let config = SceneConfig {
            uid: "s".into(),
            name: "s".into(),
            cameras: vec![CameraConfig {
                id: "top".into(),
                resolution: Some([640, 480]),
                intrinsics: Some(IntrinsicsSpec::Diagonal { fov: 90.0 }),
                translation: Some([0.0, 0.0, 10.0]),
                rotation: Some(vec![180.0, 0.0, 0.0]),
                ..CameraConfig::default()
            }],
            regions: vec![RegionConfig {
                uid: "zone".into(),
                name: "zone".into(),
                area: AreaConfig::Poly {
                    points: vec![[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]],
                },
            }],
            tripwires: vec![TripwireConfig {
                uid: "wire".into(),
                name: "wire".into(),
                points: vec![[-2.0, -10.0], [-2.0, 10.0]],
            }],
        };
        SceneSnapshot::build(&config, 100.0).unwrap()
    }

    /// Walk an object along `xs` (y = 2) one step per 0.2 s, collecting events.
    fn walk(monitor: &RegionMonitor, xs: &[f64]) -> Vec<FusionEvent> {
        let kf = KalmanFilter::new();
        let snapshot = snapshot();
        let mut obj = TrackedObject::new("person", ScenePoint::new(xs[0], 2.0, 0.0), "top", at(0.0), &kf);
        let mut events = Vec::new();
        for (i, x) in xs.iter().enumerate().skip(1) {
            let now = at(i as f64 * 0.2);
            // feed the exact position so the filter lag does not blur the test
            obj.update(&kf, ScenePoint::new(*x, 2.0, 0.0), "top", now, 10);
            obj.position = ScenePoint::new(*x, 2.0, 0.0);
            if let Some(last) = obj.history.back_mut() {
                *last = obj.position;
            }
            events.extend(monitor.observe(&snapshot, &mut obj, now));
        }
        events
    }

    #[test]
    fn test_enter_and_exit_with_dwell() {
        let monitor = RegionMonitor::new(0.0, 0);
        let events = walk(&monitor, &[-1.0, -0.5, 1.0, 2.0, 3.0, 5.0]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], FusionEvent::RegionEntered { .. }));
        let FusionEvent::RegionExited { dwell, .. } = events[1] else {
            panic!("expected exit");
        };
        assert!((dwell - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_young_objects_raise_nothing() {
        let monitor = RegionMonitor::new(0.0, 10);
        assert!(walk(&monitor, &[-1.0, 1.0, 5.0]).is_empty());
    }

    #[test]
    fn test_debounce_suppresses_flicker() {
        let monitor = RegionMonitor::new(1.0, 0);
        // in at 0.2 s, out at 0.4 s is too soon to count
        let events = walk(&monitor, &[-1.0, 1.0, -0.5, 1.0]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FusionEvent::RegionEntered { .. }));
    }

    #[test]
    fn test_tripwire_direction() {
        let monitor = RegionMonitor::new(0.0, 0);
        let events = walk(&monitor, &[-3.0, -1.0]);
        assert_eq!(events.len(), 1);
        let FusionEvent::TripwireCrossed { direction, .. } = events[0] else {
            panic!("expected crossing");
        };
        // wire points +y, moving +x goes from its left to its right
        assert_eq!(direction, -1);
    }
}
