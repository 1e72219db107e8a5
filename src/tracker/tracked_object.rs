//! A fused identity tracked across cameras.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::ScenePoint;
use crate::reid::Embedding;
use crate::tracker::kalman_filter::{KalmanFilter, MotionState};
use crate::tracker::track_state::TrackState;

/// Globally unique object identity. Random v4 ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ObjectId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Seconds from `earlier` to `later`, negative when `later` is before `earlier`.
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let delta = later - earlier;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// `at` shifted by a (possibly fractional) number of seconds.
pub fn offset_seconds(at: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    at + TimeDelta::microseconds((seconds * 1e6).round() as i64)
}

/// Persistent fused identity.
#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub id: ObjectId,
    pub class: String,
    pub state: TrackState,
    /// Filtered position; `z` is taken from the latest observation.
    pub position: ScenePoint,
    pub motion: MotionState,
    /// Cameras geometrically observing the object and since when.
    pub visibility: BTreeMap<String, DateTime<Utc>>,
    /// Latest report time per camera that actually detected the object.
    pub sightings: BTreeMap<String, DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Number of detections associated with this identity.
    pub frame_count: u32,
    /// Most recent filtered positions, oldest first.
    pub history: VecDeque<ScenePoint>,
    /// Embeddings not yet written to the similarity store.
    pub embeddings: Vec<Embedding>,
    /// Sensor-local track id of the latest associated detection.
    pub source_track: String,
    /// Similarity of the re-identification that last bound a detection to this object.
    pub similarity: Option<f64>,
    /// Regions the object is inside and when it entered them.
    pub regions: BTreeMap<String, DateTime<Utc>>,
    /// Last committed membership change per region or tripwire.
    pub region_changes: BTreeMap<String, DateTime<Utc>>,
}

impl TrackedObject {
    pub fn new(
        class: impl Into<String>,
        position: ScenePoint,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        kalman_filter: &KalmanFilter,
    ) -> Self {
        let mut sightings = BTreeMap::new();
        sightings.insert(camera_id.to_string(), timestamp);
        Self {
            id: ObjectId::new(),
            class: class.into(),
            state: TrackState::Active,
            position,
            motion: kalman_filter.initiate([position.x, position.y]),
            visibility: BTreeMap::new(),
            sightings,
            first_seen: timestamp,
            last_update: timestamp,
            frame_count: 1,
            history: VecDeque::from([position]),
            embeddings: Vec::new(),
            source_track: String::new(),
            similarity: None,
            regions: BTreeMap::new(),
            region_changes: BTreeMap::new(),
        }
    }

    pub fn with_source_track(mut self, source_track: impl Into<String>) -> Self {
        self.source_track = source_track.into();
        self
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn velocity(&self) -> [f64; 2] {
        self.motion.velocity()
    }

    /// Filter prediction of the ground position at `at`, without changing state.
    pub fn predicted_position(&self, kalman_filter: &KalmanFilter, at: DateTime<Utc>) -> [f64; 2] {
        let dt = seconds_between(self.last_update, at);
        if dt <= 0.0 {
            return self.motion.position();
        }
        kalman_filter.predict(&self.motion, dt).position()
    }

    /// Fold an associated observation into the object.
    ///
    /// Observations older than the last update are applied without prediction and never
    /// move `last_update` backwards.
    pub fn update(
        &mut self,
        kalman_filter: &KalmanFilter,
        position: ScenePoint,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        history_len: usize,
    ) {
        let dt = seconds_between(self.last_update, timestamp);
        let predicted = kalman_filter.predict(&self.motion, dt);
        self.motion = kalman_filter.update(&predicted, [position.x, position.y]);

        let [x, y] = self.motion.position();
        self.position = ScenePoint::new(x, y, position.z);
        if timestamp > self.last_update {
            self.last_update = timestamp;
        }
        self.frame_count += 1;
        self.state = TrackState::Active;
        self.record_sighting(camera_id, timestamp);

        self.history.push_back(self.position);
        while self.history.len() > history_len.max(2) {
            self.history.pop_front();
        }
    }

    /// Bring an ended identity back at a new position. The motion filter restarts since
    /// the gap makes the old velocity meaningless.
    pub fn revive(
        &mut self,
        kalman_filter: &KalmanFilter,
        position: ScenePoint,
        camera_id: &str,
        timestamp: DateTime<Utc>,
    ) {
        self.state = TrackState::Active;
        self.position = position;
        self.motion = kalman_filter.initiate([position.x, position.y]);
        self.visibility.clear();
        self.sightings.clear();
        self.regions.clear();
        self.region_changes.clear();
        self.history.clear();
        self.history.push_back(position);
        self.frame_count += 1;
        if timestamp > self.last_update {
            self.last_update = timestamp;
        }
        self.record_sighting(camera_id, timestamp);
    }

    /// A second camera reporting an object already claimed this cycle. Keeps the object
    /// alive without moving it.
    pub fn corroborate(&mut self, camera_id: &str, timestamp: DateTime<Utc>) {
        if timestamp > self.last_update {
            self.last_update = timestamp;
        }
        self.record_sighting(camera_id, timestamp);
    }

    /// Replace the visibility set, keeping the since-times of cameras that still see the
    /// object. An empty set marks a live object stale.
    pub fn set_visibility(&mut self, cameras: BTreeSet<String>, now: DateTime<Utc>) {
        self.visibility.retain(|camera, _| cameras.contains(camera));
        for camera in cameras {
            self.visibility.entry(camera).or_insert(now);
        }
        if !self.is_live() {
            return;
        }
        self.state = if self.visibility.is_empty() {
            TrackState::Stale
        } else {
            TrackState::Active
        };
    }

    /// Whether the object went longer than `silence_interval` seconds without support.
    pub fn is_silent(&self, now: DateTime<Utc>, silence_interval: f64) -> bool {
        seconds_between(self.last_update, now) > silence_interval
    }

    fn record_sighting(&mut self, camera_id: &str, timestamp: DateTime<Utc>) {
        let at = self
            .sightings
            .entry(camera_id.to_string())
            .or_insert(timestamp);
        if timestamp > *at {
            *at = timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn at(seconds: f64) -> DateTime<Utc> {
        offset_seconds(DateTime::<Utc>::UNIX_EPOCH, seconds)
    }

    #[test]
    fn test_new_object() {
        let kf = KalmanFilter::new();
        let obj = TrackedObject::new("person", ScenePoint::new(10.0, 10.0, 0.0), "cam1", at(0.0), &kf);
        assert_eq!(obj.state, TrackState::Active);
        assert_eq!(obj.frame_count, 1);
        assert_eq!(obj.sightings.len(), 1);
        assert_eq!(obj.motion.position(), [10.0, 10.0]);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ObjectId::new(), ObjectId::new());
    }

    #[test]
    fn test_late_update_keeps_last_update() {
        let kf = KalmanFilter::new();
        let mut obj = TrackedObject::new("person", ScenePoint::new(0.0, 0.0, 0.0), "cam1", at(1.0), &kf);
        obj.update(&kf, ScenePoint::new(0.1, 0.0, 0.0), "cam2", at(0.5), 10);
        assert_eq!(obj.last_update, at(1.0));
        assert_eq!(obj.frame_count, 2);
        assert_eq!(obj.sightings["cam2"], at(0.5));
    }

    #[test]
    fn test_visibility_keeps_since_and_goes_stale() {
        let kf = KalmanFilter::new();
        let mut obj = TrackedObject::new("person", ScenePoint::new(0.0, 0.0, 0.0), "cam1", at(0.0), &kf);
        obj.set_visibility(BTreeSet::from(["cam1".to_string()]), at(0.0));
        obj.set_visibility(
            BTreeSet::from(["cam1".to_string(), "cam2".to_string()]),
            at(1.0),
        );
        assert_eq!(obj.visibility["cam1"], at(0.0));
        assert_eq!(obj.visibility["cam2"], at(1.0));

        obj.set_visibility(BTreeSet::new(), at(2.0));
        assert_eq!(obj.state, TrackState::Stale);
        assert!(obj.is_live());
    }

    #[test]
    fn test_silence() {
        let kf = KalmanFilter::new();
        let obj = TrackedObject::new("person", ScenePoint::new(0.0, 0.0, 0.0), "cam1", at(0.0), &kf);
        assert!(!obj.is_silent(at(0.9), 1.0));
        assert!(obj.is_silent(at(1.1), 1.0));
    }

    #[test]
    fn test_history_is_bounded() {
        let kf = KalmanFilter::new();
        let mut obj = TrackedObject::new("person", ScenePoint::new(0.0, 0.0, 0.0), "cam1", at(0.0), &kf);
        for i in 1..10 {
            obj.update(&kf, ScenePoint::new(i as f64 * 0.1, 0.0, 0.0), "cam1", at(i as f64 * 0.1), 4);
        }
        assert_eq!(obj.history.len(), 4);
    }

    #[test]
    fn test_seconds_between() {
        assert_abs_diff_eq!(seconds_between(at(1.0), at(2.5)), 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(seconds_between(at(2.5), at(1.0)), -1.5, epsilon = 1e-9);
    }
}
