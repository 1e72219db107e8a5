//! Live tracked-object set bound to the current configuration snapshot.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Result;
use crate::geometry::Camera;
use crate::tracker::{ObjectId, TrackState, TrackedObject};

use super::snapshot::SceneSnapshot;

/// Ended identities kept for revival.
const RETIRED_CAPACITY: usize = 4096;

/// Consistent copy of the scene taken at publish time.
#[derive(Debug, Clone)]
pub struct SceneState {
    pub snapshot: Arc<SceneSnapshot>,
    /// Live objects ordered by first sighting.
    pub objects: Vec<TrackedObject>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Cheap, cloneable read access to the last published [`SceneState`].
#[derive(Debug, Clone)]
pub struct SnapshotHandle(Arc<RwLock<Arc<SceneState>>>);

impl SnapshotHandle {
    fn new(state: SceneState) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(state))))
    }

    /// Latest state; holds the lock only for an `Arc` clone.
    pub fn load(&self) -> Arc<SceneState> {
        self.0.read().clone()
    }

    fn store(&self, state: SceneState) {
        *self.0.write() = Arc::new(state);
    }
}

/// Owner of the tracked objects. Only the fusion engine mutates it; everything else reads
/// through a [`SnapshotHandle`].
#[derive(Debug)]
pub struct SceneModel {
    snapshot: Arc<SceneSnapshot>,
    objects: HashMap<ObjectId, TrackedObject>,
    retired: VecDeque<TrackedObject>,
    silence_interval: f64,
    published: SnapshotHandle,
}

impl SceneModel {
    pub fn new(snapshot: Arc<SceneSnapshot>, silence_interval: f64) -> Self {
        let published = SnapshotHandle::new(SceneState {
            snapshot: snapshot.clone(),
            objects: Vec::new(),
            timestamp: None,
        });
        Self {
            snapshot,
            objects: HashMap::new(),
            retired: VecDeque::new(),
            silence_interval,
            published,
        }
    }

    pub fn snapshot(&self) -> &Arc<SceneSnapshot> {
        &self.snapshot
    }

    pub fn silence_interval(&self) -> f64 {
        self.silence_interval
    }

    pub fn set_silence_interval(&mut self, silence_interval: f64) {
        self.silence_interval = silence_interval;
    }

    /// Swap in a new configuration. Tracked objects survive.
    pub fn replace_snapshot(&mut self, snapshot: Arc<SceneSnapshot>) {
        self.snapshot = snapshot;
    }

    pub fn camera_by_id(&self, id: &str) -> Result<&Camera> {
        self.snapshot.camera_by_id(id)
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.published.clone()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&TrackedObject> {
        self.objects.get(id)
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut TrackedObject> {
        self.objects.get_mut(id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn upsert_tracked_object(&mut self, object: TrackedObject) {
        self.objects.insert(object.id, object);
    }

    /// Remove and end every object whose last update precedes `now - silence_interval`.
    /// Ended objects stay available for revival until the archive overflows.
    pub fn expire_stale_objects(&mut self, now: DateTime<Utc>) -> Vec<TrackedObject> {
        let expired_ids: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|o| o.is_silent(now, self.silence_interval))
            .map(|o| o.id)
            .collect();

        let mut ended = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(mut object) = self.objects.remove(&id) {
                object.state = TrackState::Ended;
                object.visibility.clear();
                if self.retired.len() == RETIRED_CAPACITY {
                    self.retired.pop_front();
                }
                // pending embeddings go to the caller only
                self.retired.push_back(TrackedObject {
                    embeddings: Vec::new(),
                    ..object.clone()
                });
                ended.push(object);
            }
        }
        ended.sort_by_key(|o| o.first_seen);
        ended
    }

    /// An ended identity still held for revival.
    pub fn retired(&self, id: &ObjectId) -> Option<&TrackedObject> {
        self.retired.iter().find(|o| o.id == *id)
    }

    pub fn is_retired(&self, id: &ObjectId) -> bool {
        self.retired(id).is_some()
    }

    /// Take an ended identity out of the archive.
    pub fn take_retired(&mut self, id: &ObjectId) -> Option<TrackedObject> {
        let idx = self.retired.iter().position(|o| o.id == *id)?;
        self.retired.remove(idx)
    }

    /// Cameras geometrically seeing the object under the current configuration.
    pub fn compute_visibility(&self, object: &TrackedObject) -> BTreeSet<String> {
        self.snapshot.compute_visibility(&object.position)
    }

    /// Recompute one object's visibility set.
    pub fn refresh_visibility(&mut self, id: &ObjectId, now: DateTime<Utc>) -> Option<&TrackedObject> {
        let cameras = self.compute_visibility(self.objects.get(id)?);
        let object = self.objects.get_mut(id)?;
        object.set_visibility(cameras, now);
        Some(object)
    }

    /// Consistent copy of all live objects, ordered by first sighting.
    pub fn snapshot_objects(&self) -> Vec<TrackedObject> {
        let mut objects: Vec<TrackedObject> = self.objects.values().cloned().collect();
        objects.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.id.cmp(&b.id)));
        objects
    }

    /// Make the current state visible to readers.
    pub fn publish(&self, now: DateTime<Utc>) -> Arc<SceneState> {
        self.published.store(SceneState {
            snapshot: self.snapshot.clone(),
            objects: self.snapshot_objects(),
            timestamp: Some(now),
        });
        self.published.load()
    }
}
