//! Cross-camera fusion engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::FusionConfig;
use crate::error::{FusionError, Result};
use crate::geometry::ScenePoint;
use crate::reid::{Embedding, ReidGate, SimilarityMatch};
use crate::scene::{SceneModel, SceneSnapshot, SceneState, SnapshotHandle};
use crate::tracker::association::{Association, decide, needs_reid};
use crate::tracker::detection::DetectionBatch;
use crate::tracker::events::{FusionEvent, RegionMonitor};
use crate::tracker::kalman_filter::KalmanFilter;
use crate::tracker::matching::{self, AssignmentResult, Claim};
use crate::tracker::track_state::TrackState;
use crate::tracker::tracked_object::{ObjectId, TrackedObject};

/// Pending embeddings kept per object between store writes.
const MAX_PENDING_EMBEDDINGS: usize = 64;

/// Frames of the slowest camera an object may miss before it can expire.
const MISSED_FRAMES_BEFORE_EXPIRY: f64 = 2.0;

/// A projected detection waiting for association.
#[derive(Debug, Clone)]
struct Observation {
    camera_id: String,
    index: usize,
    timestamp: DateTime<Utc>,
    class: String,
    position: ScenePoint,
    track_id: Option<String>,
    embedding: Option<Embedding>,
}

impl Observation {
    fn xy(&self) -> [f64; 2] {
        [self.position.x, self.position.y]
    }

    fn source(&self) -> (String, usize) {
        (self.camera_id.clone(), self.index)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Proposal {
    spatial: Option<(ObjectId, f64)>,
    candidates: usize,
}

/// How one detection was resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub camera_id: String,
    pub index: usize,
    pub class: String,
    pub association: Association,
    /// Identity the detection ended up supporting.
    pub object: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedBatch {
    pub camera_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedItem {
    pub camera_id: String,
    pub index: usize,
    pub reason: String,
}

/// Everything a cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub timestamp: Option<DateTime<Utc>>,
    pub decisions: Vec<Decision>,
    pub created: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub revived: Vec<ObjectId>,
    pub ended: Vec<ObjectId>,
    pub stale: Vec<ObjectId>,
    pub rejected_batches: Vec<RejectedBatch>,
    pub rejected_items: Vec<RejectedItem>,
    /// Objects whose position repeatedly fell outside the view of the cameras reporting
    /// them.
    pub invariant_warnings: Vec<ObjectId>,
    pub events: Vec<FusionEvent>,
}

/// Single writer of the tracked-object set.
///
/// Each cycle projects detections into the scene, associates them with tracked objects
/// (spatial gate first, re-identification when that is ambiguous), updates or creates
/// objects, refreshes visibility, expires silent objects and raises region events.
pub struct FusionEngine {
    config: FusionConfig,
    scene: SceneModel,
    kalman_filter: KalmanFilter,
    reid: Option<ReidGate>,
    monitor: RegionMonitor,
    unique_counts: HashMap<String, u64>,
    violations: HashMap<ObjectId, u32>,
    clock: Option<DateTime<Utc>>,
    reference_frame_rate: Option<f64>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig, snapshot: Arc<SceneSnapshot>) -> Result<Self> {
        config.validate()?;
        let scene = SceneModel::new(snapshot, config.silence_interval);
        let monitor = RegionMonitor::new(config.event_debounce, config.min_frames_for_events);
        Ok(Self {
            config,
            scene,
            kalman_filter: KalmanFilter::new(),
            reid: None,
            monitor,
            unique_counts: HashMap::new(),
            violations: HashMap::new(),
            clock: None,
            reference_frame_rate: None,
        })
    }

    /// Associate with the help of a similarity store.
    pub fn with_reid(mut self, gate: ReidGate) -> Self {
        self.reid = Some(gate);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn scene(&self) -> &SceneModel {
        &self.scene
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.scene.handle()
    }

    pub fn state(&self) -> Arc<SceneState> {
        self.scene.handle().load()
    }

    pub fn reid_enabled(&self) -> bool {
        self.reid.as_ref().is_some_and(|g| g.is_enabled())
    }

    /// Re-enable re-identification after it was switched off for being slow.
    pub fn reset_reid(&mut self) {
        if let Some(gate) = self.reid.as_mut() {
            gate.reset();
        }
    }

    /// Distinct identities created for `class`, revivals excluded.
    pub fn unique_count(&self, class: &str) -> u64 {
        self.unique_counts.get(class).copied().unwrap_or(0)
    }

    /// Latest timestamp the engine has seen.
    pub fn clock(&self) -> Option<DateTime<Utc>> {
        self.clock
    }

    /// Lowest frame rate any configured camera has reported.
    pub fn reference_frame_rate(&self) -> Option<f64> {
        self.reference_frame_rate
    }

    /// Silence interval in effect. Never shorter than two frames of the slowest camera.
    pub fn silence_interval(&self) -> f64 {
        self.scene.silence_interval()
    }

    /// Run one cycle on a single camera's batch. An unconfigured camera rejects the
    /// whole batch.
    pub fn process_batch(&mut self, batch: DetectionBatch) -> Result<CycleReport> {
        if self.scene.camera_by_id(&batch.camera_id).is_err() {
            tracing::warn!(camera_id = %batch.camera_id, "batch from unknown camera rejected");
            return Err(FusionError::UnknownCamera(batch.camera_id));
        }
        Ok(self.process_cycle(vec![batch]))
    }

    /// Run one cycle over batches from any number of cameras.
    pub fn process_cycle(&mut self, batches: Vec<DetectionBatch>) -> CycleReport {
        let mut report = CycleReport::default();
        let Some(latest) = batches.iter().map(|b| b.timestamp).max() else {
            return report;
        };
        let now = self.advance_clock(latest);
        report.timestamp = Some(now);
        for batch in &batches {
            if let Some(rate) = batch.frame_rate {
                if self.scene.camera_by_id(&batch.camera_id).is_ok() {
                    self.note_frame_rate(&batch.camera_id, rate);
                }
            }
        }

        let observations = self.project(batches, &mut report);
        let decisions = self.associate(&observations);
        let (touched, reporters) = self.apply(&observations, decisions, &mut report);

        self.refresh_touched(&touched, &reporters, now, &mut report);
        self.raise_events(&touched, now, &mut report);
        self.expire_into(now, &mut report);
        self.scene.publish(now);

        tracing::debug!(
            detections = observations.len(),
            created = report.created.len(),
            updated = report.updated.len(),
            revived = report.revived.len(),
            ended = report.ended.len(),
            objects = self.scene.len(),
            "fusion cycle"
        );
        report
    }

    /// Expiry tick without detections.
    pub fn expire(&mut self, now: DateTime<Utc>) -> CycleReport {
        let now = self.advance_clock(now);
        let mut report = CycleReport {
            timestamp: Some(now),
            ..CycleReport::default()
        };
        self.expire_into(now, &mut report);
        self.scene.publish(now);
        report
    }

    /// Swap in a new configuration between cycles and recompute every object's
    /// visibility against it.
    pub fn reconfigure(&mut self, snapshot: Arc<SceneSnapshot>) {
        tracing::info!(
            scene = %snapshot.uid,
            cameras = snapshot.camera_count(),
            "scene reconfigured"
        );
        self.scene.replace_snapshot(snapshot);
        let now = self.clock.unwrap_or_else(Utc::now);
        for id in self.scene.object_ids() {
            self.scene.refresh_visibility(&id, now);
        }
        self.scene.publish(now);
    }

    fn note_frame_rate(&mut self, camera_id: &str, rate: f64) {
        if !(rate.is_finite() && rate > 0.0)
            || self.reference_frame_rate.is_some_and(|r| r <= rate)
        {
            return;
        }
        self.reference_frame_rate = Some(rate);
        let silence = self
            .config
            .silence_interval
            .max(MISSED_FRAMES_BEFORE_EXPIRY / rate);
        self.scene.set_silence_interval(silence);
        tracing::info!(
            camera_id = %camera_id,
            frame_rate = rate,
            silence_interval = silence,
            "reference frame rate updated"
        );
    }

    fn advance_clock(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let now = self.clock.map_or(at, |c| c.max(at));
        self.clock = Some(now);
        now
    }

    fn project(&self, batches: Vec<DetectionBatch>, report: &mut CycleReport) -> Vec<Observation> {
        let mut observations = Vec::new();
        for batch in batches {
            let Ok(camera) = self.scene.camera_by_id(&batch.camera_id) else {
                tracing::warn!(camera_id = %batch.camera_id, "batch from unknown camera rejected");
                report.rejected_batches.push(RejectedBatch {
                    reason: FusionError::UnknownCamera(batch.camera_id.clone()).to_string(),
                    camera_id: batch.camera_id,
                });
                continue;
            };
            for (index, detection) in batch.detections.into_iter().enumerate() {
                match detection.project(camera) {
                    Ok(position) => observations.push(Observation {
                        camera_id: batch.camera_id.clone(),
                        index,
                        timestamp: batch.timestamp,
                        class: detection.class,
                        position,
                        track_id: detection.track_id,
                        embedding: detection.embedding,
                    }),
                    Err(e) => {
                        tracing::warn!(
                            camera_id = %batch.camera_id,
                            index,
                            error = %e,
                            "detection rejected"
                        );
                        report.rejected_items.push(RejectedItem {
                            camera_id: batch.camera_id.clone(),
                            index,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        observations
    }

    /// Optimal spatial assignment per camera frame and class.
    fn propose(&self, observations: &[Observation]) -> Vec<Proposal> {
        let mut proposals = vec![Proposal::default(); observations.len()];
        let mut groups: BTreeMap<(&str, DateTime<Utc>, &str), Vec<usize>> = BTreeMap::new();
        for (i, obs) in observations.iter().enumerate() {
            groups
                .entry((obs.camera_id.as_str(), obs.timestamp, obs.class.as_str()))
                .or_default()
                .push(i);
        }

        for ((_, timestamp, class), members) in groups {
            let objects: Vec<(ObjectId, [f64; 2])> = self
                .scene
                .objects()
                .filter(|o| o.is_live() && o.class == class)
                .map(|o| (o.id, o.predicted_position(&self.kalman_filter, timestamp)))
                .collect();
            let object_xy: Vec<[f64; 2]> = objects.iter().map(|(_, xy)| *xy).collect();
            let detection_xy: Vec<[f64; 2]> = members.iter().map(|&i| observations[i].xy()).collect();
            let dists = matching::distance_matrix(&object_xy, &detection_xy);

            let AssignmentResult { matches, .. } =
                matching::linear_assignment(&dists, self.config.tracking_radius);
            for (row, col) in matches {
                proposals[members[col]].spatial = Some((objects[row].0, dists[[row, col]]));
            }
            for (col, &i) in members.iter().enumerate() {
                proposals[i].candidates = dists
                    .column(col)
                    .iter()
                    .filter(|&&d| d <= self.config.tracking_radius)
                    .count();
            }
        }
        proposals
    }

    fn associate(&mut self, observations: &[Observation]) -> Vec<(usize, Association)> {
        let proposals = self.propose(observations);
        let threshold = self.config.reid_acceptance_threshold;

        let mut decisions = Vec::new();
        let mut claims = Vec::new();
        for (i, (obs, proposal)) in observations.iter().zip(&proposals).enumerate() {
            let found = if needs_reid(proposal.candidates) {
                self.query_reid(obs)
            } else {
                None
            };
            let mut association = decide(proposal.spatial, found.as_ref(), threshold);
            if let Association::Reid { object, .. } = association {
                if self.reid_target(&object, &obs.class).is_none() {
                    association = decide(proposal.spatial, None, threshold);
                }
            }
            match association.object() {
                Some(target) => claims.push(Claim {
                    target,
                    distance: self.claim_distance(&association, obs),
                    source: obs.source(),
                    item: (i, association),
                }),
                None => decisions.push((i, association)),
            }
        }

        let (winners, mut losers) = matching::resolve_conflicts(claims);
        let mut claimed: HashMap<ObjectId, String> = HashMap::new();
        for winner in winners {
            let (i, association) = winner.item;
            claimed.insert(winner.target, observations[i].camera_id.clone());
            decisions.push((i, association));
        }

        losers.sort_by(|a, b| a.source.cmp(&b.source));
        for loser in losers {
            let (i, _) = loser.item;
            let association = self.reassociate(&observations[i], &mut claimed);
            decisions.push((i, association));
        }
        decisions
    }

    /// Second chance for a detection that lost its object to a closer one.
    fn reassociate(
        &mut self,
        obs: &Observation,
        claimed: &mut HashMap<ObjectId, String>,
    ) -> Association {
        if let Some((object, distance)) = self.nearest_object(obs, claimed, true) {
            claimed.insert(object, obs.camera_id.clone());
            return Association::Spatial { object, distance };
        }

        if let Some(found) = self.query_reid(obs) {
            let object = ObjectId::from(found.identity);
            if found.similarity > self.config.reid_acceptance_threshold
                && !claimed.contains_key(&object)
                && self.reid_target(&object, &obs.class).is_some()
            {
                claimed.insert(object, obs.camera_id.clone());
                return Association::Reid {
                    object,
                    similarity: found.similarity,
                };
            }
        }

        match self.nearest_object(obs, claimed, false) {
            Some((object, distance)) => Association::Corroborating { object, distance },
            None => Association::NewObject,
        }
    }

    /// Nearest live object of the observation's class inside the gate, either among the
    /// unclaimed ones or among those claimed by another camera.
    fn nearest_object(
        &self,
        obs: &Observation,
        claimed: &HashMap<ObjectId, String>,
        unclaimed: bool,
    ) -> Option<(ObjectId, f64)> {
        self.scene
            .objects()
            .filter(|o| o.is_live() && o.class == obs.class)
            .filter(|o| match claimed.get(&o.id) {
                None => unclaimed,
                Some(camera) => !unclaimed && *camera != obs.camera_id,
            })
            .map(|o| {
                let predicted = o.predicted_position(&self.kalman_filter, obs.timestamp);
                (o.id, distance(predicted, obs.xy()))
            })
            .filter(|(_, d)| *d <= self.config.tracking_radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Top similarity result for the observation, if re-identification is usable.
    fn query_reid(&mut self, obs: &Observation) -> Option<SimilarityMatch> {
        let embedding = obs.embedding.as_ref()?;
        let gate = self.reid.as_mut()?;
        if !gate.is_enabled() {
            return None;
        }
        match gate.find_similar(&obs.class, std::slice::from_ref(embedding)) {
            Ok(found) => found.into_iter().next(),
            Err(e) => {
                tracing::warn!(
                    camera_id = %obs.camera_id,
                    error = %e,
                    "re-identification unavailable, using spatial association"
                );
                None
            }
        }
    }

    /// Live or retired object of `class` that a re-identification result may bind to.
    fn reid_target(&self, object: &ObjectId, class: &str) -> Option<&TrackedObject> {
        self.scene
            .get(object)
            .filter(|o| o.is_live())
            .or_else(|| self.scene.retired(object))
            .filter(|o| o.class == class)
    }

    fn claim_distance(&self, association: &Association, obs: &Observation) -> f64 {
        match *association {
            Association::Spatial { distance, .. } | Association::Corroborating { distance, .. } => {
                distance
            }
            Association::Reid { object, .. } => match self.scene.get(&object) {
                Some(o) => distance(o.predicted_position(&self.kalman_filter, obs.timestamp), obs.xy()),
                None => self
                    .scene
                    .retired(&object)
                    .map_or(f64::INFINITY, |o| distance([o.position.x, o.position.y], obs.xy())),
            },
            Association::NewObject => f64::INFINITY,
        }
    }

    fn apply(
        &mut self,
        observations: &[Observation],
        mut decisions: Vec<(usize, Association)>,
        report: &mut CycleReport,
    ) -> (Vec<ObjectId>, HashMap<ObjectId, BTreeSet<String>>) {
        // oldest first so the motion filter sees measurements in order
        decisions.sort_by(|a, b| {
            let (x, y) = (&observations[a.0], &observations[b.0]);
            x.timestamp.cmp(&y.timestamp).then_with(|| x.source().cmp(&y.source()))
        });

        let mut touched = Vec::new();
        let mut reporters: HashMap<ObjectId, BTreeSet<String>> = HashMap::new();
        let mut created: Vec<ObjectId> = Vec::new();
        for (i, mut association) in decisions {
            let obs = &observations[i];
            if association == Association::NewObject {
                // another camera may have created the same object earlier in this cycle
                if let Some(merge) = self.nearest_created(obs, &created, &reporters) {
                    association = merge;
                }
            }
            let object = match association {
                Association::Spatial { object, .. } => self.update_object(object, obs, None, report),
                Association::Reid { object, similarity } => {
                    self.update_object(object, obs, Some(similarity), report)
                }
                Association::Corroborating { object, .. } => {
                    if let Some(o) = self.scene.get_mut(&object) {
                        o.corroborate(&obs.camera_id, obs.timestamp);
                        object
                    } else {
                        self.create_object(obs, report)
                    }
                }
                Association::NewObject => {
                    let id = self.create_object(obs, report);
                    created.push(id);
                    id
                }
            };
            report.decisions.push(Decision {
                camera_id: obs.camera_id.clone(),
                index: obs.index,
                class: obs.class.clone(),
                association,
                object,
            });
            if !touched.contains(&object) {
                touched.push(object);
            }
            reporters
                .entry(object)
                .or_default()
                .insert(obs.camera_id.clone());
        }
        (touched, reporters)
    }

    /// Object created this cycle by a different camera, of the same class and inside the
    /// gate, that this camera has not reported yet.
    fn nearest_created(
        &self,
        obs: &Observation,
        created: &[ObjectId],
        reporters: &HashMap<ObjectId, BTreeSet<String>>,
    ) -> Option<Association> {
        created
            .iter()
            .filter(|id| reporters.get(id).is_some_and(|r| !r.contains(&obs.camera_id)))
            .filter_map(|id| self.scene.get(id))
            .filter(|o| o.class == obs.class)
            .map(|o| (o.id, distance(o.motion.position(), obs.xy())))
            .filter(|(_, d)| *d <= self.config.tracking_radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(object, distance)| Association::Spatial { object, distance })
    }

    /// Fold an observation into a live object, or revive a retired one.
    fn update_object(
        &mut self,
        id: ObjectId,
        obs: &Observation,
        similarity: Option<f64>,
        report: &mut CycleReport,
    ) -> ObjectId {
        let stride = self.config.reid_history_stride;
        let history_len = self.config.location_history;

        if self.scene.get(&id).is_some() {
            if let Some(object) = self.scene.get_mut(&id) {
                object.update(&self.kalman_filter, obs.position, &obs.camera_id, obs.timestamp, history_len);
            }
            if !report.updated.contains(&id) {
                report.updated.push(id);
            }
        } else {
            let Some(mut object) = self.scene.take_retired(&id) else {
                return self.create_object(obs, report);
            };
            object.revive(&self.kalman_filter, obs.position, &obs.camera_id, obs.timestamp);
            tracing::info!(
                object_id = %id,
                camera_id = %obs.camera_id,
                class = %obs.class,
                "identity revived"
            );
            report.revived.push(id);
            self.scene.upsert_tracked_object(object);
        }

        let Some(object) = self.scene.get_mut(&id) else {
            return id;
        };
        if similarity.is_some() {
            object.similarity = similarity;
        }
        if let Some(track_id) = &obs.track_id {
            object.source_track = track_id.clone();
        }
        if let Some(embedding) = &obs.embedding {
            if object.frame_count as usize % stride == 0 {
                if object.embeddings.len() == MAX_PENDING_EMBEDDINGS {
                    object.embeddings.remove(0);
                }
                object.embeddings.push(embedding.clone());
            }
        }
        id
    }

    fn create_object(&mut self, obs: &Observation, report: &mut CycleReport) -> ObjectId {
        let object = TrackedObject::new(
            obs.class.clone(),
            obs.position,
            &obs.camera_id,
            obs.timestamp,
            &self.kalman_filter,
        )
        .with_source_track(obs.track_id.clone().unwrap_or_default());
        let id = object.id;

        if let (Some(gate), Some(embedding)) = (&self.reid, &obs.embedding) {
            if let Err(e) = gate.add_entry(
                id.as_uuid(),
                &object.source_track,
                &obs.class,
                vec![embedding.clone()],
            ) {
                tracing::warn!(object_id = %id, error = %e, "failed to queue embedding");
            }
        }

        *self.unique_counts.entry(obs.class.clone()).or_default() += 1;
        tracing::debug!(
            object_id = %id,
            camera_id = %obs.camera_id,
            class = %obs.class,
            x = obs.position.x,
            y = obs.position.y,
            "object created"
        );
        self.scene.upsert_tracked_object(object);
        report.created.push(id);
        id
    }

    /// Recompute visibility of touched objects and check that every camera reporting an
    /// object can actually see where it ended up.
    fn refresh_touched(
        &mut self,
        touched: &[ObjectId],
        reporters: &HashMap<ObjectId, BTreeSet<String>>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        for id in touched {
            let Some(object) = self.scene.refresh_visibility(id, now) else {
                continue;
            };
            if object.state == TrackState::Stale {
                report.stale.push(*id);
            }
            let consistent = reporters
                .get(id)
                .is_none_or(|cameras| cameras.iter().all(|c| object.visibility.contains_key(c)));
            if consistent {
                self.violations.remove(id);
                continue;
            }
            let count = self.violations.entry(*id).or_default();
            *count += 1;
            if *count >= self.config.invariant_violation_limit {
                if *count == self.config.invariant_violation_limit {
                    tracing::warn!(
                        object_id = %id,
                        violations = *count,
                        x = object.position.x,
                        y = object.position.y,
                        "object repeatedly outside the view of its reporting cameras"
                    );
                }
                report.invariant_warnings.push(*id);
            }
        }
    }

    fn raise_events(&mut self, touched: &[ObjectId], now: DateTime<Utc>, report: &mut CycleReport) {
        let snapshot = self.scene.snapshot().clone();
        if snapshot.regions().is_empty() && snapshot.tripwires().is_empty() {
            return;
        }
        for id in touched {
            if let Some(object) = self.scene.get_mut(id) {
                report.events.extend(self.monitor.observe(&snapshot, object, now));
            }
        }
    }

    fn expire_into(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        for object in self.scene.expire_stale_objects(now) {
            report.events.extend(self.monitor.exit_all(&object, now));
            self.violations.remove(&object.id);
            if let Some(gate) = &self.reid {
                if let Err(e) = gate.add_entry(
                    object.id.as_uuid(),
                    &object.source_track,
                    &object.class,
                    object.embeddings.clone(),
                ) {
                    tracing::warn!(object_id = %object.id, error = %e, "failed to queue embeddings");
                }
            }
            tracing::debug!(
                object_id = %object.id,
                class = %object.class,
                frames = object.frame_count,
                "object ended"
            );
            report.ended.push(object.id);
        }
    }
}

fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::IntrinsicsSpec;
    use crate::reid::{MemoryStore, ReidStore, SimilarityMetric};
    use crate::scene::{CameraConfig, SceneConfig};
    use crate::tracker::detection::{Detection, DetectionLocation};
    use crate::tracker::tracked_object::offset_seconds;
    use std::time::Duration;
    use uuid::Uuid;

    fn at(seconds: f64) -> DateTime<Utc> {
        offset_seconds(DateTime::<Utc>::UNIX_EPOCH, seconds)
    }

    /// Overhead camera 10 m above `(x, 0)`; ground pixel `(u, v)` maps to
    /// `(x + (u - 320) / 32, -(v - 240) / 32)`.
    fn overhead(id: &str, x: f64) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            resolution: Some([640, 480]),
            intrinsics: Some(IntrinsicsSpec::Matrix {
                fx: 320.0,
                fy: 320.0,
                cx: 320.0,
                cy: 240.0,
            }),
            translation: Some([x, 0.0, 10.0]),
            rotation: Some(vec![180.0, 0.0, 0.0]),
            ..CameraConfig::default()
        }
    }

    fn engine(cameras: Vec<CameraConfig>) -> FusionEngine {
        engine_with(cameras, FusionConfig::default())
    }

    fn engine_with(cameras: Vec<CameraConfig>, fusion: FusionConfig) -> FusionEngine {
        let config = SceneConfig {
            uid: "s".into(),
            name: "s".into(),
            cameras,
            regions: vec![],
            tripwires: vec![],
        };
        let snapshot = SceneSnapshot::build(&config, 100.0).unwrap();
        FusionEngine::new(fusion, Arc::new(snapshot)).unwrap()
    }

    /// Similarity store whose queries either hang or fail.
    struct BrokenStore {
        inner: MemoryStore,
        hang: Option<Duration>,
    }

    impl ReidStore for BrokenStore {
        fn connect(&self, endpoint: &str) -> Result<()> {
            self.inner.connect(endpoint)
        }
        fn define_schema(&self, set: &str, metric: SimilarityMetric, dims: usize) -> Result<()> {
            self.inner.define_schema(set, metric, dims)
        }
        fn find_schema(&self, set: &str) -> Result<bool> {
            self.inner.find_schema(set)
        }
        fn add_entry(
            &self,
            identity: Uuid,
            source_track: &str,
            class: &str,
            vectors: &[Embedding],
            set: &str,
        ) -> Result<()> {
            self.inner.add_entry(identity, source_track, class, vectors, set)
        }
        fn find_similar(
            &self,
            _class: &str,
            _vectors: &[Embedding],
            _set: &str,
            _k: usize,
        ) -> Result<Vec<SimilarityMatch>> {
            match self.hang {
                Some(delay) => {
                    std::thread::sleep(delay);
                    Ok(Vec::new())
                }
                None => Err(FusionError::Store("backend unavailable".to_string())),
            }
        }
    }

    fn engine_over_broken_store(hang: Option<Duration>) -> FusionEngine {
        let inner = MemoryStore::new();
        inner.connect("local").unwrap();
        let config = FusionConfig {
            reid_dimensions: 2,
            reid_query_timeout_ms: 5,
            ..FusionConfig::default()
        };
        let gate = ReidGate::start(Arc::new(BrokenStore { inner, hang }), &config).unwrap();
        engine_with(vec![overhead("a", 0.0)], config).with_reid(gate)
    }

    /// Detection at ground point `(x, y)` as seen by an overhead camera at `(cam_x, 0)`.
    fn seen(class: &str, cam_x: f64, x: f64, y: f64) -> Detection {
        Detection::new(
            class,
            DetectionLocation::Point {
                x: 320.0 + (x - cam_x) * 32.0,
                y: 240.0 - y * 32.0,
            },
        )
    }

    #[test]
    fn test_first_detection_creates_object() {
        let mut engine = engine(vec![overhead("a", 0.0)]);
        let report = engine
            .process_batch(DetectionBatch::new("a", at(0.0)).with_detection(seen("person", 0.0, 1.0, 2.0)))
            .unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.decisions[0].association, Association::NewObject);

        let state = engine.state();
        assert_eq!(state.objects.len(), 1);
        let obj = &state.objects[0];
        assert!((obj.position.x - 1.0).abs() < 1e-6);
        assert!((obj.position.y - 2.0).abs() < 1e-6);
        assert_eq!(obj.visibility.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(engine.unique_count("person"), 1);
    }

    #[test]
    fn test_following_detection_updates() {
        let mut engine = engine(vec![overhead("a", 0.0)]);
        engine.process_cycle(vec![DetectionBatch::new("a", at(0.0)).with_detection(seen("person", 0.0, 1.0, 0.0))]);
        let report = engine.process_cycle(vec![
            DetectionBatch::new("a", at(0.1)).with_detection(seen("person", 0.0, 1.2, 0.0)),
        ]);
        assert!(report.created.is_empty());
        assert_eq!(report.updated.len(), 1);
        assert!(matches!(report.decisions[0].association, Association::Spatial { .. }));
        assert_eq!(engine.scene().len(), 1);
    }

    #[test]
    fn test_class_mismatch_creates_new_object() {
        let mut engine = engine(vec![overhead("a", 0.0)]);
        engine.process_cycle(vec![DetectionBatch::new("a", at(0.0)).with_detection(seen("person", 0.0, 1.0, 0.0))]);
        let report = engine.process_cycle(vec![
            DetectionBatch::new("a", at(0.1))
                .with_detection(seen("vehicle", 0.0, 1.0, 0.0))
                .with_detection(seen("bicycle", 0.0, 1.1, 0.0)),
        ]);
        assert_eq!(report.created.len(), 2);
        assert_eq!(engine.scene().len(), 3);
    }

    #[test]
    fn test_overlapping_cameras_fuse() {
        let mut engine = engine(vec![overhead("a", 0.0), overhead("b", 6.0)]);
        let report = engine.process_cycle(vec![
            DetectionBatch::new("a", at(0.0)).with_detection(seen("person", 0.0, 3.0, 1.0)),
            DetectionBatch::new("b", at(0.0)).with_detection(seen("person", 6.0, 3.2, 1.0)),
        ]);
        assert_eq!(report.created.len(), 1);
        assert_eq!(engine.scene().len(), 1);
        let obj = engine.scene().objects().next().unwrap();
        assert_eq!(obj.visibility.len(), 2);
        assert_eq!(obj.sightings.len(), 2);
    }

    #[test]
    fn test_closer_camera_wins_conflict() {
        let mut engine = engine(vec![overhead("a", 0.0), overhead("b", 6.0)]);
        engine.process_cycle(vec![DetectionBatch::new("a", at(0.0)).with_detection(seen("person", 0.0, 3.0, 0.0))]);
        let report = engine.process_cycle(vec![
            DetectionBatch::new("a", at(0.1)).with_detection(seen("person", 0.0, 3.9, 0.0)),
            DetectionBatch::new("b", at(0.1)).with_detection(seen("person", 6.0, 3.1, 0.0)),
        ]);
        let by_camera: HashMap<&str, &Association> = report
            .decisions
            .iter()
            .map(|d| (d.camera_id.as_str(), &d.association))
            .collect();
        assert!(matches!(by_camera["b"], Association::Spatial { .. }));
        assert!(matches!(by_camera["a"], Association::Corroborating { .. }));
        assert_eq!(engine.scene().len(), 1);
    }

    #[test]
    fn test_unknown_camera_rejects_batch() {
        let mut engine = engine(vec![overhead("a", 0.0)]);
        let result = engine.process_batch(DetectionBatch::new("ghost", at(0.0)).with_detection(seen("person", 0.0, 0.0, 0.0)));
        assert!(matches!(result, Err(FusionError::UnknownCamera(id)) if id == "ghost"));

        let report = engine.process_cycle(vec![
            DetectionBatch::new("ghost", at(0.0)).with_detection(seen("person", 0.0, 0.0, 0.0)),
            DetectionBatch::new("a", at(0.0)).with_detection(seen("person", 0.0, 0.0, 0.0)),
        ]);
        assert_eq!(report.rejected_batches.len(), 1);
        assert_eq!(report.created.len(), 1);
    }

    #[test]
    fn test_unprojectable_item_is_rejected_alone() {
        let mut engine = engine(vec![overhead("a", 0.0)]);
        let report = engine.process_cycle(vec![
            DetectionBatch::new("a", at(0.0))
                .with_detection(Detection::new(
                    "person",
                    DetectionLocation::Point {
                        x: f64::NAN,
                        y: 0.0,
                    },
                ))
                .with_detection(seen("person", 0.0, 0.0, 0.0)),
        ]);
        assert_eq!(report.rejected_items.len(), 1);
        assert_eq!(report.rejected_items[0].index, 0);
        assert_eq!(report.created.len(), 1);
    }

    #[test]
    fn test_expiry_and_keep_alive() {
        let mut engine = engine(vec![overhead("a", 0.0)]);
        for step in 0..10 {
            engine.process_cycle(vec![
                DetectionBatch::new("a", at(step as f64 * 0.9)).with_detection(seen("person", 0.0, 1.0, 1.0)),
            ]);
        }
        assert_eq!(engine.scene().len(), 1);
        assert_eq!(engine.unique_count("person"), 1);

        let report = engine.expire(at(8.1 + 1.5));
        assert_eq!(report.ended.len(), 1);
        assert!(engine.scene().is_empty());
        assert!(engine.state().objects.is_empty());
    }

    #[test]
    fn test_out_of_view_object_goes_stale_and_warns() {
        let mut engine = engine(vec![overhead("a", 0.0)]);
        let camera_point = |x: f64| {
            // metric point in the camera frame, far outside the image
            Detection::new("person", DetectionLocation::CameraPoint([x, 0.0, 10.0]))
        };
        let mut last = CycleReport::default();
        for step in 0..3 {
            last = engine.process_cycle(vec![
                DetectionBatch::new("a", at(step as f64 * 0.1)).with_detection(camera_point(40.0)),
            ]);
        }
        assert_eq!(last.stale.len(), 1);
        assert_eq!(last.invariant_warnings.len(), 1);
        assert_eq!(engine.scene().objects().next().unwrap().state, TrackState::Stale);
    }

    /// Two people inside the gate make the next detection ambiguous, so the engine asks the
    /// store. A store that cannot answer must leave the nearest spatial match in place.
    fn assert_spatial_fallback(mut engine: FusionEngine) {
        let first = engine.process_cycle(vec![
            DetectionBatch::new("a", at(0.0))
                .with_detection(seen("person", 0.0, 1.0, 0.0))
                .with_detection(seen("person", 0.0, 2.5, 0.0)),
        ]);
        assert_eq!(first.created.len(), 2);
        let nearest = first.created[0];

        let mut detection = seen("person", 0.0, 1.3, 0.0);
        detection.embedding = Some(vec![1.0, 0.0]);
        let report = engine.process_cycle(vec![DetectionBatch::new("a", at(0.1)).with_detection(detection)]);

        assert_eq!(report.decisions.len(), 1);
        assert!(matches!(
            report.decisions[0].association,
            Association::Spatial { object, .. } if object == nearest
        ));
        assert_eq!(report.updated, vec![nearest]);
        assert!(report.created.is_empty());
        assert_eq!(engine.scene().len(), 2);
    }

    #[test]
    fn test_store_timeout_falls_back_to_spatial() {
        let engine = engine_over_broken_store(Some(Duration::from_millis(300)));
        assert!(engine.reid_enabled());
        assert_spatial_fallback(engine);
    }

    #[test]
    fn test_store_error_falls_back_to_spatial() {
        assert_spatial_fallback(engine_over_broken_store(None));
    }

    #[test]
    fn test_late_batch_keeps_object_alive() {
        let mut engine = engine(vec![overhead("a", 0.0), overhead("b", 6.0)]);
        let first = engine.process_cycle(vec![
            DetectionBatch::new("a", at(2.0)).with_detection(seen("person", 0.0, 3.0, 0.0)),
        ]);
        let id = first.created[0];

        let late = engine.process_cycle(vec![
            DetectionBatch::new("b", at(1.5)).with_detection(seen("person", 6.0, 3.1, 0.0)),
        ]);
        assert!(late.created.is_empty());
        assert_eq!(late.updated, vec![id]);
        assert_eq!(late.timestamp, Some(at(2.0)));
        assert_eq!(engine.clock(), Some(at(2.0)));
        assert_eq!(engine.scene().get(&id).unwrap().last_update, at(2.0));

        assert!(engine.expire(at(2.9)).ended.is_empty());
        assert_eq!(engine.scene().len(), 1);
        assert_eq!(engine.expire(at(3.1)).ended, vec![id]);
    }

    #[test]
    fn test_slowest_camera_stretches_silence_interval() {
        let mut engine = engine(vec![overhead("a", 0.0), overhead("b", 6.0)]);
        engine.process_cycle(vec![
            DetectionBatch::new("a", at(0.0))
                .with_frame_rate(30.0)
                .with_detection(seen("person", 0.0, 1.0, 0.0)),
        ]);
        assert_eq!(engine.reference_frame_rate(), Some(30.0));
        assert_eq!(engine.silence_interval(), 1.0);

        engine.process_cycle(vec![
            DetectionBatch::new("b", at(0.0)).with_frame_rate(0.5),
            DetectionBatch::new("ghost", at(0.0)).with_frame_rate(0.1),
        ]);
        engine.process_cycle(vec![DetectionBatch::new("a", at(0.0)).with_frame_rate(30.0)]);
        assert_eq!(engine.reference_frame_rate(), Some(0.5));
        assert_eq!(engine.silence_interval(), 4.0);

        assert!(engine.expire(at(3.0)).ended.is_empty());
        assert_eq!(engine.expire(at(4.5)).ended.len(), 1);
    }
}
