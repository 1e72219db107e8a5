//! Fusion worker and per-camera feeds.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::RwLock;

use crate::config::FusionConfig;
use crate::contract::{EventMessage, ItemRejection, SceneUpdateMessage, parse_detection_message};
use crate::error::{FusionError, Result};
use crate::reid::{ReidGate, ReidStore};
use crate::scene::{SceneConfig, SceneSnapshot, SceneState, SnapshotHandle};
use crate::tracker::{CycleReport, DetectionBatch, FusionEngine, offset_seconds};

use super::publisher::Publisher;
use super::stats::{ServiceCounters, ServiceStats};

enum Command {
    Batch(DetectionBatch),
    Reconfigure(Arc<SceneSnapshot>),
    Sync(Sender<()>),
    Shutdown,
}

/// Ingestion path for one camera. Cheap to clone and safe to move to the thread that
/// reads the camera's messages.
#[derive(Clone)]
pub struct CameraFeed {
    camera_id: String,
    expected_dims: Option<usize>,
    commands: Sender<Command>,
    counters: Arc<ServiceCounters>,
}

impl CameraFeed {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Validate a raw detection message and queue its valid objects for fusion. Returns
    /// the objects that were dropped. A message that fails envelope validation, or that
    /// names another camera, is rejected whole.
    pub fn submit_json(&self, json: &str) -> Result<Vec<ItemRejection>> {
        let message = match parse_detection_message(json, self.expected_dims) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(camera_id = %self.camera_id, error = %e, "detection message rejected");
                self.counters.message_rejected();
                return Err(e);
            }
        };
        if message.camera_id != self.camera_id {
            self.counters.message_rejected();
            tracing::warn!(
                camera_id = %self.camera_id,
                message_camera = %message.camera_id,
                "detection message for another camera rejected"
            );
            return Err(FusionError::validation(
                "id",
                format!(
                    "message from camera {} on the feed of {}",
                    message.camera_id, self.camera_id
                ),
            ));
        }
        let rejected = message.rejected.clone();
        self.send(message.into_batch())?;
        self.counters.message_accepted(rejected.len());
        Ok(rejected)
    }

    /// Queue an already built batch.
    pub fn submit(&self, batch: DetectionBatch) -> Result<()> {
        if batch.camera_id != self.camera_id {
            self.counters.message_rejected();
            return Err(FusionError::UnknownCamera(batch.camera_id));
        }
        self.send(batch)?;
        self.counters.message_accepted(0);
        Ok(())
    }

    fn send(&self, batch: DetectionBatch) -> Result<()> {
        self.commands
            .send(Command::Batch(batch))
            .map_err(|_| FusionError::Stopped)
    }
}

/// Owns the fusion worker thread.
pub struct FusionService {
    config: FusionConfig,
    commands: Sender<Command>,
    scene: RwLock<Arc<SceneSnapshot>>,
    handle: SnapshotHandle,
    counters: Arc<ServiceCounters>,
    worker: Option<JoinHandle<()>>,
}

impl FusionService {
    /// Validate the configuration and start the worker.
    ///
    /// `store` must already be connected. If the similarity set cannot be prepared the
    /// service runs with spatial association only.
    pub fn start<P: Publisher>(
        config: FusionConfig,
        scene: &SceneConfig,
        store: Option<Arc<dyn ReidStore>>,
        publisher: P,
    ) -> Result<Self> {
        config.validate()?;
        let snapshot = Arc::new(SceneSnapshot::build(scene, config.max_view_distance)?);
        let mut engine = FusionEngine::new(config.clone(), snapshot.clone())?;
        if let Some(store) = store {
            match ReidGate::start(store, &config) {
                Ok(gate) => engine = engine.with_reid(gate),
                Err(e) => tracing::warn!(
                    error = %e,
                    "re-identification unavailable, using spatial association only"
                ),
            }
        }

        let handle = engine.handle();
        let counters = Arc::new(ServiceCounters::default());
        let (commands, receiver) = unbounded();
        let tick = Duration::from_secs_f64(config.silence_interval / 2.0);
        let worker_counters = counters.clone();
        let worker = thread::Builder::new()
            .name("scene-fusion".to_string())
            .spawn(move || {
                Worker::new(engine, publisher, tick, worker_counters).run(receiver)
            })?;

        tracing::info!(
            scene = %snapshot.uid,
            cameras = snapshot.camera_count(),
            "fusion service started"
        );
        Ok(Self {
            config,
            commands,
            scene: RwLock::new(snapshot),
            handle,
            counters,
            worker: Some(worker),
        })
    }

    /// Feed for a configured camera.
    pub fn camera_feed(&self, camera_id: &str) -> Result<CameraFeed> {
        if self.scene.read().camera_by_id(camera_id).is_err() {
            return Err(FusionError::UnknownCamera(camera_id.to_string()));
        }
        Ok(CameraFeed {
            camera_id: camera_id.to_string(),
            expected_dims: Some(self.config.reid_dimensions),
            commands: self.commands.clone(),
            counters: self.counters.clone(),
        })
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<SceneState> {
        self.handle.load()
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    /// Accepted and rejected message counts since start.
    pub fn stats(&self) -> ServiceStats {
        self.counters.snapshot()
    }

    /// Validate a new scene configuration and swap it in between two cycles. On error the
    /// current configuration stays.
    pub fn reconfigure(&self, scene: &SceneConfig) -> Result<()> {
        let snapshot = Arc::new(SceneSnapshot::build(scene, self.config.max_view_distance)?);
        *self.scene.write() = snapshot.clone();
        self.commands
            .send(Command::Reconfigure(snapshot))
            .map_err(|_| FusionError::Stopped)
    }

    /// Block until everything queued before this call has been fused and published.
    pub fn sync(&self) -> Result<()> {
        let (reply, done) = bounded(1);
        self.commands
            .send(Command::Sync(reply))
            .map_err(|_| FusionError::Stopped)?;
        done.recv().map_err(|_| FusionError::Stopped)
    }

    /// Finish queued work and stop the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("fusion worker panicked");
            }
        }
    }
}

impl Drop for FusionService {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<P> {
    engine: FusionEngine,
    publisher: P,
    tick: Duration,
    counters: Arc<ServiceCounters>,
    /// Engine clock at the last cycle and when that cycle ran, for idle expiry.
    anchor: Option<(DateTime<Utc>, Instant)>,
}

impl<P: Publisher> Worker<P> {
    fn new(
        engine: FusionEngine,
        publisher: P,
        tick: Duration,
        counters: Arc<ServiceCounters>,
    ) -> Self {
        Self {
            engine,
            publisher,
            tick,
            counters,
            anchor: None,
        }
    }

    fn run(mut self, commands: Receiver<Command>) {
        loop {
            let first = match commands.recv_timeout(self.tick) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    self.idle();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let mut batches = Vec::new();
            let mut replies = Vec::new();
            let mut stop = false;
            for command in std::iter::once(first).chain(commands.try_iter()) {
                match command {
                    Command::Batch(batch) => batches.push(batch),
                    Command::Reconfigure(snapshot) => {
                        self.cycle(std::mem::take(&mut batches));
                        self.engine.reconfigure(snapshot);
                        self.publish(&CycleReport::default());
                    }
                    Command::Sync(reply) => replies.push(reply),
                    Command::Shutdown => {
                        stop = true;
                        break;
                    }
                }
            }
            self.cycle(batches);
            for reply in replies {
                let _ = reply.send(());
            }
            if stop {
                break;
            }
        }
        tracing::info!("fusion worker stopped");
    }

    fn cycle(&mut self, batches: Vec<DetectionBatch>) {
        if batches.is_empty() {
            return;
        }
        let report = self.engine.process_cycle(batches);
        self.counters.cycle_rejections(&report);
        if let Some(clock) = self.engine.clock() {
            self.anchor = Some((clock, Instant::now()));
        }
        self.publish(&report);
    }

    /// Expire on wall time elapsed since the last cycle, carried on the stream clock.
    fn idle(&mut self) {
        let Some((clock, at)) = self.anchor else {
            return;
        };
        let now = offset_seconds(clock, at.elapsed().as_secs_f64());
        let report = self.engine.expire(now);
        if !report.ended.is_empty() || !report.events.is_empty() {
            self.publish(&report);
        }
    }

    fn publish(&mut self, report: &CycleReport) {
        let state = self.engine.state();
        let scene = SceneUpdateMessage::from_state(&state).and_then(|message| {
            message.validate()?;
            Ok(message)
        });
        match scene {
            Ok(message) => {
                if let Err(e) = self.publisher.publish_scene(&message) {
                    tracing::warn!(error = %e, "failed to publish scene update");
                    self.counters.publish_failed();
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "outbound scene update rejected");
                self.counters.scene_update_rejected();
            }
        }

        for event in &report.events {
            let message = EventMessage::new(state.snapshot.uid.clone(), event.clone());
            if let Err(e) = message.validate() {
                tracing::warn!(error = %e, "outbound event rejected");
                self.counters.event_rejected();
                continue;
            }
            if let Err(e) = self.publisher.publish_event(&message) {
                tracing::warn!(error = %e, "failed to publish event");
                self.counters.publish_failed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::IntrinsicsSpec;
    use crate::pipeline::Outbound;
    use crate::scene::CameraConfig;

    fn scene() -> SceneConfig {
        SceneConfig {
            uid: "scene".into(),
            name: "test".into(),
            cameras: vec![CameraConfig {
                id: "top".into(),
                resolution: Some([640, 480]),
                intrinsics: Some(IntrinsicsSpec::Matrix {
                    fx: 320.0,
                    fy: 320.0,
                    cx: 320.0,
                    cy: 240.0,
                }),
                translation: Some([0.0, 0.0, 10.0]),
                rotation: Some(vec![180.0, 0.0, 0.0]),
                ..CameraConfig::default()
            }],
            regions: vec![],
            tripwires: vec![],
        }
    }

    const MESSAGE: &str = r#"{
        "id": "top",
        "timestamp": "2024-05-01T12:00:00Z",
        "objects": {"person": [{"id": "1", "center_px": {"x": 352, "y": 176}}, {"confidence": 0.4}]}
    }"#;

    #[test]
    fn test_feed_to_snapshot() {
        let (tx, rx) = unbounded();
        let service = FusionService::start(FusionConfig::default(), &scene(), None, tx).unwrap();
        let feed = service.camera_feed("top").unwrap();

        let rejected = feed.submit_json(MESSAGE).unwrap();
        assert_eq!(rejected.len(), 1);
        service.sync().unwrap();

        let state = service.snapshot();
        assert_eq!(state.objects.len(), 1);
        // pixel (352, 176) is 1 m right and 2 m ahead of the camera's nadir
        assert!((state.objects[0].position.x - 1.0).abs() < 1e-6);
        assert!((state.objects[0].position.y - 2.0).abs() < 1e-6);

        let Ok(Outbound::Scene(update)) = rx.try_recv() else {
            panic!("expected a scene update");
        };
        assert_eq!(update.objects.len(), 1);
        assert_eq!(update.objects[0].visibility, vec!["top".to_string()]);
        service.shutdown();
    }

    #[test]
    fn test_feed_rejects_foreign_messages() {
        let (tx, _rx) = unbounded();
        let service = FusionService::start(FusionConfig::default(), &scene(), None, tx).unwrap();
        assert!(matches!(
            service.camera_feed("side"),
            Err(FusionError::UnknownCamera(_))
        ));

        let feed = service.camera_feed("top").unwrap();
        let foreign = MESSAGE.replace("\"top\"", "\"side\"");
        assert!(matches!(
            feed.submit_json(&foreign),
            Err(FusionError::ValidationFailure { .. })
        ));
        assert!(feed.submit_json("[]").is_err());
    }

    #[test]
    fn test_rejections_are_counted() {
        let (tx, _rx) = unbounded();
        let service = FusionService::start(FusionConfig::default(), &scene(), None, tx).unwrap();
        let feed = service.camera_feed("top").unwrap();

        assert!(feed.submit_json(r#"{"id": "top", "objects": {}}"#).is_err());
        let stats = service.stats();
        assert_eq!(stats.rejected_messages, 1);
        assert_eq!(stats.accepted_messages, 0);

        feed.submit_json(MESSAGE).unwrap();
        service.sync().unwrap();
        let stats = service.stats();
        assert_eq!(stats.rejected_messages, 1);
        assert_eq!(stats.accepted_messages, 1);
        assert_eq!(stats.rejected_items, 1);
        assert_eq!(stats.rejected_scene_updates, 0);
        assert_eq!(stats.publish_failures, 0);
    }

    #[test]
    fn test_reconfigure_rejects_empty_scene() {
        let (tx, _rx) = unbounded();
        let service = FusionService::start(FusionConfig::default(), &scene(), None, tx).unwrap();
        let empty = SceneConfig {
            cameras: vec![],
            ..scene()
        };
        assert!(matches!(
            service.reconfigure(&empty),
            Err(FusionError::EmptyConfiguration)
        ));
        assert!(service.camera_feed("top").is_ok());
        service.sync().unwrap();
    }

    #[test]
    fn test_feed_fails_after_shutdown() {
        let (tx, _rx) = unbounded();
        let service = FusionService::start(FusionConfig::default(), &scene(), None, tx).unwrap();
        let feed = service.camera_feed("top").unwrap();
        service.shutdown();
        assert!(matches!(feed.submit_json(MESSAGE), Err(FusionError::Stopped)));
    }
}
