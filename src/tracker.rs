mod association;
mod detection;
mod engine;
mod events;
mod kalman_filter;
mod matching;
mod track_state;
mod tracked_object;

pub use association::{Association, decide, needs_reid};
pub use detection::{Detection, DetectionBatch, DetectionLocation};
pub use engine::{CycleReport, Decision, FusionEngine, RejectedBatch, RejectedItem};
pub use events::{FusionEvent, RegionMonitor};
pub use kalman_filter::{KalmanFilter, MotionState};
pub use matching::{
    AssignmentResult, Claim, INFEASIBLE, distance_matrix, linear_assignment, resolve_conflicts,
};
pub use track_state::TrackState;
pub use tracked_object::{ObjectId, TrackedObject, offset_seconds, seconds_between};
