use serde::Serialize;

/// Lifecycle of a fused object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// Seen recently and inside at least one camera's view
    #[default]
    Active,
    /// No camera can currently see the object; kept until the silence interval runs out
    Stale,
    /// Expired and removed from the scene
    Ended,
}

impl TrackState {
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Ended)
    }
}
