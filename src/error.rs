//! Error taxonomy shared by every layer of the fusion crate.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by geometry, re-identification, scene and message handling.
#[derive(Error, Debug)]
pub enum FusionError {
    /// Camera calibration cannot be used (missing intrinsics, too few correspondences, ...).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The ray through a pixel never meets the requested ground plane.
    #[error("ray does not intersect the ground plane")]
    NoGroundIntersection,

    /// A scene point lies behind the camera's image plane.
    #[error("point is behind the camera")]
    BehindCamera,

    /// A detection batch references a camera that is not part of the scene.
    #[error("unknown camera: {0}")]
    UnknownCamera(String),

    /// A lookup by identifier found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A scene configuration without any usable camera.
    #[error("scene configuration has no usable cameras")]
    EmptyConfiguration,

    /// Engine or scene parameters out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A vector set already exists with different parameters.
    #[error("schema conflict for set '{set}': {reason}")]
    SchemaConflict { set: String, reason: String },

    /// The named vector set was never defined.
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    /// The similarity store was used before `connect`.
    #[error("similarity store is not connected")]
    NotConnected,

    /// A similarity store query did not answer in time.
    #[error("similarity store query timed out after {0:?}")]
    StoreTimeout(Duration),

    /// The similarity store backend reported a failure.
    #[error("similarity store error: {0}")]
    Store(String),

    /// An inbound or outbound message does not satisfy its contract.
    #[error("validation failure at '{path}': {reason}")]
    ValidationFailure { path: String, reason: String },

    /// The fusion worker is no longer running.
    #[error("fusion service has stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FusionError {
    pub(crate) fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn geometry(reason: impl Into<String>) -> Self {
        Self::InvalidGeometry(reason.into())
    }

    /// Whether the error comes from the similarity store and should only degrade
    /// association to spatial matching.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::SchemaConflict { .. }
                | Self::SchemaNotFound(_)
                | Self::NotConnected
                | Self::StoreTimeout(_)
                | Self::Store(_)
        )
    }
}

/// Result type for fusion operations.
pub type Result<T> = std::result::Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_classified() {
        assert!(FusionError::NotConnected.is_store_error());
        assert!(FusionError::StoreTimeout(Duration::from_millis(5)).is_store_error());
        assert!(!FusionError::UnknownCamera("cam".into()).is_store_error());
    }

    #[test]
    fn test_validation_message() {
        let err = FusionError::validation("objects.person[0]", "missing location");
        assert_eq!(
            err.to_string(),
            "validation failure at 'objects.person[0]': missing location"
        );
    }
}
