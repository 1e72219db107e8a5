//! Message contracts at the boundary of the fusion engine.
//!
//! Inbound detection messages are checked before anything reaches the engine: problems with
//! the envelope reject the whole message, problems with a single object reject only that
//! object. Outbound messages are validated before they are handed to a publisher.

mod inbound;
mod outbound;

pub use inbound::{DetectionMessage, ItemRejection, parse_detection_message};
pub use outbound::{EventMessage, SceneObject, SceneUpdateMessage};
