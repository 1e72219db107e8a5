//! Sink for validated outbound messages.

use crossbeam_channel::{SendError, Sender};

use crate::contract::{EventMessage, SceneUpdateMessage};

/// Receives fused state from the fusion worker.
///
/// Implement this to hand messages to a broker or any other transport. Messages are
/// validated before they get here; a publish error is logged and the worker carries on.
pub trait Publisher: Send + 'static {
    /// Error type for publish failures.
    type Error: std::fmt::Display;

    fn publish_scene(&mut self, message: &SceneUpdateMessage) -> Result<(), Self::Error>;

    fn publish_event(&mut self, message: &EventMessage) -> Result<(), Self::Error>;
}

/// A message leaving the service.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Scene(SceneUpdateMessage),
    Event(EventMessage),
}

impl Publisher for Sender<Outbound> {
    type Error = SendError<Outbound>;

    fn publish_scene(&mut self, message: &SceneUpdateMessage) -> Result<(), Self::Error> {
        self.send(Outbound::Scene(message.clone()))
    }

    fn publish_event(&mut self, message: &EventMessage) -> Result<(), Self::Error> {
        self.send(Outbound::Event(message.clone()))
    }
}
