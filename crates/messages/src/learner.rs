//! Messages sent by the learner.

use serde::{Deserialize, Serialize};
use vmap_types::Path;

/// The learner's reply to one round of lessons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answers {
    /// Queried paths whose hash differs from the learner's old tree, or that
    /// the old tree does not have.
    pub mismatched: Vec<Path>,
}

impl Answers {
    pub fn new(mismatched: Vec<Path>) -> Self {
        Self { mismatched }
    }
}

/// Everything the learner sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LearnerMessage {
    HandshakeAck,
    Answers(Answers),
    CompleteAck,
    Abort { reason: String },
}

impl LearnerMessage {
    /// Short name for logs.
    pub fn message_type_id(&self) -> &'static str {
        match self {
            LearnerMessage::HandshakeAck => "reconnect.handshake.ack",
            LearnerMessage::Answers(_) => "reconnect.answers",
            LearnerMessage::CompleteAck => "reconnect.complete.ack",
            LearnerMessage::Abort { .. } => "reconnect.abort",
        }
    }
}
