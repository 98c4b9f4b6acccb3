use crate::errors::TransportError;
use crate::state::{ModeType, State, Status};
use async_trait::async_trait;

/// Reply produced by a node for one transition request. `success` reports
/// request acceptance, not transition completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionAck {
    pub success: bool,
    pub message: String,
}

impl TransitionAck {
    pub fn accepted() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Request/reply and publish seam between the coordinator and one
/// subordinate node. Implementations carry the wire protocol; the
/// coordinator only sees acks and unreachability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the node to run the given state transition command.
    async fn send_state_transition(
        &self,
        node: &str,
        target: State,
    ) -> Result<TransitionAck, TransportError>;

    /// Ask the node to switch its operating mode.
    async fn send_mode_transition(
        &self,
        node: &str,
        mode: ModeType,
    ) -> Result<TransitionAck, TransportError>;

    /// Broadcast the coordinator's settled status to the fleet.
    async fn publish_status(&self, status: Status);
}
