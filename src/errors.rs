use crate::state::{ModeType, State, TransitionCmd};
use thiserror::Error;

/// Rejections produced synchronously by the engine for a single command or
/// mode-change invocation. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unrecognized transition request command: {command}")]
    UnrecognizedCommand { command: String },

    #[error("invalid transition: no {command} edge out of {state}")]
    InvalidTransition { command: TransitionCmd, state: State },

    #[error("invalid transition: {target} is unavailable in {mode} mode")]
    TargetUnavailable {
        command: TransitionCmd,
        target: State,
        mode: ModeType,
    },

    #[error("cannot switch mode in state: {state}")]
    ModeChangeDisallowed { state: State },

    #[error("engine is not active")]
    EngineInactive,

    #[error("engine is already active")]
    EngineAlreadyActive,
}

impl CommandError {
    /// Masked-target rejections are still the InvalidTransition kind for
    /// callers that only care about the taxonomy.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            CommandError::InvalidTransition { .. } | CommandError::TargetUnavailable { .. }
        )
    }
}

/// Outcome of one engine command invocation, produced after the engine
/// context has evaluated the edge exactly once. An accepted outcome names
/// the state the command committed, which may already be stale by the time
/// the caller reads the engine again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub accepted: bool,
    pub state: Option<State>,
    pub error: Option<CommandError>,
}

impl CommandOutcome {
    pub fn accepted(state: State) -> Self {
        Self {
            accepted: true,
            state: Some(state),
            error: None,
        }
    }

    pub fn rejected(error: CommandError) -> Self {
        Self {
            accepted: false,
            state: None,
            error: Some(error),
        }
    }

    /// Human-readable reason; empty for accepted commands.
    pub fn reason(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }
}

/// Failures of a coordinator-level command spanning the local engine and the
/// subordinate fleet. A failed fan-out never rolls back the local engine;
/// the local transition committed before the fan-out began.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("node {node} rejected the transition: {message}")]
    NodeRejected { node: String, message: String },

    #[error("no requests issued: registry empty or every node unreachable")]
    NoRequestsIssued,

    #[error("fan-out did not complete within {timeout_secs}s")]
    FanOutTimeout { timeout_secs: u64 },
}

/// Transport-level delivery failures. Unreachable is distinct from a node
/// that answered success=false; it is excluded from the gather set and only
/// logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("node {node} is unreachable")]
    Unreachable { node: String },

    #[error("transport failure talking to {node}: {message}")]
    Failed { node: String, message: String },
}
