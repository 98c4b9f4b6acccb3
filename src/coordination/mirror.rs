// Subordinate-side mirror of the coordinator's machine.
//
// A mirror does not run its own engine. It accepts or refuses transition
// requests, remembers what it agreed to switch to, and treats the
// coordinator's published status as the source of truth when the round
// settles. An ack means "request accepted", never "transition completed".

use crate::observability::coordination_metrics;
use crate::state::{ModeType, State, Status};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::transport::TransitionAck;

/// Node-specific policy consulted by a [`NodeMirror`].
pub trait MirrorDelegate: Send + Sync {
    /// Whether this node can follow the fleet into `target`.
    fn approve_state(&self, target: State) -> bool {
        let _ = target;
        true
    }

    /// Whether this node can operate in `mode`.
    fn approve_mode(&self, mode: ModeType) -> bool {
        let _ = mode;
        true
    }

    /// Invoked after the mirror adopts a published status.
    fn on_status_changed(&self, status: Status) {
        let _ = status;
    }
}

/// Delegate that follows the coordinator unconditionally.
pub struct FollowFleet;

impl MirrorDelegate for FollowFleet {}

#[derive(Debug)]
struct MirrorState {
    current_state: State,
    current_mode: ModeType,
    expected_state: State,
    expected_mode: ModeType,
    waiting_for_state: bool,
    waiting_for_mode: bool,
}

/// One subordinate node's view of the fleet machine.
pub struct NodeMirror {
    name: String,
    delegate: Arc<dyn MirrorDelegate>,
    inner: Mutex<MirrorState>,
}

impl NodeMirror {
    pub fn new(name: impl Into<String>, delegate: Arc<dyn MirrorDelegate>) -> Self {
        Self {
            name: name.into(),
            delegate,
            inner: Mutex::new(MirrorState {
                current_state: State::Undefined,
                current_mode: ModeType::UNDEFINED,
                expected_state: State::Undefined,
                expected_mode: ModeType::UNDEFINED,
                waiting_for_state: false,
                waiting_for_mode: false,
            }),
        }
    }

    /// Mirror that approves every request.
    pub fn following(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(FollowFleet))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        let inner = self.lock();
        Status {
            state: inner.current_state,
            mode: inner.current_mode,
        }
    }

    pub fn is_switching_state(&self) -> bool {
        self.lock().waiting_for_state
    }

    pub fn is_switching_mode(&self) -> bool {
        self.lock().waiting_for_mode
    }

    /// Handle a state transition request from the coordinator. Accepting
    /// records the expected state and blocks further requests until the
    /// published status resolves the round.
    pub fn handle_state_transition(&self, target: State) -> TransitionAck {
        let mut inner = self.lock();
        debug!(node = %self.name, target = %target, "state transition requested");
        if inner.waiting_for_state {
            return TransitionAck::rejected("already waiting on a state change");
        }
        if inner.waiting_for_mode {
            return TransitionAck::rejected("mode change is still active");
        }
        if !self.delegate.approve_state(target) {
            info!(node = %self.name, target = %target, "node refused state switch");
            return TransitionAck::rejected("node did not approve state switch");
        }
        inner.waiting_for_state = true;
        inner.expected_state = target;
        TransitionAck::accepted()
    }

    /// Handle a mode transition request from the coordinator.
    pub fn handle_mode_transition(&self, mode: ModeType) -> TransitionAck {
        let mut inner = self.lock();
        debug!(node = %self.name, mode = %mode, "mode transition requested");
        if inner.waiting_for_state {
            return TransitionAck::rejected("already waiting on a state change");
        }
        if inner.waiting_for_mode {
            return TransitionAck::rejected("mode change is still active");
        }
        if !self.delegate.approve_mode(mode) {
            info!(node = %self.name, mode = %mode, "node refused mode switch");
            return TransitionAck::rejected("node did not approve mode switch");
        }
        inner.waiting_for_mode = true;
        inner.expected_mode = mode;
        TransitionAck::accepted()
    }

    /// Reconcile against a published fleet status. A published value that
    /// differs from what was expected is logged and adopted anyway; the
    /// coordinator's broadcast is authoritative.
    pub fn handle_status(&self, status: Status) {
        let mut inner = self.lock();
        let mut changed = false;
        if inner.current_state != status.state {
            if inner.expected_state != status.state && inner.expected_state != State::Undefined {
                coordination_metrics().record_status_mismatch();
                warn!(
                    node = %self.name,
                    published = %status.state,
                    expected = %inner.expected_state,
                    "published state differs from the expected state, adopting it"
                );
            }
            inner.current_state = status.state;
            inner.waiting_for_state = false;
            info!(node = %self.name, state = %status.state, "mirror state updated");
            changed = true;
        }
        if inner.current_mode != status.mode {
            if inner.expected_mode != status.mode && inner.expected_mode != ModeType::UNDEFINED {
                coordination_metrics().record_status_mismatch();
                warn!(
                    node = %self.name,
                    published = %status.mode,
                    expected = %inner.expected_mode,
                    "published mode differs from the expected mode, adopting it"
                );
            }
            inner.current_mode = status.mode;
            inner.waiting_for_mode = false;
            info!(node = %self.name, mode = %status.mode, "mirror mode updated");
            changed = true;
        }
        if changed {
            self.delegate.on_status_changed(Status {
                state: inner.current_state,
                mode: inner.current_mode,
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MirrorState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefuseExecute;

    impl MirrorDelegate for RefuseExecute {
        fn approve_state(&self, target: State) -> bool {
            target != State::Execute
        }
    }

    #[test]
    fn accepting_records_the_expected_state() {
        let mirror = NodeMirror::following("press");
        let ack = mirror.handle_state_transition(State::Clearing);
        assert!(ack.success);
        assert!(mirror.is_switching_state());
    }

    #[test]
    fn second_request_rejected_while_waiting() {
        let mirror = NodeMirror::following("press");
        assert!(mirror.handle_state_transition(State::Clearing).success);
        let ack = mirror.handle_state_transition(State::Stopped);
        assert!(!ack.success);
        assert_eq!(ack.message, "already waiting on a state change");
    }

    #[test]
    fn state_request_rejected_during_mode_switch() {
        let mirror = NodeMirror::following("press");
        assert!(mirror.handle_mode_transition(ModeType::PRODUCTION).success);
        assert!(!mirror.handle_state_transition(State::Clearing).success);
    }

    #[test]
    fn delegate_refusal_becomes_a_rejection() {
        let mirror = NodeMirror::new("press", Arc::new(RefuseExecute));
        let ack = mirror.handle_state_transition(State::Execute);
        assert!(!ack.success);
        assert_eq!(ack.message, "node did not approve state switch");
        assert!(!mirror.is_switching_state());
    }

    #[test]
    fn published_status_clears_the_wait() {
        let mirror = NodeMirror::following("press");
        mirror.handle_state_transition(State::Clearing);
        mirror.handle_status(Status {
            state: State::Clearing,
            mode: ModeType::UNDEFINED,
        });
        assert!(!mirror.is_switching_state());
        assert_eq!(mirror.status().state, State::Clearing);
    }

    #[test]
    fn divergent_published_state_is_adopted() {
        let mirror = NodeMirror::following("press");
        mirror.handle_state_transition(State::Clearing);
        // Fleet settles somewhere else; the broadcast wins.
        mirror.handle_status(Status {
            state: State::Aborting,
            mode: ModeType::UNDEFINED,
        });
        assert_eq!(mirror.status().state, State::Aborting);
        assert!(!mirror.is_switching_state());
    }
}
