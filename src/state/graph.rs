// PackML transition topology as static data, evaluated by pure functions.
//
// Super-states are containment lookups rather than occupiable machine states:
// a command edge hanging off ABORTABLE or STOPPABLE applies to every state
// inside that scope.

use super::{ModeProfile, State, SuperState, TransitionCmd};

/// Source of a command-triggered edge: a concrete state or a grouping scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSource {
    State(State),
    Scope(SuperState),
}

/// Whether EXECUTE completes into COMPLETING once or loops on itself until
/// explicitly commanded out. Fixed at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleMode {
    #[default]
    Single,
    Continuous,
}

/// Command-triggered edges. Scope sources cover every contained state.
pub const COMMAND_EDGES: [(EdgeSource, TransitionCmd, State); 9] = [
    (EdgeSource::Scope(SuperState::Abortable), TransitionCmd::Abort, State::Aborting),
    (EdgeSource::State(State::Aborted), TransitionCmd::Clear, State::Clearing),
    (EdgeSource::Scope(SuperState::Stoppable), TransitionCmd::Stop, State::Stopping),
    (EdgeSource::State(State::Stopped), TransitionCmd::Reset, State::Resetting),
    (EdgeSource::State(State::Idle), TransitionCmd::Start, State::Starting),
    (EdgeSource::State(State::Execute), TransitionCmd::Hold, State::Holding),
    (EdgeSource::State(State::Held), TransitionCmd::Unhold, State::Unholding),
    (EdgeSource::State(State::Execute), TransitionCmd::Suspend, State::Suspending),
    (EdgeSource::State(State::Suspended), TransitionCmd::Unsuspend, State::Unsuspending),
];

// COMPLETE -RESET-> RESETTING shares the token with STOPPED -RESET-> RESETTING,
// so it lives outside the array to keep the tuple list free of duplicates-by-source.
const COMPLETE_RESET: (EdgeSource, TransitionCmd, State) =
    (EdgeSource::State(State::Complete), TransitionCmd::Reset, State::Resetting);

/// Enclosing scopes of a state, innermost first. ABORTED and ABORTING sit
/// outside both scopes; CLEARING, STOPPING and STOPPED are abortable but not
/// stoppable; everything else is inside both.
pub fn scopes_of(state: State) -> &'static [SuperState] {
    match state {
        State::Undefined | State::Aborted | State::Aborting => &[],
        State::Clearing | State::Stopping | State::Stopped => &[SuperState::Abortable],
        _ => &[SuperState::Stoppable, SuperState::Abortable],
    }
}

fn edge_applies(source: EdgeSource, current: State) -> bool {
    match source {
        EdgeSource::State(s) => s == current,
        EdgeSource::Scope(scope) => scopes_of(current).contains(&scope),
    }
}

/// Target of `cmd` out of `current`, before mode masking. A concrete-state
/// source wins over a scope source so EXECUTE -HOLD-> HOLDING is found before
/// the scope-wide STOP/ABORT edges are considered for other commands.
pub fn command_target(current: State, cmd: TransitionCmd) -> Option<State> {
    if current == State::Complete && cmd == TransitionCmd::Reset {
        return Some(COMPLETE_RESET.2);
    }
    COMMAND_EDGES
        .iter()
        .find(|(source, edge_cmd, _)| *edge_cmd == cmd && edge_applies(*source, current))
        .map(|(_, _, target)| *target)
}

/// Target of the completion-triggered edge out of `current`, if `current` is
/// an acting state. EXECUTE depends on the cycle variant.
pub fn completion_target(current: State, cycle: CycleMode) -> Option<State> {
    match current {
        State::Aborting => Some(State::Aborted),
        State::Clearing => Some(State::Stopped),
        State::Stopping => Some(State::Stopped),
        State::Resetting => Some(State::Idle),
        State::Starting => Some(State::Execute),
        State::Holding => Some(State::Held),
        State::Unholding => Some(State::Execute),
        State::Suspending => Some(State::Suspended),
        State::Unsuspending => Some(State::Execute),
        State::Execute => Some(match cycle {
            CycleMode::Single => State::Completing,
            CycleMode::Continuous => State::Execute,
        }),
        State::Completing => Some(State::Complete),
        _ => None,
    }
}

/// Target of the error-triggered edge: anywhere inside ABORTABLE aborts.
pub fn error_target(current: State) -> Option<State> {
    if scopes_of(current).contains(&SuperState::Abortable) {
        Some(State::Aborting)
    } else {
        None
    }
}

/// Full command-edge evaluation against the active profile. Returns the
/// target only when the edge exists and its target is available.
pub fn eligible_command_target(
    current: State,
    cmd: TransitionCmd,
    profile: &ModeProfile,
) -> Result<State, EdgeRejection> {
    let target = command_target(current, cmd).ok_or(EdgeRejection::NoEdge)?;
    if profile.available(target) {
        Ok(target)
    } else {
        Err(EdgeRejection::TargetMasked(target))
    }
}

/// Why a command edge did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRejection {
    /// No edge labeled with the command leaves the current state or its scopes.
    NoEdge,
    /// The edge exists but its target is unavailable in the active mode.
    TargetMasked(State),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reaches_everything_abortable() {
        for state in [
            State::Stopped,
            State::Idle,
            State::Execute,
            State::Held,
            State::Suspending,
            State::Clearing,
            State::Stopping,
            State::Complete,
        ] {
            assert_eq!(
                command_target(state, TransitionCmd::Abort),
                Some(State::Aborting),
                "{state} should abort"
            );
        }
        assert_eq!(command_target(State::Aborted, TransitionCmd::Abort), None);
        assert_eq!(command_target(State::Aborting, TransitionCmd::Abort), None);
    }

    #[test]
    fn stop_does_not_reach_clearing_or_stopped_paths() {
        assert_eq!(command_target(State::Execute, TransitionCmd::Stop), Some(State::Stopping));
        assert_eq!(command_target(State::Idle, TransitionCmd::Stop), Some(State::Stopping));
        // Abortable-but-not-stoppable states have no STOP edge
        assert_eq!(command_target(State::Clearing, TransitionCmd::Stop), None);
        assert_eq!(command_target(State::Stopped, TransitionCmd::Stop), None);
        assert_eq!(command_target(State::Aborted, TransitionCmd::Stop), None);
    }

    #[test]
    fn reset_from_both_wait_states() {
        assert_eq!(command_target(State::Stopped, TransitionCmd::Reset), Some(State::Resetting));
        assert_eq!(command_target(State::Complete, TransitionCmd::Reset), Some(State::Resetting));
        assert_eq!(command_target(State::Idle, TransitionCmd::Reset), None);
    }

    #[test]
    fn execute_completion_depends_on_cycle() {
        assert_eq!(
            completion_target(State::Execute, CycleMode::Single),
            Some(State::Completing)
        );
        assert_eq!(
            completion_target(State::Execute, CycleMode::Continuous),
            Some(State::Execute)
        );
        assert_eq!(completion_target(State::Idle, CycleMode::Single), None);
    }

    #[test]
    fn error_edge_only_inside_abortable() {
        assert_eq!(error_target(State::Execute), Some(State::Aborting));
        assert_eq!(error_target(State::Stopped), Some(State::Aborting));
        assert_eq!(error_target(State::Aborted), None);
        assert_eq!(error_target(State::Aborting), None);
    }

    #[test]
    fn masked_target_is_rejected_but_distinguishable() {
        let mut profile = ModeProfile::all_available();
        profile.set(State::Starting, false);
        assert_eq!(
            eligible_command_target(State::Idle, TransitionCmd::Start, &profile),
            Err(EdgeRejection::TargetMasked(State::Starting))
        );
        assert_eq!(
            eligible_command_target(State::Idle, TransitionCmd::Hold, &profile),
            Err(EdgeRejection::NoEdge)
        );
        assert_eq!(
            eligible_command_target(State::Held, TransitionCmd::Unhold, &profile),
            Ok(State::Unholding)
        );
    }
}
