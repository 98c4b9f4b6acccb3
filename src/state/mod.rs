// PackML data model - states, commands, modes, and the wire-facing status

pub mod graph;
pub mod profile;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use graph::{command_target, completion_target, error_target, scopes_of, CycleMode};
pub use profile::ModeProfile;

/// The 18 PackML machine states. Exactly one is current per engine at any
/// time; UNDEFINED only appears before the first status has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i8)]
pub enum State {
    Undefined = 0,
    Clearing = 1,
    Stopped = 2,
    Starting = 3,
    Idle = 4,
    Suspended = 5,
    Execute = 6,
    Stopping = 7,
    Aborting = 8,
    Aborted = 9,
    Holding = 10,
    Held = 11,
    Unholding = 12,
    Suspending = 13,
    Unsuspending = 14,
    Resetting = 15,
    Completing = 16,
    Complete = 17,
}

impl State {
    /// All occupiable states, in wire-value order.
    pub const ALL: [State; 18] = [
        State::Undefined,
        State::Clearing,
        State::Stopped,
        State::Starting,
        State::Idle,
        State::Suspended,
        State::Execute,
        State::Stopping,
        State::Aborting,
        State::Aborted,
        State::Holding,
        State::Held,
        State::Unholding,
        State::Suspending,
        State::Unsuspending,
        State::Resetting,
        State::Completing,
        State::Complete,
    ];

    /// States that perform bound work on entry and auto-advance on completion.
    pub fn is_acting(self) -> bool {
        matches!(
            self,
            State::Starting
                | State::Execute
                | State::Holding
                | State::Unholding
                | State::Suspending
                | State::Unsuspending
                | State::Completing
                | State::Resetting
                | State::Clearing
                | State::Stopping
                | State::Aborting
        )
    }

    pub fn from_wire(val: i8) -> Option<State> {
        State::ALL.iter().copied().find(|s| *s as i8 == val)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Undefined => "UNDEFINED",
            State::Clearing => "CLEARING",
            State::Stopped => "STOPPED",
            State::Starting => "STARTING",
            State::Idle => "IDLE",
            State::Suspended => "SUSPENDED",
            State::Execute => "EXECUTE",
            State::Stopping => "STOPPING",
            State::Aborting => "ABORTING",
            State::Aborted => "ABORTED",
            State::Holding => "HOLDING",
            State::Held => "HELD",
            State::Unholding => "UNHOLDING",
            State::Suspending => "SUSPENDING",
            State::Unsuspending => "UNSUSPENDING",
            State::Resetting => "RESETTING",
            State::Completing => "COMPLETING",
            State::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// Non-occupiable grouping scopes used to attach wide transitions (abort from
/// anywhere abortable, stop from anywhere stoppable). STOPPABLE nests inside
/// ABORTABLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuperState {
    Abortable,
    Stoppable,
}

impl fmt::Display for SuperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuperState::Abortable => f.write_str("ABORTABLE"),
            SuperState::Stoppable => f.write_str("STOPPABLE"),
        }
    }
}

/// Command tokens, one per command-triggered edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum TransitionCmd {
    NoCommand = 0,
    Reset = 1,
    Start = 2,
    Stop = 3,
    Hold = 4,
    Unhold = 5,
    Suspend = 6,
    Unsuspend = 7,
    Abort = 8,
    Clear = 9,
}

impl TransitionCmd {
    pub const ALL: [TransitionCmd; 10] = [
        TransitionCmd::NoCommand,
        TransitionCmd::Reset,
        TransitionCmd::Start,
        TransitionCmd::Stop,
        TransitionCmd::Hold,
        TransitionCmd::Unhold,
        TransitionCmd::Suspend,
        TransitionCmd::Unsuspend,
        TransitionCmd::Abort,
        TransitionCmd::Clear,
    ];

    pub fn from_wire(val: i8) -> Option<TransitionCmd> {
        TransitionCmd::ALL.iter().copied().find(|c| *c as i8 == val)
    }

    /// Parse an operator-facing token, e.g. "START" or "start".
    pub fn parse(token: &str) -> Option<TransitionCmd> {
        match token.to_ascii_uppercase().as_str() {
            "RESET" => Some(TransitionCmd::Reset),
            "START" => Some(TransitionCmd::Start),
            "STOP" => Some(TransitionCmd::Stop),
            "HOLD" => Some(TransitionCmd::Hold),
            "UNHOLD" => Some(TransitionCmd::Unhold),
            "SUSPEND" => Some(TransitionCmd::Suspend),
            "UNSUSPEND" => Some(TransitionCmd::Unsuspend),
            "ABORT" => Some(TransitionCmd::Abort),
            "CLEAR" => Some(TransitionCmd::Clear),
            _ => None,
        }
    }
}

impl fmt::Display for TransitionCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionCmd::NoCommand => "NO_COMMAND",
            TransitionCmd::Reset => "RESET",
            TransitionCmd::Start => "START",
            TransitionCmd::Stop => "STOP",
            TransitionCmd::Hold => "HOLD",
            TransitionCmd::Unhold => "UNHOLD",
            TransitionCmd::Suspend => "SUSPEND",
            TransitionCmd::Unsuspend => "UNSUSPEND",
            TransitionCmd::Abort => "ABORT",
            TransitionCmd::Clear => "CLEAR",
        };
        f.write_str(name)
    }
}

/// Operating mode. Values above MANUAL are reserved for user-defined modes
/// and render as USER_DEFINED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeType(pub i8);

impl ModeType {
    pub const UNDEFINED: ModeType = ModeType(0);
    pub const PRODUCTION: ModeType = ModeType(1);
    pub const MAINTENANCE: ModeType = ModeType(2);
    pub const MANUAL: ModeType = ModeType(3);

    pub fn is_user_defined(self) -> bool {
        self.0 > Self::MANUAL.0
    }
}

impl fmt::Display for ModeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ModeType::UNDEFINED => f.write_str("UNDEFINED"),
            ModeType::PRODUCTION => f.write_str("PRODUCTION"),
            ModeType::MAINTENANCE => f.write_str("MAINTENANCE"),
            ModeType::MANUAL => f.write_str("MANUAL"),
            m if m.is_user_defined() => f.write_str("USER_DEFINED"),
            m => write!(f, "{}", m.0),
        }
    }
}

/// The only state shared between coordinator and mirrors: a full
/// {state, mode} snapshot, never a partial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: State,
    pub mode: ModeType,
}

impl Status {
    pub fn new(state: State, mode: ModeType) -> Self {
        Self { state, mode }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_wire_values_round_trip() {
        for state in State::ALL {
            assert_eq!(State::from_wire(state as i8), Some(state));
        }
        assert_eq!(State::from_wire(42), None);
    }

    #[test]
    fn command_token_parsing() {
        assert_eq!(TransitionCmd::parse("start"), Some(TransitionCmd::Start));
        assert_eq!(TransitionCmd::parse("UNSUSPEND"), Some(TransitionCmd::Unsuspend));
        assert_eq!(TransitionCmd::parse("bogus"), None);
        // NO_COMMAND is not an operator token
        assert_eq!(TransitionCmd::parse("NO_COMMAND"), None);
    }

    #[test]
    fn user_defined_modes_render_as_such() {
        assert_eq!(ModeType(7).to_string(), "USER_DEFINED");
        assert_eq!(ModeType::MAINTENANCE.to_string(), "MAINTENANCE");
    }

    #[test]
    fn status_survives_serialization() {
        let status = Status::new(State::Execute, ModeType::PRODUCTION);
        let raw = serde_json::to_string(&status).expect("serialize");
        let back: Status = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, status);
    }
}
