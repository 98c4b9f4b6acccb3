// Per-mode availability masks for command-triggered edges.

use super::{ModeType, State};
use std::collections::HashMap;

/// Mapping State -> available. States without an explicit entry are
/// available; masking a state keeps command (and completion) edges from
/// entering it while the profile is active. Installed whole on every mode
/// switch, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeProfile {
    masked: HashMap<State, bool>,
}

impl Default for ModeProfile {
    fn default() -> Self {
        Self::all_available()
    }
}

impl ModeProfile {
    /// Every state available - PRODUCTION, MANUAL and user-defined defaults.
    pub fn all_available() -> Self {
        Self {
            masked: HashMap::new(),
        }
    }

    /// Built-in profile for a mode. MAINTENANCE disables the
    /// EXECUTE -> COMPLETING path; everything else is all-available.
    pub fn for_mode(mode: ModeType) -> Self {
        let mut profile = Self::all_available();
        if mode == ModeType::MAINTENANCE {
            profile.set(State::Completing, false);
        }
        profile
    }

    /// Build a profile from an externally supplied state-name mask, as the
    /// configuration layer delivers it. Unknown state names are ignored with
    /// a warning; absent states default to available.
    pub fn from_masks(masks: &HashMap<String, bool>) -> Self {
        let mut profile = Self::all_available();
        for (name, available) in masks {
            match State::ALL
                .iter()
                .copied()
                .find(|s| s.to_string() == name.to_ascii_uppercase())
            {
                Some(state) => profile.set(state, *available),
                None => tracing::warn!(state = %name, "ignoring unknown state in mode mask"),
            }
        }
        profile
    }

    pub fn available(&self, state: State) -> bool {
        self.masked.get(&state).copied().unwrap_or(true)
    }

    pub fn set(&mut self, state: State, available: bool) {
        if available {
            self.masked.remove(&state);
        } else {
            self.masked.insert(state, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_entries_default_available() {
        let profile = ModeProfile::all_available();
        for state in State::ALL {
            assert!(profile.available(state));
        }
    }

    #[test]
    fn maintenance_masks_completing_only() {
        let profile = ModeProfile::for_mode(ModeType::MAINTENANCE);
        assert!(!profile.available(State::Completing));
        for state in State::ALL {
            if state != State::Completing {
                assert!(profile.available(state), "{state} should stay available");
            }
        }
    }

    #[test]
    fn profile_swap_is_total_replacement() {
        let maintenance = ModeProfile::for_mode(ModeType::MAINTENANCE);
        assert!(!maintenance.available(State::Completing));
        let production = ModeProfile::for_mode(ModeType::PRODUCTION);
        assert!(production.available(State::Completing));
    }

    #[test]
    fn mask_from_config_names() {
        let mut masks = HashMap::new();
        masks.insert("completing".to_string(), false);
        masks.insert("EXECUTE".to_string(), true);
        masks.insert("NOT_A_STATE".to_string(), false);
        let profile = ModeProfile::from_masks(&masks);
        assert!(!profile.available(State::Completing));
        assert!(profile.available(State::Execute));
    }
}
