//! Load-state rules deciding whether a vehicle may take an operation list.

use serde::{Deserialize, Serialize};

/// Well-known operation labels. Matching is case-insensitive.
pub mod ops {
    pub const LOAD: &str = "Load";
    pub const UNLOAD: &str = "Unload";
    pub const CHARGE: &str = "Charge";
    pub const PARK: &str = "Park";
}

/// What the vehicle is carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Empty,
    Full,
    #[default]
    Unknown,
}

impl LoadState {
    /// Load state after `operation` completed.
    pub fn after_operation(self, operation: &str) -> LoadState {
        if operation.eq_ignore_ascii_case(ops::LOAD) {
            LoadState::Full
        } else if operation.eq_ignore_ascii_case(ops::UNLOAD) {
            LoadState::Empty
        } else {
            self
        }
    }
}

/// A yes/no answer with the reason for a no.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainedBool {
    pub allowed: bool,
    pub reason: String,
}

impl ExplainedBool {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Check `operations`, in order, against the load state.
pub fn can_process<S: AsRef<str>>(load: LoadState, operations: &[S]) -> ExplainedBool {
    let mut loaded = match load {
        LoadState::Unknown => return ExplainedBool::rejected("vehicle load state is unknown"),
        LoadState::Full => true,
        LoadState::Empty => false,
    };

    for op in operations {
        let op = op.as_ref();
        if loaded {
            if op.eq_ignore_ascii_case(ops::LOAD) {
                return ExplainedBool::rejected("cannot load: vehicle is already loaded");
            } else if op.eq_ignore_ascii_case(ops::UNLOAD) {
                loaded = false;
            } else if op.eq_ignore_ascii_case(ops::PARK) {
                return ExplainedBool::rejected("cannot park while loaded");
            } else if op.eq_ignore_ascii_case(ops::CHARGE) {
                return ExplainedBool::rejected("cannot charge while loaded");
            }
        } else if op.eq_ignore_ascii_case(ops::LOAD) {
            loaded = true;
        } else if op.eq_ignore_ascii_case(ops::UNLOAD) {
            return ExplainedBool::rejected("cannot unload: vehicle is not loaded");
        }
    }
    ExplainedBool::allowed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_then_unload_from_empty() {
        let result = can_process(LoadState::Empty, &["Load", "Unload"]);
        assert!(result.allowed);
        assert!(result.reason.is_empty());
    }

    #[test]
    fn test_unload_from_empty_rejected() {
        let result = can_process(LoadState::Empty, &["UNLOAD"]);
        assert!(!result.allowed);
        assert!(result.reason.contains("load"));
    }

    #[test]
    fn test_loaded_rules() {
        assert!(!can_process(LoadState::Full, &["load"]).allowed);
        assert!(!can_process(LoadState::Full, &["Park"]).allowed);
        assert!(!can_process(LoadState::Full, &["Charge"]).allowed);
        assert!(can_process(LoadState::Full, &["Unload", "Charge"]).allowed);
        assert!(can_process(LoadState::Full, &["Unload", "Load", "Unload"]).allowed);
    }

    #[test]
    fn test_unknown_load_state() {
        let result = can_process::<&str>(LoadState::Unknown, &[]);
        assert!(!result.allowed);
        assert!(result.reason.contains("unknown"));
    }

    #[test]
    fn test_unrelated_operations_pass() {
        assert!(can_process(LoadState::Empty, &["Charge", "Park", "Beep"]).allowed);
    }

    #[test]
    fn test_after_operation() {
        assert_eq!(LoadState::Empty.after_operation("LOAD"), LoadState::Full);
        assert_eq!(LoadState::Full.after_operation("unload"), LoadState::Empty);
        assert_eq!(LoadState::Full.after_operation("Charge"), LoadState::Full);
    }
}
