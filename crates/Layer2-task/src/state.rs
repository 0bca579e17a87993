//! Instance state

use serde::{Deserialize, Serialize};

/// Lifecycle state of a process instance
///
/// Starting and stopping are synchronous calls, so only the two resting
/// states are ever observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// No child process; all pipes closed
    #[default]
    Dormant,

    /// Child running with its pipes open
    Live,
}

impl InstanceState {
    pub fn is_live(&self) -> bool {
        matches!(self, InstanceState::Live)
    }

    /// Label shown by front ends
    pub fn display_name(&self) -> &'static str {
        match self {
            InstanceState::Dormant => "STOPPED",
            InstanceState::Live => "STARTED",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
