use serde::Serialize;
use std::fmt;

/// States of the orchestrator cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Analyzing,
    Prioritizing,
    Executing,
    ManagingPositions,
    Reporting,
    ShuttingDown,
}

impl CyclePhase {
    /// Phase that follows this one in a normal cycle.
    ///
    /// Reporting loops back to fetching; shutting down is terminal.
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::Fetching,
            Self::Fetching => Self::Analyzing,
            Self::Analyzing => Self::Prioritizing,
            Self::Prioritizing => Self::Executing,
            Self::Executing => Self::ManagingPositions,
            Self::ManagingPositions => Self::Reporting,
            Self::Reporting => Self::Fetching,
            Self::ShuttingDown => Self::ShuttingDown,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::ShuttingDown
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Fetching => "FETCHING",
            Self::Analyzing => "ANALYZING",
            Self::Prioritizing => "PRIORITIZING",
            Self::Executing => "EXECUTING",
            Self::ManagingPositions => "MANAGING_POSITIONS",
            Self::Reporting => "REPORTING",
            Self::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(name)
    }
}
