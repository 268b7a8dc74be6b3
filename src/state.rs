use std::fmt;

/// Where a download currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoordinatorState {
    NotStarted = 0,
    ProbingCapability = 1,
    SingleStream = 2,
    ChunkedDownload = 3,
    Merging = 4,
    Terminal = 5,
}

impl CoordinatorState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CoordinatorState::ProbingCapability,
            2 => CoordinatorState::SingleStream,
            3 => CoordinatorState::ChunkedDownload,
            4 => CoordinatorState::Merging,
            5 => CoordinatorState::Terminal,
            _ => CoordinatorState::NotStarted,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CoordinatorState::Terminal
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::NotStarted => "not-started",
            CoordinatorState::ProbingCapability => "probing",
            CoordinatorState::SingleStream => "single-stream",
            CoordinatorState::ChunkedDownload => "chunked",
            CoordinatorState::Merging => "merging",
            CoordinatorState::Terminal => "terminal",
        };
        f.write_str(name)
    }
}
