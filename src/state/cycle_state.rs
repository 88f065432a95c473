/// Cycle state definitions for the fetch-process pipeline
///
/// Every worker walks one target through these states. The transition table
/// is checked in debug builds so a cycle cannot skip a stage.
use std::fmt;

/// Represents where a single fetch-process cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    /// Waiting for a target from the frontier
    Idle,

    /// Target is being requested
    Fetching,

    /// Body is being turned into records and continuation targets
    Extracting,

    /// Records are checked against the ledger
    Filtering,

    /// New records are being appended to the store
    Persisting,

    /// Continuation targets are pushed back into the frontier
    Requeueing,

    /// Frontier is empty and nothing is in flight
    Done,

    /// Cancellation cut the cycle short
    ShuttingDown,
}

impl CycleState {
    /// Returns true if no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::ShuttingDown)
    }

    /// Checks whether `next` is a legal successor of this state
    ///
    /// `ShuttingDown` is reachable from every non-terminal state. A failed
    /// fetch goes straight from `Fetching` back to `Idle` (retry or skip),
    /// and so does a failed append from `Persisting`.
    pub fn can_transition_to(&self, next: CycleState) -> bool {
        if next == Self::ShuttingDown {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Self::Idle, Self::Fetching)
                | (Self::Idle, Self::Done)
                | (Self::Fetching, Self::Extracting)
                | (Self::Fetching, Self::Idle)
                | (Self::Extracting, Self::Filtering)
                | (Self::Extracting, Self::Idle)
                | (Self::Filtering, Self::Persisting)
                | (Self::Filtering, Self::Requeueing)
                | (Self::Persisting, Self::Requeueing)
                | (Self::Persisting, Self::Idle)
                | (Self::Requeueing, Self::Idle)
                | (Self::Requeueing, Self::Done)
        )
    }

    /// Short lowercase label used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Extracting => "extracting",
            Self::Filtering => "filtering",
            Self::Persisting => "persisting",
            Self::Requeueing => "requeueing",
            Self::Done => "done",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
