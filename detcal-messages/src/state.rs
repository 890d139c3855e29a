/// Lifecycle of a sweep session.
///
/// `Idle → Running → {Completed | Cancelled | Failed}`. The terminal states
/// are only reached after the generator output has been switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Idle, SessionState::Running) => true,
            (SessionState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// What a front end should show the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepStatus {
    /// At least one instrument isn't connected.
    NotReady(String),
    /// Percentage of visited sweep points.
    InProgress(u8),
    Stopped,
    Finished,
    Error(String),
}

impl std::fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepStatus::NotReady(why) => write!(f, "Not ready, check instruments: {why}"),
            SweepStatus::InProgress(pct) => write!(f, "In progress: {pct}%"),
            SweepStatus::Stopped => write!(f, "Stopped by user"),
            SweepStatus::Finished => write!(f, "Finished"),
            SweepStatus::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_sessions_reach_terminal_states() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Idle));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Cancelled));
    }
}
