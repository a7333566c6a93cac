//! Stage states
//!
//! Every stage of a pipeline moves through these states while it is being
//! optimized.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Optimization state of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    /// Not yet touched
    Pending,

    /// Structural rewrites and precision reduction applied
    Rewritten,

    /// Artifact exported and compiled locally
    Built,

    /// Artifact taken from the cache directory or the remote store
    Fetched,

    /// Artifact loaded onto the device
    Loaded,

    /// Wrapped by the capture cache
    Wrapped,

    /// Warm and ready to serve calls
    Ready,

    /// Optimization failed
    Failed(String),
}

impl StageState {
    pub fn new() -> Self {
        StageState::Pending
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, StageState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageState::Failed(_))
    }

    /// Returns true once no further transition is possible
    pub fn is_terminal(&self) -> bool {
        self.is_ready() || self.is_failed()
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            StageState::Failed(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns true if `next` may follow this state
    ///
    /// A stage without a loaded artifact may become ready directly when it is
    /// served uncompiled. Any non-terminal state may fail.
    pub fn can_transition_to(&self, next: &StageState) -> bool {
        use StageState::*;
        match (self, next) {
            (Ready, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Pending, Rewritten) => true,
            (Rewritten, Built) | (Rewritten, Fetched) => true,
            (Rewritten, Ready) | (Built, Ready) | (Fetched, Ready) => true,
            (Built, Loaded) | (Fetched, Loaded) => true,
            (Loaded, Wrapped) => true,
            (Wrapped, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Pending => write!(f, "Pending"),
            StageState::Rewritten => write!(f, "Rewritten"),
            StageState::Built => write!(f, "Built"),
            StageState::Fetched => write!(f, "Fetched"),
            StageState::Loaded => write!(f, "Loaded"),
            StageState::Wrapped => write!(f, "Wrapped"),
            StageState::Ready => write!(f, "Ready"),
            StageState::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

impl Default for StageState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_methods() {
        let pending = StageState::Pending;
        assert!(!pending.is_ready());
        assert!(!pending.is_failed());
        assert!(!pending.is_terminal());
        assert_eq!(pending.error_message(), None);

        let ready = StageState::Ready;
        assert!(ready.is_ready());
        assert!(ready.is_terminal());

        let failed = StageState::Failed("compile error".to_string());
        assert!(failed.is_failed());
        assert!(failed.is_terminal());
        assert_eq!(failed.error_message(), Some("compile error"));
    }

    #[test]
    fn test_transitions() {
        use StageState::*;
        let compiled = [Pending, Rewritten, Built, Loaded, Wrapped, Ready];
        for pair in compiled.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Rewritten.can_transition_to(&Fetched));
        assert!(Fetched.can_transition_to(&Loaded));
        assert!(Rewritten.can_transition_to(&Ready));

        assert!(!Pending.can_transition_to(&Loaded));
        assert!(!Loaded.can_transition_to(&Ready));
        assert!(!Ready.can_transition_to(&Failed("late".to_string())));
        assert!(Wrapped.can_transition_to(&Failed("warmup".to_string())));
    }

    #[test]
    fn test_display() {
        assert_eq!(StageState::Wrapped.to_string(), "Wrapped");
        assert_eq!(
            StageState::Failed("missing".to_string()).to_string(),
            "Failed: missing"
        );
        assert_eq!(StageState::default(), StageState::Pending);
    }
}
