//! Stage lifecycle tracking
//!
//! Records the [`StageState`] of every stage of a pipeline and rejects
//! transitions the state machine does not allow. Every transition is logged.

use std::collections::BTreeMap;

use dashmap::DashMap;
use tracing::{info, warn};

use common::error::{Error, Result};

use crate::state::StageState;

/// Lifecycle of the stages of one pipeline
#[derive(Debug, Default)]
pub struct StageLifecycle {
    /// Current state per stage
    states: DashMap<String, StageState>,
}

impl StageLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `stage` in the pending state
    pub fn register(&self, stage: &str) -> Result<()> {
        if self.states.contains_key(stage) {
            return Err(Error::InvalidArgument(format!(
                "stage {} is registered twice",
                stage
            )));
        }
        self.states.insert(stage.to_string(), StageState::Pending);
        Ok(())
    }

    pub fn state(&self, stage: &str) -> Option<StageState> {
        self.states.get(stage).map(|s| s.clone())
    }

    /// Moves `stage` to `next`
    pub fn transition(&self, stage: &str, next: StageState) -> Result<()> {
        let mut current = self
            .states
            .get_mut(stage)
            .ok_or_else(|| Error::NotFound(format!("stage {}", stage)))?;

        if !current.can_transition_to(&next) {
            return Err(Error::Internal(format!(
                "stage {} cannot move from {} to {}",
                stage, *current, next
            )));
        }

        match &next {
            StageState::Failed(reason) => warn!("Stage {}: {} -> Failed ({})", stage, *current, reason),
            _ => info!("Stage {}: {} -> {}", stage, *current, next),
        }
        *current = next;
        Ok(())
    }

    /// Marks `stage` failed unless it already reached a terminal state
    pub fn fail(&self, stage: &str, error: &Error) {
        let failed = StageState::Failed(error.to_string());
        if let Err(e) = self.transition(stage, failed) {
            warn!("Could not record failure of stage {}: {}", stage, e);
        }
    }

    /// States of all stages, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, StageState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Returns true if every registered stage is ready
    pub fn all_ready(&self) -> bool {
        self.states.iter().all(|entry| entry.value().is_ready())
    }
}
