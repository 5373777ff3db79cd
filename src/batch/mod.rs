// Batch module - one target state applied to many entities under a policy

pub mod coordinator;

use serde::Serialize;
use std::time::Duration;

use crate::errors::TransitionError;
use crate::machine::state_machine::StateMachine;
use crate::machine::types::TransitionResult;

pub use coordinator::BatchCoordinator;

/// How a batch treats failures and concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Lock everything up front in canonical order, one shared transaction,
    /// first failure rolls back the whole batch
    AtomicSequential,
    /// Each entity coordinated on its own; failures are tallied, never abort
    BestEffortSequential,
    /// Each entity coordinated on a bounded worker pool. With `atomic`, the
    /// first failure stops submission of not-yet-started work; work already
    /// completed is not undone.
    Parallel { max_workers: usize, atomic: bool },
}

/// Result for one entity of a batch
#[derive(Debug, Clone, Serialize)]
pub struct EntityOutcome {
    pub entity_kind: String,
    pub entity_id: String,
    pub success: bool,
    pub result: Option<TransitionResult>,
    pub error: Option<String>,
}

impl EntityOutcome {
    pub(crate) fn from_result(machine: &StateMachine, result: TransitionResult) -> Self {
        Self {
            entity_kind: machine.entity_kind().to_string(),
            entity_id: machine.entity_id(),
            success: result.success,
            error: result.error.clone(),
            result: Some(result),
        }
    }

    pub(crate) fn from_error(machine: &StateMachine, error: &TransitionError) -> Self {
        Self::failed(machine, error.to_string())
    }

    pub(crate) fn failed(machine: &StateMachine, message: String) -> Self {
        Self {
            entity_kind: machine.entity_kind().to_string(),
            entity_id: machine.entity_id(),
            success: false,
            result: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchTransitionResult {
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub duration: Duration,
    pub outcomes: Vec<EntityOutcome>,
    pub errors: Vec<String>,
}

impl BatchTransitionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_outcomes(outcomes: Vec<EntityOutcome>, duration: Duration) -> Self {
        let success_count = outcomes.iter().filter(|o| o.success).count();
        let errors = outcomes
            .iter()
            .filter_map(|o| {
                o.error
                    .as_ref()
                    .map(|e| format!("{}#{}: {}", o.entity_kind, o.entity_id, e))
            })
            .collect();
        Self {
            total_count: outcomes.len(),
            success_count,
            failure_count: outcomes.len() - success_count,
            duration,
            outcomes,
            errors,
        }
    }

    /// `success_count / total_count`, 0 for an empty batch
    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_count as f64
    }

    pub fn all_succeeded(&self) -> bool {
        self.success_count == self.total_count
    }
}
