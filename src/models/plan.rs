//! Execution plan model.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::task::Task;
use crate::{AppError, Result};

/// An ordered set of phases covering a task set.
///
/// Tasks within one phase may run in any relative order; every task in a
/// phase finishes before the next phase starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Plan {
    /// Goal the plan was built for.
    pub goal: String,
    /// Human summary of the approach.
    #[serde(default)]
    pub high_level_plan: String,
    /// Every task the plan covers.
    pub tasks: Vec<Task>,
    /// Phases of task ids, executed strictly in order.
    pub execution_order: Vec<Vec<String>>,
    /// Total estimated time in minutes.
    #[serde(default)]
    pub estimated_minutes: u32,
    /// Known risks.
    #[serde(default)]
    pub risks: Vec<String>,
    /// External prerequisites (tools, services, approvals).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Plan {
    /// Check the structural invariants of the plan.
    ///
    /// Every id in `execution_order` must name a task in `tasks`, and no id
    /// may appear in more than one phase (or twice in the same phase).
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidPlan` naming the first offending id.
    pub fn validate(&self) -> Result<()> {
        let known: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        let mut scheduled: HashSet<&str> = HashSet::new();

        for (index, phase) in self.execution_order.iter().enumerate() {
            for id in phase {
                if !known.contains(id.as_str()) {
                    return Err(AppError::InvalidPlan(format!(
                        "phase {index} references unknown task {id}"
                    )));
                }
                if !scheduled.insert(id.as_str()) {
                    return Err(AppError::InvalidPlan(format!(
                        "task {id} is scheduled more than once"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Number of tasks that appear in some phase.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.execution_order.iter().map(Vec::len).sum()
    }
}
