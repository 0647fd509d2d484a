//! Dependency-layering planner.
//!
//! Orders tasks into phases with a layered topological sort (Kahn's
//! algorithm): a phase holds every task whose in-set dependencies all sit
//! in earlier phases. Dependencies on ids outside the task set are treated
//! as already satisfied and reported in [`Plan::dependencies`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::info;

use super::{BoxFuture, Planner};
use crate::models::plan::Plan;
use crate::models::task::{Task, TaskComplexity};
use crate::{AppError, Result};

/// Planner that derives phases from task dependencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyPlanner;

impl DependencyPlanner {
    /// Build a plan synchronously.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidPlan` on duplicate ids or a dependency cycle.
    pub fn plan(goal: &str, tasks: Vec<Task>) -> Result<Plan> {
        let index: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        if index.len() != tasks.len() {
            return Err(AppError::InvalidPlan("duplicate task ids".into()));
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut external: BTreeSet<String> = BTreeSet::new();

        for task in &tasks {
            let mut degree = 0;
            for dep in &task.dependencies {
                if index.contains_key(dep.as_str()) {
                    degree += 1;
                    dependents.entry(dep.as_str()).or_default().push(&task.id);
                } else {
                    external.insert(dep.clone());
                }
            }
            in_degree.insert(&task.id, degree);
        }

        let mut ready: VecDeque<&str> = tasks
            .iter()
            .filter(|t| in_degree.get(t.id.as_str()) == Some(&0))
            .map(|t| t.id.as_str())
            .collect();

        let mut execution_order: Vec<Vec<String>> = Vec::new();
        let mut placed = 0usize;

        while !ready.is_empty() {
            let mut phase: Vec<&Task> = ready
                .drain(..)
                .filter_map(|id| index.get(id).copied())
                .collect();
            phase.sort_by_key(|t| (Reverse(t.priority), t.id.clone()));

            for task in &phase {
                if let Some(children) = dependents.get(task.id.as_str()) {
                    for child in children {
                        if let Some(degree) = in_degree.get_mut(child) {
                            *degree -= 1;
                            if *degree == 0 {
                                ready.push_back(*child);
                            }
                        }
                    }
                }
            }

            placed += phase.len();
            execution_order.push(phase.into_iter().map(|t| t.id.clone()).collect());
        }

        if placed != tasks.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(AppError::InvalidPlan(format!(
                "dependency cycle among tasks: {}",
                stuck.join(", ")
            )));
        }

        let risks = tasks
            .iter()
            .filter(|t| t.complexity == TaskComplexity::Complex)
            .map(|t| format!("task {} is complex: {}", t.id, t.title))
            .collect();
        let estimated_minutes = tasks.iter().map(|t| t.estimated_minutes).sum();

        let plan = Plan {
            goal: goal.to_owned(),
            high_level_plan: format!(
                "{} task(s) in {} phase(s)",
                tasks.len(),
                execution_order.len()
            ),
            tasks,
            execution_order,
            estimated_minutes,
            risks,
            dependencies: external.into_iter().collect(),
        };

        info!(
            tasks = plan.tasks.len(),
            phases = plan.execution_order.len(),
            "plan created"
        );

        Ok(plan)
    }
}

impl Planner for DependencyPlanner {
    fn create_plan(&self, goal: &str, tasks: Vec<Task>) -> BoxFuture<'_, Result<Plan>> {
        let result = Self::plan(goal, tasks);
        Box::pin(async move { result })
    }
}
