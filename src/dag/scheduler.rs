//! Topological ordering of pending features.

use crate::dag::builder::DagBuilder;
use crate::errors::OrchestratorError;
use crate::roadmap::{Complexity, FeatureSpec};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// A feature ready to be built, in build order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledFeature {
    pub id: u32,
    pub name: String,
    pub complexity: Complexity,
}

impl From<&FeatureSpec> for ScheduledFeature {
    fn from(spec: &FeatureSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name.clone(),
            complexity: spec.complexity,
        }
    }
}

/// Compute the build order for the pending features of a roadmap.
///
/// Cycle detection runs over the whole roadmap first and is fatal. Then
/// Kahn's algorithm runs over the pending-only subgraph: deps on done
/// features are satisfied and dropped, deps on other pending features count
/// toward in-degree, and deps on anything else (blocked, in progress,
/// unknown) are ignored. Ties follow table order.
pub fn schedule(features: &[FeatureSpec]) -> Result<Vec<ScheduledFeature>> {
    let graph = DagBuilder::new(features.to_vec()).build()?;

    let pending: Vec<&FeatureSpec> = graph.features().iter().filter(|f| f.is_pending()).collect();
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let position: HashMap<u32, usize> = pending.iter().enumerate().map(|(i, f)| (f.id, i)).collect();

    let mut in_degree = vec![0usize; pending.len()];
    // dependency position -> dependents, in table order
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); pending.len()];

    for (i, feature) in pending.iter().enumerate() {
        for dep in &feature.deps {
            if let Some(&dep_pos) = position.get(dep) {
                in_degree[i] += 1;
                dependents[dep_pos].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..pending.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(pending.len());

    while let Some(current) = queue.pop_front() {
        order.push(ScheduledFeature::from(pending[current]));
        for &dependent in &dependents[current] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != pending.len() {
        // Unreachable after the full-graph check, kept as Kahn's own signal.
        let stuck: Vec<String> = (0..pending.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| pending[i].id.to_string())
            .collect();
        return Err(OrchestratorError::CircularDependency { cycle: stuck }.into());
    }

    debug!(count = order.len(), "computed build order");
    Ok(order)
}
