//! DAG builder for constructing dependency graphs from roadmap rows.
//!
//! The builder indexes every feature regardless of status and validates that
//! the full graph is acyclic.

use crate::errors::OrchestratorError;
use crate::roadmap::FeatureSpec;
use anyhow::{Result, bail};
use std::collections::HashMap;
use tracing::warn;

/// Index into the feature list.
pub type FeatureIndex = usize;

/// A directed graph of features, edges pointing from a feature to its deps.
#[derive(Debug)]
pub struct FeatureGraph {
    /// Features in table order
    features: Vec<FeatureSpec>,
    /// Map from feature id to index
    index_map: HashMap<u32, FeatureIndex>,
    /// index -> indices it depends on, in ascending id order
    dependencies: Vec<Vec<FeatureIndex>>,
}

impl FeatureGraph {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn get(&self, index: FeatureIndex) -> Option<&FeatureSpec> {
        self.features.get(index)
    }

    pub fn index_of(&self, id: u32) -> Option<FeatureIndex> {
        self.index_map.get(&id).copied()
    }

    /// Features the given feature depends on.
    pub fn dependencies(&self, index: FeatureIndex) -> &[FeatureIndex] {
        self.dependencies.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Find a dependency cycle with an iterative three-state DFS.
    ///
    /// Returns the cycle as a list of feature ids whose first and last entry
    /// are the same node, e.g. `[2, 4, 3, 2]`.
    pub fn find_cycle(&self) -> Option<Vec<u32>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.len()];

        for start in 0..self.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }

            // (node, next edge to follow)
            let mut stack: Vec<(FeatureIndex, usize)> = vec![(start, 0)];
            marks[start] = Mark::InProgress;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let deps = self.dependencies(node);
                if top.1 >= deps.len() {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                }

                let next = deps[top.1];
                top.1 += 1;

                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::InProgress => {
                        let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut cycle: Vec<u32> = stack[from..]
                            .iter()
                            .map(|&(n, _)| self.features[n].id)
                            .collect();
                        cycle.push(self.features[next].id);
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            }
        }

        None
    }
}

/// Builder for constructing feature graphs.
pub struct DagBuilder {
    features: Vec<FeatureSpec>,
}

impl DagBuilder {
    pub fn new(features: Vec<FeatureSpec>) -> Self {
        Self { features }
    }

    /// Build the graph.
    ///
    /// Fails on duplicate ids and on any dependency cycle. Deps naming ids
    /// that are not in the roadmap are logged and ignored.
    pub fn build(self) -> Result<FeatureGraph> {
        let mut index_map = HashMap::new();
        for (i, feature) in self.features.iter().enumerate() {
            if index_map.insert(feature.id, i).is_some() {
                bail!("Duplicate feature id in roadmap: {}", feature.id);
            }
        }

        let dependencies = self
            .features
            .iter()
            .map(|feature| {
                feature
                    .deps
                    .iter()
                    .filter_map(|dep| {
                        let idx = index_map.get(dep).copied();
                        if idx.is_none() {
                            warn!(feature = feature.id, dep, "dependency on unknown feature ignored");
                        }
                        idx
                    })
                    .collect()
            })
            .collect();

        let graph = FeatureGraph {
            features: self.features,
            index_map,
            dependencies,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(OrchestratorError::CircularDependency {
                cycle: cycle.iter().map(u32::to_string).collect(),
            }
            .into());
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roadmap::{Complexity, FeatureStatus};

    fn feature(id: u32, deps: Vec<u32>, status: FeatureStatus) -> FeatureSpec {
        FeatureSpec::new(id, format!("Feature {id}"), Complexity::Medium, deps, status)
    }

    fn cycle_of(err: anyhow::Error) -> Vec<String> {
        match err.downcast::<OrchestratorError>() {
            Ok(OrchestratorError::CircularDependency { cycle }) => cycle,
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_build_simple_graph() {
        let graph = DagBuilder::new(vec![
            feature(1, vec![], FeatureStatus::Done),
            feature(2, vec![1], FeatureStatus::Pending),
            feature(3, vec![1, 2], FeatureStatus::Pending),
        ])
        .build()
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies(2), &[0, 1]);
        assert_eq!(graph.index_of(2), Some(1));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let result = DagBuilder::new(vec![
            feature(2, vec![4], FeatureStatus::Pending),
            feature(3, vec![2], FeatureStatus::Pending),
            feature(4, vec![3], FeatureStatus::Pending),
        ])
        .build();

        assert_eq!(cycle_of(result.unwrap_err()), vec!["2", "4", "3", "2"]);
    }

    #[test]
    fn test_cycle_through_done_features_still_fatal() {
        let result = DagBuilder::new(vec![
            feature(1, vec![2], FeatureStatus::Done),
            feature(2, vec![1], FeatureStatus::Done),
        ])
        .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let result = DagBuilder::new(vec![feature(7, vec![7], FeatureStatus::Pending)]).build();
        assert_eq!(cycle_of(result.unwrap_err()), vec!["7", "7"]);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let graph = DagBuilder::new(vec![
            feature(1, vec![], FeatureStatus::Pending),
            feature(2, vec![1], FeatureStatus::Pending),
            feature(3, vec![1], FeatureStatus::Pending),
            feature(4, vec![2, 3], FeatureStatus::Pending),
        ])
        .build()
        .unwrap();
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_unknown_dependency_ignored() {
        let graph = DagBuilder::new(vec![feature(1, vec![99], FeatureStatus::Pending)])
            .build()
            .unwrap();
        assert!(graph.dependencies(0).is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = DagBuilder::new(vec![
            feature(1, vec![], FeatureStatus::Pending),
            feature(1, vec![], FeatureStatus::Pending),
        ])
        .build();
        assert!(result.unwrap_err().to_string().contains("Duplicate"));
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
    }
}
