//! Dependency-aware scheduling of roadmap features.
//!
//! Two passes over the roadmap:
//!
//! 1. **Builder** - indexes every feature (any status) and rejects graphs
//!    with a dependency cycle, reporting the full cycle path.
//! 2. **Scheduler** - takes only the pending features, drops edges to
//!    features that are already done, and emits a topological order with
//!    ties broken by table order.
//!
//! Identical input always yields identical output: resume matches features
//! by name across runs, so the order must be reproducible.
//!
//! ## Example
//!
//! ```
//! use autosdd::dag::schedule;
//! use autosdd::roadmap::{Complexity, FeatureSpec, FeatureStatus};
//!
//! let features = vec![
//!     FeatureSpec::new(1, "Auth", Complexity::Small, [], FeatureStatus::Pending),
//!     FeatureSpec::new(2, "Dashboard", Complexity::Large, [1], FeatureStatus::Pending),
//! ];
//! let order = schedule(&features).unwrap();
//! assert_eq!(order.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2]);
//! ```

mod builder;
mod scheduler;

pub use builder::{DagBuilder, FeatureGraph, FeatureIndex};
pub use scheduler::{ScheduledFeature, schedule};
