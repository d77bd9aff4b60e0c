//! Subtask dependency scheduling.
//!
//! Turns the unordered subtask metas of a plugin into the order a task runs
//! them in. Three strategies share one deterministic Kahn core:
//!
//! - **Direct**: edges come from each meta's explicit `dependencies`
//! - **Table**: an edge A→B exists when B reads a table A produces
//! - **DependencyAndProduct**: a meta waits for tables rather than metas and
//!   becomes ready once every producer of each table it reads has run
//!
//! Every ready set is appended in name order, so two runs over the same
//! metas always agree. Duplicate names are rejected before ordering starts
//! and a cycle is reported with the names left unresolved.
//!
//! ```text
//!   metas ──► duplicate check ──► blocking sets ──► Kahn passes ──► ordered metas
//!                                                       │
//!                                                       └─► CyclicDependency
//! ```
//!
//! The table strategy is the default for new plugins. Plugins still written
//! with explicit `dependencies` select [`SortStrategy::Direct`] on their
//! descriptor until their metas declare tables.

mod sort;
mod topo;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plugin::SubTaskMeta;

pub use sort::{sort_by_dependencies, sort_by_dependency_and_product, sort_by_tables};

/// Errors raised while ordering subtask metas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("duplicate subtask name: {0}")]
    DuplicateName(String),

    #[error("cyclic dependency detected among subtasks: {}", .unresolved.join(", "))]
    CyclicDependency { unresolved: Vec<String> },
}

/// Strategy used to order a plugin's subtasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortStrategy {
    Direct,
    #[default]
    Table,
    DependencyAndProduct,
}

impl SortStrategy {
    pub fn sort(&self, metas: &[SubTaskMeta]) -> Result<Vec<SubTaskMeta>, SchedulerError> {
        match self {
            SortStrategy::Direct => sort_by_dependencies(metas),
            SortStrategy::Table => sort_by_tables(metas),
            SortStrategy::DependencyAndProduct => sort_by_dependency_and_product(metas),
        }
    }
}

impl std::fmt::Display for SortStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortStrategy::Direct => write!(f, "direct"),
            SortStrategy::Table => write!(f, "table"),
            SortStrategy::DependencyAndProduct => write!(f, "dependency_and_product"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_is_table() {
        assert_eq!(SortStrategy::default(), SortStrategy::Table);
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let s: SortStrategy = serde_json::from_str("\"dependency_and_product\"").unwrap();
        assert_eq!(s, SortStrategy::DependencyAndProduct);
        assert_eq!(s.to_string(), "dependency_and_product");
    }

    #[test]
    fn test_cycle_error_display() {
        let err = SchedulerError::CyclicDependency {
            unresolved: vec!["D".into(), "E".into()],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency detected among subtasks: D, E"
        );
    }
}
