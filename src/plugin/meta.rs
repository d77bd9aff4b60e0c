//! Static subtask descriptors.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::SubTaskContext;
use crate::error::TaskResult;

/// Entry point of a subtask.
///
/// Receives the forked [`SubTaskContext`] and runs the subtask to completion.
pub type SubTaskEntryPoint =
    Arc<dyn Fn(SubTaskContext) -> BoxFuture<'static, TaskResult<()>> + Send + Sync>;

/// Builds a [`SubTaskEntryPoint`] from an async function or closure.
pub fn entry_point<F, Fut>(f: F) -> SubTaskEntryPoint
where
    F: Fn(SubTaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Descriptor of one unit of work offered by a plugin.
///
/// Ordering is expressed either with explicit `dependencies` (names of other
/// subtasks of the same plugin) or implicitly through the tables a subtask
/// reads (`dependency_tables`) and writes (`product_tables`).
#[derive(Clone)]
pub struct SubTaskMeta {
    pub name: String,
    pub entry_point: SubTaskEntryPoint,
    /// Always executed, even when not selected by the caller.
    pub required: bool,
    /// Executed when the caller does not select subtasks explicitly.
    pub enabled_by_default: bool,
    pub description: String,
    pub domain_types: Vec<String>,
    pub dependencies: Vec<String>,
    pub dependency_tables: Vec<String>,
    pub product_tables: Vec<String>,
}

impl SubTaskMeta {
    /// Creates an enabled-by-default, non-required subtask.
    pub fn new(name: impl Into<String>, entry_point: SubTaskEntryPoint) -> Self {
        Self {
            name: name.into(),
            entry_point,
            required: false,
            enabled_by_default: true,
            description: String::new(),
            domain_types: Vec::new(),
            dependencies: Vec::new(),
            dependency_tables: Vec::new(),
            product_tables: Vec::new(),
        }
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_enabled_by_default(mut self, enabled: bool) -> Self {
        self.enabled_by_default = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_domain_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Adds explicit predecessors by name.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_dependency_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_product_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.product_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Collect subtasks are recognised by name prefix.
    pub fn is_collector(&self) -> bool {
        self.name.starts_with("collect") || self.name.starts_with("Collect")
    }
}

impl fmt::Debug for SubTaskMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTaskMeta")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("dependencies", &self.dependencies)
            .field("dependency_tables", &self.dependency_tables)
            .field("product_tables", &self.product_tables)
            .finish_non_exhaustive()
    }
}

/// Entry point that does nothing; handy for metas used only for ordering.
pub fn noop_entry_point() -> SubTaskEntryPoint {
    entry_point(|_ctx| async { Ok(()) })
}
