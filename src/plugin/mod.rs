//! Plugin model.
//!
//! A plugin is a named, stateless provider of subtasks for one data source.
//! Its capabilities are carried by a [`PluginDescriptor`]: the mandatory
//! [`PluginTask`] implementation plus optional close hook, API resources and
//! migration scripts. Descriptors live in an explicit [`PluginRegistry`] owned
//! by whoever builds the orchestrator.

mod meta;
mod registry;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::TaskContext;
use crate::error::{TaskError, TaskResult};

pub use meta::{entry_point, noop_entry_point, SubTaskEntryPoint, SubTaskMeta};
pub use registry::{Capability, PluginDescriptor, PluginRegistry};

/// Opaque per-task value shared by all subtasks of a task.
pub type TaskData = Arc<dyn Any + Send + Sync>;

/// Downcasts shared task data to the plugin's concrete type.
pub fn downcast_task_data<T: Any + Send + Sync>(data: TaskData) -> TaskResult<Arc<T>> {
    data.downcast::<T>().map_err(|_| {
        TaskError::Plugin(format!(
            "task data is not of type {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Core capability every plugin provides.
#[async_trait]
pub trait PluginTask: Send + Sync {
    /// Every subtask the plugin can run, in no particular order.
    fn sub_task_metas(&self) -> Vec<SubTaskMeta>;

    /// Turns raw task options into the data shared by the task's subtasks.
    async fn prepare_task_data(
        &self,
        ctx: &TaskContext,
        options: &serde_json::Value,
    ) -> TaskResult<TaskData>;
}

/// Optional hook invoked once per task after its subtasks finish.
#[async_trait]
pub trait PluginCloser: Send + Sync {
    async fn close(&self, ctx: &TaskContext) -> TaskResult<()>;
}

/// HTTP sub-resource a plugin exposes to the (external) API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResource {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub description: String,
}

/// Versioned schema change owned by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationScript {
    pub version: u64,
    pub name: String,
    pub sql: String,
}
