//! Capability-tagged plugin descriptors and the registry that holds them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::info;

use super::{ApiResource, MigrationScript, PluginCloser, PluginTask};
use crate::error::{TaskError, TaskResult};
use crate::scheduler::SortStrategy;

/// Optional capabilities a plugin may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Close,
    ApiResources,
    Migrations,
}

/// Everything the orchestrator knows about one plugin.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub description: String,
    pub task: Arc<dyn PluginTask>,
    pub closer: Option<Arc<dyn PluginCloser>>,
    pub api_resources: Vec<ApiResource>,
    pub migration_scripts: Vec<MigrationScript>,
    pub sort_strategy: SortStrategy,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, task: Arc<dyn PluginTask>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            task,
            closer: None,
            api_resources: Vec::new(),
            migration_scripts: Vec::new(),
            sort_strategy: SortStrategy::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_closer(mut self, closer: Arc<dyn PluginCloser>) -> Self {
        self.closer = Some(closer);
        self
    }

    pub fn with_api_resources(mut self, resources: Vec<ApiResource>) -> Self {
        self.api_resources = resources;
        self
    }

    pub fn with_migration_scripts(mut self, scripts: Vec<MigrationScript>) -> Self {
        self.migration_scripts = scripts;
        self
    }

    pub fn with_sort_strategy(mut self, strategy: SortStrategy) -> Self {
        self.sort_strategy = strategy;
        self
    }

    /// Optional capabilities present on this descriptor.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.closer.is_some() {
            caps.push(Capability::Close);
        }
        if !self.api_resources.is_empty() {
            caps.push(Capability::ApiResources);
        }
        if !self.migration_scripts.is_empty() {
            caps.push(Capability::Migrations);
        }
        caps
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Checks the descriptor before it is accepted by a registry.
    fn validate(&self) -> TaskResult<()> {
        if self.name.trim().is_empty() {
            return Err(TaskError::BadInput("plugin name must not be empty".into()));
        }

        let metas = self.task.sub_task_metas();
        if metas.is_empty() {
            return Err(TaskError::BadInput(format!(
                "plugin {} declares no subtasks",
                self.name
            )));
        }
        // Duplicate names and cycles surface here instead of at the first run.
        self.sort_strategy.sort(&metas)?;

        let mut versions = HashSet::new();
        for script in &self.migration_scripts {
            if !versions.insert(script.version) {
                return Err(TaskError::BadInput(format!(
                    "plugin {} has duplicate migration version {}",
                    self.name, script.version
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities())
            .field("sort_strategy", &self.sort_strategy)
            .finish_non_exhaustive()
    }
}

/// Named plugins available to one orchestrator.
///
/// Populated at startup and read-only afterwards; share it behind an `Arc`.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and adds a plugin. Names must be unique.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> TaskResult<()> {
        descriptor.validate()?;
        if self.plugins.contains_key(&descriptor.name) {
            return Err(TaskError::BadInput(format!(
                "plugin {} is already registered",
                descriptor.name
            )));
        }
        info!(
            plugin = %descriptor.name,
            capabilities = ?descriptor.capabilities(),
            "Registered plugin"
        );
        self.plugins
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins.get(name).cloned()
    }

    /// Like [`get`](Self::get) but reports a missing plugin as `NotFound`.
    pub fn require(&self, name: &str) -> TaskResult<Arc<PluginDescriptor>> {
        self.get(name)
            .ok_or_else(|| TaskError::NotFound(format!("plugin {}", name)))
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PluginDescriptor>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use crate::plugin::{noop_entry_point, SubTaskMeta, TaskData};
    use async_trait::async_trait;

    struct StaticPlugin(Vec<SubTaskMeta>);

    #[async_trait]
    impl PluginTask for StaticPlugin {
        fn sub_task_metas(&self) -> Vec<SubTaskMeta> {
            self.0.clone()
        }

        async fn prepare_task_data(
            &self,
            _ctx: &TaskContext,
            _options: &serde_json::Value,
        ) -> TaskResult<TaskData> {
            Ok(Arc::new(()))
        }
    }

    fn descriptor(name: &str, metas: Vec<SubTaskMeta>) -> PluginDescriptor {
        PluginDescriptor::new(name, Arc::new(StaticPlugin(metas)))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PluginRegistry::new();
        registry
            .register(descriptor(
                "github",
                vec![SubTaskMeta::new("collectIssues", noop_entry_point())],
            ))
            .unwrap();

        assert_eq!(registry.names(), vec!["github".to_string()]);
        assert!(registry.get("github").is_some());
        assert!(matches!(
            registry.require("gitlab"),
            Err(TaskError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let mut registry = PluginRegistry::new();
        let metas = vec![SubTaskMeta::new("collect", noop_entry_point())];
        registry.register(descriptor("jira", metas.clone())).unwrap();
        let err = registry.register(descriptor("jira", metas)).unwrap_err();
        assert!(matches!(err, TaskError::BadInput(_)));
    }

    #[test]
    fn test_duplicate_subtask_rejected_at_registration() {
        let mut registry = PluginRegistry::new();
        let metas = vec![
            SubTaskMeta::new("collect", noop_entry_point()),
            SubTaskMeta::new("collect", noop_entry_point()),
        ];
        let err = registry.register(descriptor("jira", metas)).unwrap_err();
        assert!(matches!(err, TaskError::Scheduler(_)));
    }

    #[test]
    fn test_capabilities_reflect_optional_parts() {
        let desc = descriptor("gitee", vec![SubTaskMeta::new("a", noop_entry_point())])
            .with_migration_scripts(vec![MigrationScript {
                version: 1,
                name: "init".into(),
                sql: "CREATE TABLE IF NOT EXISTS gitee_repos (id TEXT)".into(),
            }]);
        assert!(desc.has(Capability::Migrations));
        assert!(!desc.has(Capability::Close));
        assert!(!desc.has(Capability::ApiResources));
    }
}
