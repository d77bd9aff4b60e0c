//! Pipeline plans: ordered stages of task specs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PipelineError;
use crate::plugin::PluginRegistry;

/// One plugin invocation inside a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub plugin: String,
    /// Subtasks to run; empty selects the plugin's defaults.
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default = "empty_options")]
    pub options: Value,
    /// A failure of this task does not fail the pipeline.
    #[serde(default)]
    pub skip_on_fail: bool,
}

fn empty_options() -> Value {
    Value::Object(Default::default())
}

impl TaskSpec {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            subtasks: Vec::new(),
            options: empty_options(),
            skip_on_fail: false,
        }
    }

    pub fn with_subtasks<I, S>(mut self, subtasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subtasks = subtasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_skip_on_fail(mut self, skip_on_fail: bool) -> Self {
        self.skip_on_fail = skip_on_fail;
        self
    }
}

/// Stages run one after another; tasks of a stage run concurrently.
///
/// Serialized as a bare array of stages:
///
/// ```json
/// [[{"plugin": "github", "options": {"repo": "a/b"}}], [{"plugin": "dora"}]]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelinePlan {
    pub stages: Vec<Vec<TaskSpec>>,
}

impl PipelinePlan {
    pub fn new(stages: Vec<Vec<TaskSpec>>) -> Self {
        Self { stages }
    }

    pub fn total_tasks(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text).map_err(|e| PipelineError::InvalidPlan(e.to_string()))
    }

    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(text).map_err(|e| PipelineError::InvalidPlan(e.to_string()))
    }

    /// Checks the plan's shape and that every plugin is registered.
    pub fn validate(&self, registry: &PluginRegistry) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidPlan("plan has no stages".into()));
        }
        for (number, stage) in self.stages.iter().enumerate() {
            if stage.is_empty() {
                return Err(PipelineError::InvalidPlan(format!(
                    "stage {} has no tasks",
                    number + 1
                )));
            }
            for spec in stage {
                if registry.get(&spec.plugin).is_none() {
                    return Err(PipelineError::InvalidPlan(format!(
                        "unknown plugin '{}' in stage {}",
                        spec.plugin,
                        number + 1
                    )));
                }
                if !(spec.options.is_object() || spec.options.is_null()) {
                    return Err(PipelineError::InvalidPlan(format!(
                        "options of plugin '{}' must be an object",
                        spec.plugin
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{noop_entry_point, PluginDescriptor, PluginTask, SubTaskMeta, TaskData};
    use crate::context::TaskContext;
    use crate::error::TaskResult;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl PluginTask for Noop {
        fn sub_task_metas(&self) -> Vec<SubTaskMeta> {
            vec![SubTaskMeta::new("collectThings", noop_entry_point())]
        }

        async fn prepare_task_data(&self, _: &TaskContext, _: &Value) -> TaskResult<TaskData> {
            Ok(Arc::new(()))
        }
    }

    #[test]
    fn test_parse_json_and_yaml() {
        let plan = PipelinePlan::from_json(
            r#"[[{"plugin":"github","options":{"repo":"a/b"}},{"plugin":"jira","skip_on_fail":true}],[{"plugin":"dora","subtasks":["calculate"]}]]"#,
        )
        .unwrap();
        assert_eq!(plan.total_tasks(), 3);
        assert!(plan.stages[0][1].skip_on_fail);
        assert_eq!(plan.stages[0][1].options, serde_json::json!({}));
        assert_eq!(plan.stages[1][0].subtasks, vec!["calculate"]);

        let yaml = "- - plugin: github\n    options:\n      repo: a/b\n- - plugin: dora\n";
        let from_yaml = PipelinePlan::from_yaml(yaml).unwrap();
        assert_eq!(from_yaml.stages[0][0].options["repo"], "a/b");
        assert_eq!(from_yaml.total_tasks(), 2);

        assert!(matches!(
            PipelinePlan::from_json(r#"{"stages":1}"#),
            Err(PipelineError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_validate_against_registry() {
        let mut registry = PluginRegistry::new();
        registry
            .register(PluginDescriptor::new("github", Arc::new(Noop)))
            .unwrap();

        let ok = PipelinePlan::new(vec![vec![TaskSpec::new("github")]]);
        assert!(ok.validate(&registry).is_ok());

        let unknown = PipelinePlan::new(vec![vec![TaskSpec::new("gitlab")]]);
        assert!(unknown.validate(&registry).is_err());

        let empty_stage = PipelinePlan::new(vec![vec![]]);
        assert!(empty_stage.validate(&registry).is_err());

        let bad_options =
            PipelinePlan::new(vec![vec![TaskSpec::new("github").with_options(serde_json::json!([1]))]]);
        assert!(bad_options.validate(&registry).is_err());
    }
}
