//! Plugins whose subtasks run in another process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use super::{Invoker, StreamMessage, PLUGIN_INFO_METHOD, RUN_SUBTASK_METHOD};
use crate::context::{settings, ExecContext, SubTaskContext, TaskContext};
use crate::error::{TaskError, TaskResult};
use crate::plugin::{
    entry_point, ApiResource, MigrationScript, PluginDescriptor, PluginTask, SubTaskMeta,
    TaskData,
};
use crate::scheduler::SortStrategy;

/// Answer to the `plugin-info` handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePluginInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub subtask_metas: Vec<RemoteSubTaskInfo>,
    #[serde(default)]
    pub migration_scripts: Vec<MigrationScript>,
    #[serde(default)]
    pub api_resources: Vec<ApiResource>,
    #[serde(default)]
    pub sort_strategy: SortStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSubTaskInfo {
    pub name: String,
    /// Name passed to `run-subtask`; defaults to `name`.
    #[serde(default)]
    pub entry_point_name: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "enabled")]
    pub enabled_by_default: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain_types: Vec<String>,
    #[serde(default)]
    pub dependency_tables: Vec<String>,
    #[serde(default)]
    pub product_tables: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn enabled() -> bool {
    true
}

/// Task data of a remote plugin: the options, passed through untouched.
#[derive(Debug, Clone)]
pub struct RemoteTaskData {
    pub options: Value,
}

struct RemotePluginTask {
    metas: Vec<SubTaskMeta>,
}

#[async_trait]
impl PluginTask for RemotePluginTask {
    fn sub_task_metas(&self) -> Vec<SubTaskMeta> {
        self.metas.clone()
    }

    async fn prepare_task_data(&self, _ctx: &TaskContext, options: &Value) -> TaskResult<TaskData> {
        Ok(Arc::new(RemoteTaskData {
            options: options.clone(),
        }))
    }
}

/// Asks the plugin for its description and wraps it as a descriptor.
pub async fn load_remote_plugin(
    invoker: Arc<dyn Invoker>,
    cancel: &CancellationToken,
) -> TaskResult<PluginDescriptor> {
    let info: RemotePluginInfo = invoker.call(PLUGIN_INFO_METHOD, cancel, &[]).await?.get()?;
    if info.name.trim().is_empty() {
        return Err(TaskError::Plugin("remote plugin reported an empty name".into()));
    }

    let metas = info
        .subtask_metas
        .iter()
        .map(|sub| {
            let invoker = Arc::clone(&invoker);
            let remote_name = sub.entry_point_name.clone().unwrap_or_else(|| sub.name.clone());
            let run = entry_point(move |ctx: SubTaskContext| {
                let invoker = Arc::clone(&invoker);
                let remote_name = remote_name.clone();
                async move { run_remote_subtask(invoker.as_ref(), &ctx, &remote_name).await }
            });
            SubTaskMeta::new(sub.name.clone(), run)
                .with_required(sub.required)
                .with_enabled_by_default(sub.enabled_by_default)
                .with_description(sub.description.clone())
                .with_domain_types(sub.domain_types.clone())
                .depends_on(sub.dependencies.clone())
                .with_dependency_tables(sub.dependency_tables.clone())
                .with_product_tables(sub.product_tables.clone())
        })
        .collect::<Vec<_>>();

    info!(
        plugin = %info.name,
        subtasks = metas.len(),
        migrations = info.migration_scripts.len(),
        "Loaded remote plugin"
    );

    Ok(
        PluginDescriptor::new(info.name, Arc::new(RemotePluginTask { metas }))
            .with_description(info.description)
            .with_api_resources(info.api_resources)
            .with_migration_scripts(info.migration_scripts)
            .with_sort_strategy(info.sort_strategy),
    )
}

/// Runs one subtask through `run-subtask`, applying its progress to `ctx`.
pub async fn run_remote_subtask(
    invoker: &dyn Invoker,
    ctx: &SubTaskContext,
    remote_name: &str,
) -> TaskResult<()> {
    let options = ctx
        .task_data()
        .and_then(|data| data.downcast::<RemoteTaskData>().ok())
        .map(|data| data.options.clone())
        .unwrap_or_else(|| json!({}));
    let call_ctx = json!({
        "task_id": ctx.task_id(),
        "plugin": ctx.plugin(),
        "subtask": ctx.name(),
        "options": options,
        "db_url": ctx.settings().get_str(settings::DB_URL),
    });

    async {
        let mut stream = invoker
            .stream(
                RUN_SUBTASK_METHOD,
                ctx.cancellation(),
                &[call_ctx, Value::String(remote_name.to_string())],
            )
            .await?;
        while let Some(message) = stream.next().await {
            match message? {
                StreamMessage::Progress(progress) => {
                    if progress.total > 0 {
                        ctx.set_progress(progress.current, progress.total);
                    }
                    if progress.increment > 0 {
                        ctx.inc_progress(progress.increment);
                    }
                }
                StreamMessage::Result(data) => debug!(result = %data, "Remote subtask result"),
            }
        }
        Ok::<(), TaskError>(())
    }
    .instrument(ctx.span().clone())
    .await
}
