//! End-to-end tests of pipelines over in-process plugins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeforge::context::{ExecContext, Settings, SubTaskContext, TaskContext};
use pipeforge::error::{TaskError, TaskResult};
use pipeforge::pipeline::{
    Orchestrator, OrchestratorConfig, PipelineError, PipelinePlan, PipelineStatus, TaskSpec,
};
use pipeforge::plugin::{
    entry_point, PluginCloser, PluginDescriptor, PluginRegistry, PluginTask, SubTaskEntryPoint,
    SubTaskMeta, TaskData,
};
use pipeforge::storage::{Database, TaskStatus};
use serde_json::{json, Value};
use tokio::sync::Notify;

type Log = Arc<Mutex<Vec<String>>>;

fn recording(log: &Log) -> SubTaskEntryPoint {
    let log = log.clone();
    entry_point(move |ctx: SubTaskContext| {
        let log = log.clone();
        async move {
            let options = ctx.task_data_as::<Value>()?;
            log.lock().push(format!("{}:{}", ctx.task_id(), ctx.name()));
            let records = options["records"].as_u64().unwrap_or(3);
            ctx.set_progress(0, records);
            ctx.inc_progress(records);
            Ok(())
        }
    })
}

struct GithubPlugin {
    log: Log,
}

#[async_trait]
impl PluginTask for GithubPlugin {
    fn sub_task_metas(&self) -> Vec<SubTaskMeta> {
        vec![
            SubTaskMeta::new("extractIssues", recording(&self.log))
                .with_dependency_tables(["_raw_github_issues"])
                .with_product_tables(["issues"]),
            SubTaskMeta::new("collectIssues", recording(&self.log))
                .with_product_tables(["_raw_github_issues"]),
            SubTaskMeta::new("convertIssues", recording(&self.log))
                .with_dependency_tables(["issues"])
                .with_product_tables(["domain_issues"]),
            SubTaskMeta::new("convertAccounts", recording(&self.log))
                .with_enabled_by_default(false),
            SubTaskMeta::new("prepareRepo", recording(&self.log))
                .with_required(true)
                .with_enabled_by_default(false)
                .with_product_tables(["_raw_github_issues"]),
        ]
    }

    async fn prepare_task_data(&self, _ctx: &TaskContext, options: &Value) -> TaskResult<TaskData> {
        Ok(Arc::new(options.clone()))
    }
}

struct JiraPlugin;

#[async_trait]
impl PluginTask for JiraPlugin {
    fn sub_task_metas(&self) -> Vec<SubTaskMeta> {
        vec![SubTaskMeta::new(
            "collectBoards",
            entry_point(|_ctx: SubTaskContext| async {
                Err(TaskError::Plugin("board endpoint returned garbage".into()))
            }),
        )]
    }

    async fn prepare_task_data(&self, _ctx: &TaskContext, _options: &Value) -> TaskResult<TaskData> {
        Ok(Arc::new(()))
    }
}

struct SlowPlugin {
    started: Arc<Notify>,
}

#[async_trait]
impl PluginTask for SlowPlugin {
    fn sub_task_metas(&self) -> Vec<SubTaskMeta> {
        let started = self.started.clone();
        vec![SubTaskMeta::new(
            "collectForever",
            entry_point(move |ctx: SubTaskContext| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    ctx.cancellation().cancelled().await;
                    Err(TaskError::Cancelled)
                }
            }),
        )]
    }

    async fn prepare_task_data(&self, _ctx: &TaskContext, _options: &Value) -> TaskResult<TaskData> {
        Ok(Arc::new(()))
    }
}

struct CountingCloser(Arc<AtomicUsize>);

#[async_trait]
impl PluginCloser for CountingCloser {
    async fn close(&self, _ctx: &TaskContext) -> TaskResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    db: Database,
    orchestrator: Arc<Orchestrator>,
    log: Log,
    closes: Arc<AtomicUsize>,
    started: Arc<Notify>,
}

async fn fixture(config: OrchestratorConfig) -> Fixture {
    let log: Log = Arc::default();
    let closes = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());

    let mut registry = PluginRegistry::new();
    registry
        .register(
            PluginDescriptor::new("github", Arc::new(GithubPlugin { log: log.clone() }))
                .with_closer(Arc::new(CountingCloser(closes.clone()))),
        )
        .unwrap();
    registry
        .register(
            PluginDescriptor::new("jira", Arc::new(JiraPlugin))
                .with_closer(Arc::new(CountingCloser(closes.clone()))),
        )
        .unwrap();
    registry
        .register(PluginDescriptor::new(
            "slow",
            Arc::new(SlowPlugin {
                started: started.clone(),
            }),
        ))
        .unwrap();

    let db = Database::in_memory().await.unwrap();
    let orchestrator = Orchestrator::new(
        db.clone(),
        Arc::new(registry),
        Arc::new(Settings::default()),
        config,
    )
    .unwrap();

    Fixture {
        db,
        orchestrator: Arc::new(orchestrator),
        log,
        closes,
        started,
    }
}

fn ran_by(log: &Log, task_id: &str) -> Vec<String> {
    let prefix = format!("{}:", task_id);
    log.lock()
        .iter()
        .filter_map(|entry| entry.strip_prefix(&prefix).map(String::from))
        .collect()
}

#[tokio::test]
async fn test_stages_run_in_order_with_sorted_subtasks() {
    let f = fixture(OrchestratorConfig::default().with_max_parallel_tasks(2)).await;
    let plan = PipelinePlan::new(vec![
        vec![
            TaskSpec::new("github").with_options(json!({"records": 5})),
            TaskSpec::new("github").with_subtasks(["convertAccounts"]),
        ],
        vec![TaskSpec::new("github")],
    ]);

    let pipeline = f.orchestrator.create_pipeline("nightly", &plan).await.unwrap();
    let status = f.orchestrator.run_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);

    let record = f.db.get_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(record.status, PipelineStatus::Completed);
    assert_eq!(record.total_tasks, 3);
    assert_eq!(record.finished_tasks, 3);

    let tasks = f.db.list_tasks(&pipeline.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

    let default_task = tasks
        .iter()
        .find(|t| t.stage == 1 && t.subtasks.len() == 4)
        .unwrap();
    assert_eq!(
        ran_by(&f.log, &default_task.id),
        vec!["collectIssues", "prepareRepo", "extractIssues", "convertIssues"]
    );
    assert_eq!(default_task.progress_detail.finished_subtasks, 4);
    assert_eq!(default_task.progress_detail.subtask_number, 4);
    assert_eq!(default_task.progress_detail.subtask_name.as_deref(), Some("convertIssues"));
    assert_eq!(default_task.progress_detail.finished_records, 5);
    assert!((default_task.progress - 1.0).abs() < f64::EPSILON);

    let selected_task = tasks
        .iter()
        .find(|t| t.stage == 1 && t.subtasks.len() == 2)
        .unwrap();
    assert_eq!(
        ran_by(&f.log, &selected_task.id),
        vec!["convertAccounts", "prepareRepo"]
    );

    let subtasks = f.db.list_subtasks(&default_task.id).await.unwrap();
    assert_eq!(subtasks.len(), 4);
    assert!(subtasks.iter().all(|s| s.finished_at.is_some()));
    assert_eq!(subtasks.iter().filter(|s| s.is_collector).count(), 1);

    // Both stage-one tasks finished before stage two started.
    let stage_two = tasks.iter().find(|t| t.stage == 2).unwrap();
    let stage_one_done = tasks
        .iter()
        .filter(|t| t.stage == 1)
        .filter_map(|t| t.finished_at)
        .max()
        .unwrap();
    assert!(stage_two.began_at.unwrap() >= stage_one_done);
}

#[tokio::test]
async fn test_skippable_failure_is_partial() {
    let f = fixture(OrchestratorConfig::default()).await;
    let plan = PipelinePlan::new(vec![
        vec![
            TaskSpec::new("github"),
            TaskSpec::new("jira").with_skip_on_fail(true),
        ],
        vec![TaskSpec::new("github")],
    ]);

    let pipeline = f.orchestrator.create_pipeline("partial", &plan).await.unwrap();
    let status = f.orchestrator.run_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::PartialFail);

    let tasks = f.db.list_tasks(&pipeline.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    let jira = tasks.iter().find(|t| t.plugin == "jira").unwrap();
    assert_eq!(jira.status, TaskStatus::Failed);
    assert_eq!(jira.failed_sub_task.as_deref(), Some("collectBoards"));
    assert!(jira.message.contains("board endpoint returned garbage"));
    assert!(tasks
        .iter()
        .filter(|t| t.plugin == "github")
        .all(|t| t.status == TaskStatus::Completed));

    let record = f.db.get_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(record.finished_tasks, record.total_tasks);
}

#[tokio::test]
async fn test_required_failure_stops_later_stages() {
    let f = fixture(OrchestratorConfig::default()).await;
    let plan = PipelinePlan::new(vec![vec![TaskSpec::new("jira")], vec![TaskSpec::new("github")]]);

    let pipeline = f.orchestrator.create_pipeline("broken", &plan).await.unwrap();
    let status = f.orchestrator.run_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let tasks = f.db.list_tasks(&pipeline.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(f.log.lock().is_empty());

    let record = f.db.get_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(record.finished_tasks, 1);
    assert!(record.message.contains("collectBoards"));
}

#[tokio::test]
async fn test_close_hook_runs_once_per_task() {
    let f = fixture(OrchestratorConfig::default()).await;
    let plan = PipelinePlan::new(vec![vec![
        TaskSpec::new("github"),
        TaskSpec::new("jira").with_skip_on_fail(true),
    ]]);

    let pipeline = f.orchestrator.create_pipeline("closing", &plan).await.unwrap();
    f.orchestrator.run_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(f.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unknown_subtask_fails_task() {
    let f = fixture(OrchestratorConfig::default()).await;
    let plan = PipelinePlan::new(vec![vec![TaskSpec::new("github").with_subtasks(["collectPrs"])]]);

    let pipeline = f.orchestrator.create_pipeline("typo", &plan).await.unwrap();
    let status = f.orchestrator.run_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let tasks = f.db.list_tasks(&pipeline.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert!(tasks[0].message.contains("collectPrs"));
    assert_eq!(f.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_running_pipeline() {
    let f = fixture(OrchestratorConfig::default()).await;
    let plan = PipelinePlan::new(vec![vec![TaskSpec::new("slow")], vec![TaskSpec::new("github")]]);

    let submitted = f.orchestrator.submit("cancelled", &plan).await.unwrap();
    f.started.notified().await;
    assert!(f.orchestrator.cancel(&submitted.id));

    let status = submitted.handle.await.unwrap().unwrap();
    assert_eq!(status, PipelineStatus::Cancelled);

    let record = f.db.get_pipeline(&submitted.id).await.unwrap();
    assert_eq!(record.status, PipelineStatus::Cancelled);
    let tasks = f.db.list_tasks(&submitted.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Cancelled);
    assert!(!f.orchestrator.cancel(&submitted.id));
}

#[tokio::test]
async fn test_fail_fast_stops_siblings() {
    let f = fixture(
        OrchestratorConfig::default()
            .with_fail_fast(true)
            .with_max_parallel_tasks(2),
    )
    .await;
    let plan = PipelinePlan::new(vec![vec![TaskSpec::new("slow"), TaskSpec::new("jira")]]);

    let pipeline = f.orchestrator.create_pipeline("fail-fast", &plan).await.unwrap();
    let status = f.orchestrator.run_pipeline(&pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let tasks = f.db.list_tasks(&pipeline.id).await.unwrap();
    let slow = tasks.iter().find(|t| t.plugin == "slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_plan_is_validated_before_creation() {
    let f = fixture(OrchestratorConfig::default()).await;
    let plan = PipelinePlan::new(vec![vec![TaskSpec::new("gitlab")]]);

    let err = f.orchestrator.create_pipeline("invalid", &plan).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidPlan(ref m) if m.contains("gitlab")));
    assert!(f.db.list_pipelines(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_finished_pipeline_cannot_rerun() {
    let f = fixture(OrchestratorConfig::default()).await;
    let plan = PipelinePlan::new(vec![vec![TaskSpec::new("github")]]);

    let pipeline = f.orchestrator.create_pipeline("once", &plan).await.unwrap();
    f.orchestrator.run_pipeline(&pipeline.id).await.unwrap();
    let err = f.orchestrator.run_pipeline(&pipeline.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotRunnable { .. }));
}
