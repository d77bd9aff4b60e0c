//! Stage-by-stage pipeline execution.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::context::Settings;
use crate::plugin::PluginRegistry;
use crate::storage::{Database, NewTask, PipelineRecord, PipelineStatus, TaskStatus};

use super::config::OrchestratorConfig;
use super::plan::{PipelinePlan, TaskSpec};
use super::runner::{TaskOutcome, TaskRunner};
use super::PipelineError;

/// Aggregates task outcomes into the pipeline's terminal status.
///
/// Each entry is a task's status and whether it was marked skip-on-fail.
pub fn compute_pipeline_status(tasks: &[(TaskStatus, bool)], cancelled: bool) -> PipelineStatus {
    if cancelled || tasks.iter().any(|(s, _)| *s == TaskStatus::Cancelled) {
        return PipelineStatus::Cancelled;
    }

    let mut failed = tasks.iter().filter(|(s, _)| *s == TaskStatus::Failed).peekable();
    if failed.peek().is_none() {
        return PipelineStatus::Completed;
    }

    let all_skippable = failed.all(|(_, skip)| *skip);
    let any_completed = tasks.iter().any(|(s, _)| *s == TaskStatus::Completed);
    if all_skippable && any_completed {
        PipelineStatus::PartialFail
    } else {
        PipelineStatus::Failed
    }
}

/// Handle to a pipeline running in the background.
pub struct SubmittedPipeline {
    pub id: String,
    pub handle: JoinHandle<Result<PipelineStatus, PipelineError>>,
}

/// Runs pipelines: stages in order, tasks of a stage concurrently.
pub struct Orchestrator {
    db: Database,
    registry: Arc<PluginRegistry>,
    runner: TaskRunner,
    config: OrchestratorConfig,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        registry: Arc<PluginRegistry>,
        settings: Arc<Settings>,
        config: OrchestratorConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let runner = TaskRunner::new(db.clone(), settings)
            .with_progress_capacity(config.progress_capacity);
        Ok(Self {
            db,
            registry,
            runner,
            config,
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validates `plan` and stores it as a new pipeline in `Created` state.
    pub async fn create_pipeline(
        &self,
        name: &str,
        plan: &PipelinePlan,
    ) -> Result<PipelineRecord, PipelineError> {
        plan.validate(&self.registry)?;
        let record = self.db.create_pipeline(name, plan, None).await?;
        info!(
            pipeline_id = %record.id,
            name,
            stages = plan.stages.len(),
            tasks = plan.total_tasks(),
            "Pipeline created"
        );
        Ok(record)
    }

    /// Creates the pipeline and runs it on a background task.
    pub async fn submit(
        self: &Arc<Self>,
        name: &str,
        plan: &PipelinePlan,
    ) -> Result<SubmittedPipeline, PipelineError> {
        let record = self.create_pipeline(name, plan).await?;
        let cancel = self.register(&record.id)?;
        let this = Arc::clone(self);
        let id = record.id.clone();
        let handle = tokio::spawn(async move { this.drive(&id, cancel).await });
        Ok(SubmittedPipeline {
            id: record.id,
            handle,
        })
    }

    /// Runs a `Created` pipeline to its terminal state.
    pub async fn run_pipeline(&self, id: &str) -> Result<PipelineStatus, PipelineError> {
        let cancel = self.register(id)?;
        self.drive(id, cancel).await
    }

    /// Requests cooperative cancellation. Returns false if the pipeline is not running here.
    pub fn cancel(&self, id: &str) -> bool {
        match self.running.lock().get(id) {
            Some(token) => {
                info!(pipeline_id = %id, "Cancelling pipeline");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of pipelines currently running in this orchestrator.
    pub fn running_pipelines(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }

    fn register(&self, id: &str) -> Result<CancellationToken, PipelineError> {
        let mut running = self.running.lock();
        if running.contains_key(id) {
            return Err(PipelineError::AlreadyRunning(id.to_string()));
        }
        let token = CancellationToken::new();
        running.insert(id.to_string(), token.clone());
        Ok(token)
    }

    async fn drive(&self, id: &str, cancel: CancellationToken) -> Result<PipelineStatus, PipelineError> {
        let span = info_span!("pipeline", pipeline_id = %id);
        let result = self.execute(id, &cancel).instrument(span).await;
        self.running.lock().remove(id);
        if let Err(e) = &result {
            if !matches!(e, PipelineError::NotRunnable { .. }) {
                error!(pipeline_id = %id, error = %e, "Pipeline aborted");
                // Already terminal pipelines reject the write; nothing else to do then.
                let _ = self
                    .db
                    .finish_pipeline(id, PipelineStatus::Failed, &e.to_string(), Utc::now())
                    .await;
            }
        }
        result
    }

    async fn execute(&self, id: &str, cancel: &CancellationToken) -> Result<PipelineStatus, PipelineError> {
        let record = self.db.get_pipeline(id).await?;
        if record.status != PipelineStatus::Created {
            return Err(PipelineError::NotRunnable {
                id: id.to_string(),
                status: record.status,
            });
        }
        self.db.mark_pipeline_running(id, Utc::now()).await?;
        info!(stages = record.plan.stages.len(), "Pipeline started");

        let mut finished: Vec<(TaskStatus, bool)> = Vec::new();
        let mut message = String::new();

        for (index, stage) in record.plan.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let stage_number = index as u32 + 1;
            let results = self
                .run_stage(id, stage_number, stage, cancel)
                .instrument(info_span!("stage", number = stage_number))
                .await?;

            let blocking = results
                .iter()
                .find(|(outcome, skip)| outcome.status == TaskStatus::Failed && !skip);
            if let Some((outcome, _)) = blocking {
                message = format!(
                    "stage {} task {} failed: {}",
                    stage_number, outcome.task_id, outcome.message
                );
            }
            let halt = blocking.is_some();
            finished.extend(results.iter().map(|(o, skip)| (o.status, *skip)));

            if halt {
                warn!(stage = stage_number, "Stage failed, later stages are skipped");
                break;
            }
        }

        let status = compute_pipeline_status(&finished, cancel.is_cancelled());
        if status == PipelineStatus::Cancelled && message.is_empty() {
            message = "pipeline cancelled".to_string();
        }
        self.db.finish_pipeline(id, status, &message, Utc::now()).await?;

        match status {
            PipelineStatus::Completed | PipelineStatus::PartialFail => {
                info!(status = %status, tasks = finished.len(), "Pipeline finished")
            }
            _ => warn!(status = %status, tasks = finished.len(), error = %message, "Pipeline finished"),
        }
        Ok(status)
    }

    /// Runs one stage; returns each task's outcome with its skip-on-fail flag.
    async fn run_stage(
        &self,
        pipeline_id: &str,
        stage_number: u32,
        specs: &[TaskSpec],
        cancel: &CancellationToken,
    ) -> Result<Vec<(TaskOutcome, bool)>, PipelineError> {
        let stage_cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_tasks));
        let mut join_set = JoinSet::new();

        for spec in specs {
            let plugin = self.registry.require(&spec.plugin)?;
            let task = self
                .db
                .create_task(&NewTask {
                    pipeline_id: pipeline_id.to_string(),
                    stage: stage_number,
                    plugin: spec.plugin.clone(),
                    options: spec.options.clone(),
                    subtasks: spec.subtasks.clone(),
                    skip_on_fail: spec.skip_on_fail,
                })
                .await?;

            let runner = self.runner.clone();
            let semaphore = Arc::clone(&semaphore);
            let token = stage_cancel.child_token();
            let skip = spec.skip_on_fail;
            join_set.spawn(
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::Join(e.to_string()))?;
                    let outcome = runner.run(&task, &plugin, token).await?;
                    Ok::<_, PipelineError>((outcome, skip))
                }
                .in_current_span(),
            );
        }

        let mut results = Vec::with_capacity(specs.len());
        let mut first_error = None;
        let mut tripped = false;
        while let Some(joined) = join_set.join_next().await {
            let (mut outcome, skip) = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!(error = %e, "Task bookkeeping failed");
                    first_error.get_or_insert(e);
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Task panicked");
                    first_error.get_or_insert(PipelineError::Join(e.to_string()));
                    continue;
                }
            };
            self.db.increment_finished_tasks(pipeline_id).await?;

            // Siblings stopped by fail-fast count as failed, not as a user cancel.
            if tripped && outcome.status == TaskStatus::Cancelled && !cancel.is_cancelled() {
                outcome.status = TaskStatus::Failed;
            }
            if outcome.status == TaskStatus::Failed && !skip && self.config.fail_fast && !tripped {
                warn!(task_id = %outcome.task_id, "Fail-fast: cancelling the rest of the stage");
                tripped = true;
                stage_cancel.cancel();
            }
            results.push((outcome, skip));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}
