//! Bridge orchestrator: the single entry point collaborators talk to.
//!
//! [`BridgeOrchestrator`] validates submissions against the
//! [`WorkflowRegistry`], records lifecycle in the [`TaskTracker`], runs
//! each task on the configured [`Executor`] as its own tokio task, and
//! fans progress out through the [`ProgressBroadcaster`].
//!
//! Progress reports are relayed inline on the execution's task, so a
//! task's events reach the tracker and subscribers in emission order and
//! the terminal write always follows them.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use miktos_core::error::{CoreError, CoreResult};
use miktos_core::task::{Task, TaskError, TaskResult, TaskState};
use miktos_core::tracker::TaskTracker;
use miktos_core::types::TaskId;
use miktos_core::workflow::{parse_definitions, WorkflowDefinition, WorkflowRegistry};
use miktos_events::{ProgressBroadcaster, ProgressSubscription};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker as ExecutionSet;

use crate::config::BridgeConfig;
use crate::executor::{
    ComfyUIExecutor, ExecutionError, ExecutionJob, Executor, ExecutorKind, ProgressSink,
    StandaloneExecutor,
};
use crate::retention;
use crate::texture::check_texture_workflow;

/// Errors raised while assembling an orchestrator from configuration.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Failed to read workflows file {path}: {source}")]
    WorkflowsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Workflows(#[from] CoreError),

    #[error("Workflow '{name}' cannot be executed: {reason}")]
    UnsupportedWorkflow { name: String, reason: String },

    #[error("Failed to build executor: {0}")]
    Executor(#[from] ExecutionError),
}

/// Acknowledgement returned by [`BridgeOrchestrator::cancel`].
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    /// `true` if this call moved the task to `failed`; `false` if it had
    /// already reached a terminal state.
    pub cancelled: bool,
    pub task: Task,
}

/// Bridge status summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub executor: ExecutorKind,
    pub executor_connected: bool,
    pub active_tasks: usize,
    pub retained_tasks: usize,
    pub workflows: usize,
}

pub struct BridgeOrchestrator {
    registry: Arc<WorkflowRegistry>,
    tracker: Arc<TaskTracker>,
    broadcaster: Arc<ProgressBroadcaster>,
    executor: Arc<dyn Executor>,
    /// Cancellation handle of every execution still in flight.
    cancellations: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    executions: ExecutionSet,
    /// Parent of every per-task token and of the retention loop.
    shutdown: CancellationToken,
}

impl BridgeOrchestrator {
    pub fn new(registry: Arc<WorkflowRegistry>, executor: Arc<dyn Executor>) -> Self {
        Self::with_parts(
            registry,
            Arc::new(TaskTracker::new()),
            Arc::new(ProgressBroadcaster::default()),
            executor,
        )
    }

    pub fn with_parts(
        registry: Arc<WorkflowRegistry>,
        tracker: Arc<TaskTracker>,
        broadcaster: Arc<ProgressBroadcaster>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            registry,
            tracker,
            broadcaster,
            executor,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            executions: ExecutionSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Assemble an orchestrator from configuration: built-in workflows
    /// plus any from the workflows file, the configured executor variant,
    /// and a running retention loop.
    ///
    /// Every definition in the workflows file must be a texture workflow
    /// the executors can run; otherwise nothing is loaded and
    /// [`SetupError::UnsupportedWorkflow`] names the offending one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, SetupError> {
        let registry = WorkflowRegistry::with_builtins();
        if let Some(path) = &config.workflows_file {
            let json = std::fs::read_to_string(path).map_err(|source| SetupError::WorkflowsFile {
                path: path.clone(),
                source,
            })?;
            let definitions = parse_definitions(&json)?;
            // Reject the whole file before registering anything from it.
            for definition in &definitions {
                check_texture_workflow(definition).map_err(|reason| {
                    SetupError::UnsupportedWorkflow {
                        name: definition.name.clone(),
                        reason,
                    }
                })?;
            }
            let loaded = definitions.len();
            for definition in definitions {
                registry.register(definition);
            }
            tracing::info!(path = %path.display(), loaded, "Loaded workflow definitions");
        }

        let executor: Arc<dyn Executor> = match config.executor {
            ExecutorKind::ComfyUI => Arc::new(ComfyUIExecutor::new(config.comfyui.clone())?),
            ExecutorKind::Standalone => Arc::new(StandaloneExecutor::new(
                config.output_dir.clone(),
                config.standalone_stage_delay,
            )),
        };

        let orchestrator = Self::with_parts(
            Arc::new(registry),
            Arc::new(TaskTracker::new()),
            Arc::new(ProgressBroadcaster::new(config.progress_buffer)),
            executor,
        );
        orchestrator.start_retention(config.task_retention, config.retention_sweep_interval);

        tracing::info!(
            executor = %config.executor,
            workflows = orchestrator.registry.len(),
            "Bridge orchestrator ready",
        );
        Ok(orchestrator)
    }

    /// Spawn the loop that evicts finished tasks older than `retention`.
    /// It stops at [`shutdown`](Self::shutdown).
    pub fn start_retention(&self, retention: std::time::Duration, every: std::time::Duration) {
        tokio::spawn(retention::run(
            Arc::clone(&self.tracker),
            retention,
            every,
            self.shutdown.child_token(),
        ));
    }

    // ---- submission ----

    /// Validate, create the task, and start executing it in the
    /// background. Returns the task in `running` state.
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown workflow and
    /// [`CoreError::Validation`] for bad parameters; no task is created
    /// in either case.
    pub fn submit(&self, workflow: &str, parameters: &serde_json::Value) -> CoreResult<Task> {
        self.launch(workflow, parameters, false).map(|(task, _)| task)
    }

    /// Like [`submit`](Self::submit), but attaches a subscriber before the
    /// execution starts so that no progress event is missed.
    pub fn submit_and_subscribe(
        &self,
        workflow: &str,
        parameters: &serde_json::Value,
    ) -> CoreResult<(Task, ProgressSubscription)> {
        let (task, subscription) = self.launch(workflow, parameters, true)?;
        let subscription = subscription
            .ok_or_else(|| CoreError::Internal("progress channel missing for new task".into()))?;
        Ok((task, subscription))
    }

    fn launch(
        &self,
        workflow: &str,
        raw: &serde_json::Value,
        subscribe: bool,
    ) -> CoreResult<(Task, Option<ProgressSubscription>)> {
        let parameters = self.registry.validate(workflow, raw)?;
        if self.shutdown.is_cancelled() {
            return Err(CoreError::Internal("bridge is shutting down".into()));
        }

        let task = self.tracker.create(workflow, parameters.clone());
        self.broadcaster.open(task.id);
        let subscription = if subscribe {
            self.broadcaster.subscribe(task.id)
        } else {
            None
        };
        let task = self.tracker.transition_to_running(task.id)?;

        let cancel = self.shutdown.child_token();
        self.cancellations.lock().insert(task.id, cancel.clone());

        tracing::info!(task_id = %task.id, workflow, executor = %self.executor.kind(), "Task submitted");

        self.spawn_execution(
            ExecutionJob {
                task_id: task.id,
                workflow: workflow.to_string(),
                parameters,
            },
            cancel,
        );
        Ok((task, subscription))
    }

    fn spawn_execution(&self, job: ExecutionJob, cancel: CancellationToken) {
        let executor = Arc::clone(&self.executor);
        let relay = ProgressRelay {
            task_id: job.task_id,
            tracker: Arc::clone(&self.tracker),
            broadcaster: Arc::clone(&self.broadcaster),
        };
        let cancellations = Arc::clone(&self.cancellations);

        self.executions.spawn(async move {
            let task_id = job.task_id;
            let outcome = AssertUnwindSafe(executor.execute(job, &relay, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ExecutionError::Internal("executor panicked".into())));

            cancellations.lock().remove(&task_id);
            relay.finalize(outcome);
        });
    }

    // ---- queries ----

    /// Current snapshot of a task.
    pub fn status(&self, task_id: TaskId) -> CoreResult<Task> {
        self.tracker.get(task_id)
    }

    /// Stream of progress events for a task from now on, ending with its
    /// terminal event. For an already-terminal task the stream yields
    /// that terminal event once and ends.
    pub fn subscribe(&self, task_id: TaskId) -> CoreResult<ProgressSubscription> {
        // Attach first so a terminal event sent after the snapshot read
        // still reaches us.
        let live = self.broadcaster.subscribe(task_id);
        let task = self.tracker.get(task_id)?;

        if task.is_terminal() {
            return Ok(ProgressSubscription::terminal(task.to_event()));
        }
        live.ok_or_else(|| CoreError::Internal(format!("no progress channel for task {task_id}")))
    }

    /// All workflow definitions, sorted by name.
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.registry.list()
    }

    pub fn list_workflows_by_category(&self, category: &str) -> Vec<Arc<WorkflowDefinition>> {
        self.registry.list_by_category(category)
    }

    /// Every retained task, oldest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.tracker.list()
    }

    /// Number of tasks not yet terminal.
    pub fn active_tasks(&self) -> usize {
        self.tracker.active_count()
    }

    /// Models the active executor can use.
    pub async fn available_models(&self) -> Result<Vec<String>, ExecutionError> {
        self.executor.available_models().await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            executor: self.executor.kind(),
            executor_connected: self.executor.check_connection().await,
            active_tasks: self.tracker.active_count(),
            retained_tasks: self.tracker.len(),
            workflows: self.registry.len(),
        }
    }

    // ---- control ----

    /// Cancel a task.
    ///
    /// The task is marked `failed` with a `cancelled` reason before its
    /// execution is signalled, so the outcome is recorded exactly once
    /// even if the execution finishes concurrently. Cancelling a task
    /// that is already terminal changes nothing.
    pub fn cancel(&self, task_id: TaskId) -> CoreResult<CancelOutcome> {
        match self.tracker.fail(task_id, TaskError::cancelled())? {
            Some(task) => {
                self.broadcaster.finish(task.to_event());
                let token = self.cancellations.lock().remove(&task_id);
                if let Some(token) = token {
                    token.cancel();
                }
                tracing::info!(task_id = %task_id, "Task cancelled");
                Ok(CancelOutcome {
                    cancelled: true,
                    task,
                })
            }
            None => Ok(CancelOutcome {
                cancelled: false,
                task: self.tracker.get(task_id)?,
            }),
        }
    }

    /// Cancel every running task, stop background loops, and wait for
    /// in-flight executions to wind down.
    pub async fn shutdown(&self) {
        let running = self.tracker.running_ids();
        tracing::info!(running = running.len(), "Bridge shutting down");

        for task_id in running {
            if let Err(e) = self.cancel(task_id) {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to cancel task during shutdown");
            }
        }
        self.shutdown.cancel();
        self.executions.close();
        self.executions.wait().await;

        tracing::info!("Bridge shutdown complete");
    }

    pub fn executor_kind(&self) -> ExecutorKind {
        self.executor.kind()
    }
}

/// Relays one execution's progress and outcome into the tracker and
/// broadcaster.
struct ProgressRelay {
    task_id: TaskId,
    tracker: Arc<TaskTracker>,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl ProgressSink for ProgressRelay {
    fn report(&self, fraction: f64, stage: Option<&str>) {
        match self.tracker.record_progress(self.task_id, fraction, stage) {
            Ok(Some(event)) => self.broadcaster.publish(event),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "Dropping progress report");
            }
        }
    }
}

impl ProgressRelay {
    fn finalize(&self, outcome: Result<TaskResult, ExecutionError>) {
        let (state, written) = match outcome {
            Ok(result) => (TaskState::Succeeded, self.tracker.complete(self.task_id, result)),
            Err(err) => {
                let error = TaskError::from(err);
                tracing::warn!(
                    task_id = %self.task_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "Task execution failed",
                );
                (TaskState::Failed, self.tracker.fail(self.task_id, error))
            }
        };

        match written {
            Ok(Some(task)) => {
                tracing::info!(task_id = %self.task_id, state = %task.state, "Task finished");
                self.broadcaster.finish(task.to_event());
            }
            Ok(None) => {
                tracing::debug!(task_id = %self.task_id, outcome = %state, "Outcome discarded, task already terminal");
            }
            Err(e) => {
                tracing::error!(task_id = %self.task_id, error = %e, "Failed to record task outcome");
            }
        }
    }
}
