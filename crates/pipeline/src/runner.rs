//! Pipeline run orchestration.
//!
//! A [`PipelineRunner`] prepares a per-job workspace (optionally seeded from
//! a previous job's workspace), then hands each defined plugin stage to a
//! [`StageExecutor`] in pipeline order, reporting [`RunEvent`]s to a
//! [`ProgressSink`] as it goes. The first failing stage stops the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plumb_core::plugin::{PipelineDefinition, PluginParams, PluginSlot};
use plumb_core::process::{ExecOptions, ProcessRunner};
use plumb_core::replicate::DirectoryReplicator;
use plumb_core::CoreError;
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress notification emitted while a job runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// What happened. Serialized with a `type` tag alongside the envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    JobStarted {
        pipeline: Option<String>,
        workspace: PathBuf,
    },
    StageStarted {
        stage: PluginSlot,
        package: String,
    },
    StageFinished {
        stage: PluginSlot,
        duration_ms: u64,
    },
    StageFailed {
        stage: PluginSlot,
        error: String,
    },
    JobFinished {
        duration_ms: u64,
    },
    JobFailed {
        error: String,
    },
}

impl RunEvent {
    pub fn new(job_id: Uuid, kind: RunEventKind) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Event name used on the progress stream.
    pub fn name(&self) -> &'static str {
        match self.kind {
            RunEventKind::JobStarted { .. } => "job:start",
            RunEventKind::StageStarted { .. } => "stage:start",
            RunEventKind::StageFinished { .. } => "stage:end",
            RunEventKind::StageFailed { .. } => "stage:error",
            RunEventKind::JobFinished { .. } => "job:end",
            RunEventKind::JobFailed { .. } => "job:error",
        }
    }
}

/// Receiver of run progress.
pub trait ProgressSink: Send {
    fn report(&mut self, event: RunEvent);
}

impl ProgressSink for Vec<RunEvent> {
    fn report(&mut self, event: RunEvent) {
        self.push(event);
    }
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

/// Everything a stage executor needs to run one plugin.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub stage: PluginSlot,
    pub package: String,
    pub params: PluginParams,
    pub workspace: PathBuf,
}

/// Runs a single plugin stage. The plugin engine itself lives behind this seam.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, ctx: &StageContext) -> Result<(), CoreError>;
}

/// Executes a stage by invoking an external plugin command.
///
/// Runs `<command> "$PLUMB_PACKAGE"` in the job workspace with
/// `PLUMB_JOB_ID`, `PLUMB_STAGE`, `PLUMB_PACKAGE` and `PLUMB_PARAMS` (JSON)
/// in the environment. The package is passed only through the environment
/// so it is never interpreted by the shell.
#[derive(Debug, Clone)]
pub struct CommandStageExecutor {
    command: String,
    timeout: Option<Duration>,
    runner: ProcessRunner,
}

impl CommandStageExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            runner: ProcessRunner,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, ctx: &StageContext) -> Result<(), CoreError> {
        let params = serde_json::to_string(&ctx.params)
            .map_err(|e| CoreError::Internal(format!("Failed to encode stage params: {e}")))?;

        let mut options = ExecOptions::new()
            .cwd(&ctx.workspace)
            .env("PLUMB_JOB_ID", ctx.job_id.to_string())
            .env("PLUMB_STAGE", ctx.stage.as_str())
            .env("PLUMB_PACKAGE", ctx.package.as_str())
            .env("PLUMB_PARAMS", params);
        if let Some(timeout) = self.timeout {
            options = options.timeout(timeout);
        }

        let command = format!("{} \"$PLUMB_PACKAGE\"", self.command);
        let stdout = self.runner.run(&command, options).await?;
        tracing::debug!(
            job_id = %ctx.job_id,
            stage = %ctx.stage,
            output_bytes = stdout.len(),
            "Stage command finished",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// One requested pipeline run.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub id: Uuid,
    /// Existing workspace to copy into the new job workspace before running.
    pub base_workspace: Option<PathBuf>,
}

impl RunJob {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            base_workspace: None,
        }
    }

    pub fn with_base_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_workspace = Some(path.into());
        self
    }
}

impl Default for RunJob {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a [`PipelineDefinition`] through a [`StageExecutor`].
#[derive(Clone)]
pub struct PipelineRunner {
    executor: Arc<dyn StageExecutor>,
    replicator: DirectoryReplicator,
    workspace_root: PathBuf,
}

impl PipelineRunner {
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        replicator: DirectoryReplicator,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            replicator,
            workspace_root: workspace_root.into(),
        }
    }

    /// Directory a job runs in: `<workspace_root>/<job_id>`.
    pub fn workspace_for(&self, job_id: Uuid) -> PathBuf {
        self.workspace_root.join(job_id.to_string())
    }

    /// Run every defined stage of `definition` for `job`.
    pub async fn run(
        &self,
        job: &RunJob,
        definition: &PipelineDefinition,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), CoreError> {
        let start = Instant::now();
        let workspace = self.workspace_for(job.id);

        tracing::info!(job_id = %job.id, pipeline = ?definition.name(), "Pipeline run started");
        sink.report(RunEvent::new(
            job.id,
            RunEventKind::JobStarted {
                pipeline: definition.name().map(str::to_string),
                workspace: workspace.clone(),
            },
        ));

        let result = self.run_stages(job, definition, &workspace, sink).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => {
                tracing::info!(job_id = %job.id, duration_ms, "Pipeline run finished");
                sink.report(RunEvent::new(job.id, RunEventKind::JobFinished { duration_ms }));
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Pipeline run failed");
                sink.report(RunEvent::new(
                    job.id,
                    RunEventKind::JobFailed {
                        error: e.to_string(),
                    },
                ));
            }
        }
        result
    }

    async fn run_stages(
        &self,
        job: &RunJob,
        definition: &PipelineDefinition,
        workspace: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(workspace).await?;
        if let Some(base) = &job.base_workspace {
            self.replicator.copy(base, workspace).await?;
        }

        for (stage, package, params) in definition.stages() {
            sink.report(RunEvent::new(
                job.id,
                RunEventKind::StageStarted {
                    stage,
                    package: package.to_string(),
                },
            ));

            let ctx = StageContext {
                job_id: job.id,
                stage,
                package: package.to_string(),
                params: params.cloned().unwrap_or_default(),
                workspace: workspace.to_path_buf(),
            };
            let stage_start = Instant::now();

            if let Err(e) = self.executor.execute(&ctx).await {
                sink.report(RunEvent::new(
                    job.id,
                    RunEventKind::StageFailed {
                        stage,
                        error: e.to_string(),
                    },
                ));
                return Err(e);
            }

            sink.report(RunEvent::new(
                job.id,
                RunEventKind::StageFinished {
                    stage,
                    duration_ms: stage_start.elapsed().as_millis() as u64,
                },
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
