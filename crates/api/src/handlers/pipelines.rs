//! Handlers for pipeline resolution and execution.

use axum::extract::State;
use axum::Json;
use plumb_core::config_source::validate_remote_document;
use plumb_core::{ConfigSource, PipelineDefinition};
use plumb_pipeline::RunJob;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::progress::{ProgressEmitter, ProgressStream};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Request body for `POST /pipelines/resolve`.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// Inline document, `file:` URI, or `http(s):` URL.
    pub config: ConfigSource,
}

/// Request body for `POST /pipelines/run`.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub config: ConfigSource,
    /// Start from a copy of this earlier job's workspace.
    #[serde(default)]
    pub from_job: Option<Uuid>,
}

/// Payload of the `job:queued` progress event.
#[derive(Debug, Serialize)]
struct JobQueued {
    job_id: Uuid,
    /// Runs ahead of this one in the execution queue.
    position: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /pipelines/resolve
///
/// Resolve a configuration and return its flattened pipeline definition.
pub async fn resolve_pipeline(
    State(state): State<AppState>,
    Json(input): Json<ResolveRequest>,
) -> AppResult<Json<DataResponse<PipelineDefinition>>> {
    let definition = resolve_client_config(&state, input.config).await?;
    Ok(Json(DataResponse { data: definition }))
}

/// POST /pipelines/run
///
/// Resolve the configuration, queue a run and stream its progress as
/// server-sent events. Resolution failures are returned as a regular JSON
/// error before any stream is opened.
pub async fn run_pipeline(
    State(state): State<AppState>,
    Json(input): Json<RunRequest>,
) -> AppResult<ProgressStream> {
    let definition = resolve_client_config(&state, input.config).await?;

    let mut job = RunJob::new();
    if let Some(source_job) = input.from_job {
        let base = state.runner.workspace_for(source_job);
        let exists = tokio::fs::try_exists(&base)
            .await
            .map_err(|e| AppError::InternalError(format!("Cannot inspect {}: {e}", base.display())))?;
        if !exists {
            return Err(AppError::NotFound(format!(
                "No workspace for job {source_job}"
            )));
        }
        job = job.with_base_workspace(base);
    }

    let (mut emitter, stream) = ProgressEmitter::channel();
    let position = state.queue.pending();
    if let Err(e) = emitter.emit("job:queued", &JobQueued { job_id: job.id, position }) {
        tracing::debug!(job_id = %job.id, error = %e, "Client left before the job was queued");
    }
    tracing::info!(job_id = %job.id, position, "Pipeline run queued");

    let runner = state.runner.clone();
    // The outcome reaches the client through the progress stream; the task
    // handle only matters for panics, which the queue already isolates.
    drop(state.queue.enqueue(move || async move {
        if let Err(e) = runner.run(&job, &definition, &mut emitter).await {
            tracing::debug!(job_id = %job.id, error = %e, "Run ended with error");
        }
        emitter.finish();
    }));

    Ok(stream)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve a configuration supplied in a request body.
///
/// Every document a client hands us is untrusted, whatever its transport, so
/// local-looking plugin references are rejected for all of them. `file:`
/// references are only honoured inside [`ServerConfig::config_dir`].
///
/// [`ServerConfig::config_dir`]: crate::config::ServerConfig::config_dir
async fn resolve_client_config(
    state: &AppState,
    source: ConfigSource,
) -> AppResult<PipelineDefinition> {
    let source = match source {
        ConfigSource::Reference(reference) => {
            ConfigSource::Reference(confine_file_reference(state, reference).await?)
        }
        document => document,
    };

    let doc = state.resolver.resolve(source).await?;
    validate_remote_document(&doc)?;
    Ok(PipelineDefinition::from_document(&doc))
}

/// Pass non-`file:` references through untouched; rewrite a `file:` reference
/// to its canonical path after checking it lies inside the config directory.
async fn confine_file_reference(state: &AppState, reference: String) -> AppResult<String> {
    let Some(path) = Url::parse(&reference)
        .ok()
        .filter(|url| url.scheme() == "file")
        .and_then(|url| url.to_file_path().ok())
    else {
        return Ok(reference);
    };

    let Some(config_dir) = state.config.config_dir.as_deref() else {
        tracing::warn!(%reference, "Refused file: configuration, no CONFIG_DIR set");
        return Err(AppError::Forbidden(
            "file: configurations are disabled on this server".to_string(),
        ));
    };

    let root = tokio::fs::canonicalize(config_dir).await.map_err(|e| {
        AppError::InternalError(format!("Cannot resolve {}: {e}", config_dir.display()))
    })?;
    let target = tokio::fs::canonicalize(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("Configuration {} does not exist", path.display()))
        } else {
            AppError::InternalError(format!("Cannot resolve {}: {e}", path.display()))
        }
    })?;

    if !target.starts_with(&root) {
        tracing::warn!(%reference, "Refused file: configuration outside CONFIG_DIR");
        return Err(AppError::Forbidden(format!(
            "{} is outside the configuration directory",
            path.display()
        )));
    }

    Url::from_file_path(&target)
        .map(String::from)
        .map_err(|()| AppError::InternalError(format!("Cannot encode {}", target.display())))
}
