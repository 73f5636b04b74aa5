use std::sync::Arc;
use std::time::Duration;

use plumb_core::{ConfigResolver, DirectoryReplicator};
use plumb_pipeline::{CommandStageExecutor, ExecutionQueue, PipelineRunner};

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Loads pipeline configurations from documents, files and URLs.
    pub resolver: ConfigResolver,
    /// Serializes pipeline runs; one plugin stage executes at a time.
    pub queue: Arc<ExecutionQueue>,
    /// Executes resolved pipelines inside per-job workspaces.
    pub runner: Arc<PipelineRunner>,
}

impl AppState {
    /// Wire up state from configuration. Must be called inside a Tokio
    /// runtime because the execution queue spawns its worker immediately.
    pub fn new(config: ServerConfig) -> Self {
        let executor = CommandStageExecutor::new(config.plugin_command.clone())
            .with_timeout(config.stage_timeout_secs.map(Duration::from_secs));
        let runner = PipelineRunner::new(
            Arc::new(executor),
            DirectoryReplicator::new(config.replicate_max_open_files),
            config.workspace_dir.clone(),
        );

        Self {
            config: Arc::new(config),
            resolver: ConfigResolver::new(),
            queue: Arc::new(ExecutionQueue::start()),
            runner: Arc::new(runner),
        }
    }
}
