//! Pipeline execution plumbing.
//!
//! - [`ExecutionQueue`]: serializes plugin work, one task at a time.
//! - [`PipelineRunner`]: runs a resolved pipeline stage by stage, reporting
//!   [`RunEvent`]s to a [`ProgressSink`].

pub mod queue;
pub mod runner;

pub use queue::{ExecutionQueue, TaskError, TaskHandle};
pub use runner::{
    CommandStageExecutor, PipelineRunner, ProgressSink, RunEvent, RunEventKind, RunJob,
    StageContext, StageExecutor,
};
