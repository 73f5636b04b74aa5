use crate::config_source::ResolveError;
use crate::process::ExecError;
use crate::replicate::ReplicateError;

/// Domain-level error shared by the pipeline and API crates.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Replicate(#[from] ReplicateError),

    #[error("Execution failure: {0}")]
    Execution(#[from] ExecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
