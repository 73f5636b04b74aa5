use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use plumb_core::{CoreError, ReplicateError, ResolveError};
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `plumb_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A referenced resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request names something the caller may not access.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        Self::Core(CoreError::Resolve(err))
    }
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core_error(core),

            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

/// Classify a core error into an HTTP status, error code, and message.
///
/// Caller mistakes in the configuration map to 400, a missing local file to
/// 404, and failures of a remote configuration server to 502. Anything else
/// is logged and surfaced as a sanitized 500.
fn classify_core_error(err: &CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::Resolve(resolve) => match resolve {
            ResolveError::UnsupportedProtocol { .. } => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_PROTOCOL",
                resolve.to_string(),
            ),
            ResolveError::InvalidPluginReference { .. } => (
                StatusCode::BAD_REQUEST,
                "INVALID_PLUGIN_REFERENCE",
                resolve.to_string(),
            ),
            ResolveError::Parse(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_CONFIG", resolve.to_string())
            }
            ResolveError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", resolve.to_string())
            }
            ResolveError::Request(_) | ResolveError::RemoteStatus { .. } => {
                tracing::warn!(error = %resolve, "Remote configuration unavailable");
                (StatusCode::BAD_GATEWAY, "REMOTE_ERROR", resolve.to_string())
            }
            ResolveError::Io { .. } => {
                tracing::error!(error = %resolve, "Failed to read configuration");
                internal()
            }
        },
        CoreError::Replicate(ReplicateError::Io { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
        }
        other => {
            tracing::error!(error = %other, "Core error");
            internal()
        }
    }
}
