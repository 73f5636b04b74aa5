pub mod health;
pub mod pipelines;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /pipelines/resolve          resolve a configuration (POST, JSON)
/// /pipelines/run              queue a pipeline run (POST, SSE progress)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/pipelines", pipelines::router())
}
