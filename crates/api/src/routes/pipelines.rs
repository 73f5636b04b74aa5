use axum::routing::post;
use axum::Router;

use crate::handlers::pipelines;
use crate::state::AppState;

/// Routes mounted at `/api/v1/pipelines`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/resolve", post(pipelines::resolve_pipeline))
        .route("/run", post(pipelines::run_pipeline))
}
