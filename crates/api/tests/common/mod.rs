#![allow(dead_code)]

use std::path::Path;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use plumb_api::config::ServerConfig;
use plumb_api::router::build_app_router;
use plumb_api::state::AppState;

/// Build a test `ServerConfig` rooted at `workspace_dir`.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default)
/// and a 30-second request timeout.
pub fn test_config(workspace_dir: &Path, plugin_command: &str) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        workspace_dir: workspace_dir.to_path_buf(),
        plugin_command: plugin_command.to_string(),
        stage_timeout_secs: Some(10),
        replicate_max_open_files: 8,
        config_dir: None,
    }
}

/// Build the full application router with the production middleware stack.
pub fn build_test_app(config: ServerConfig) -> Router {
    build_app_router(AppState::new(config))
}

/// Write an executable plugin script that appends `<stage> <package>` to
/// `stages.log` in its working directory and fails for package `fail`.
#[cfg(unix)]
pub fn write_plugin_script(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("plugin.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\necho \"$PLUMB_STAGE $1\" >> stages.log\n[ \"$1\" != \"fail\" ]\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Parse an SSE body into `(event, data)` pairs, skipping keep-alive comments.
pub fn parse_sse(text: &str) -> Vec<(String, serde_json::Value)> {
    text.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event: ") {
                    event = Some(name.to_string());
                } else if let Some(payload) = line.strip_prefix("data: ") {
                    data = Some(serde_json::from_str(payload).unwrap());
                }
            }
            Some((event?, data?))
        })
        .collect()
}
