//! Integration tests for `/api/v1/pipelines`.

mod common;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use common::{body_json, body_text, parse_sse, post_json};
use serde_json::json;

/// Serve `document` at `http://127.0.0.1:<port>/config.json`.
async fn serve_config(document: serde_json::Value) -> String {
    let app = Router::new().route(
        "/config.json",
        get(move || {
            let document = document.clone();
            async move { axum::Json(document) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/config.json")
}

fn two_stage_document() -> serde_json::Value {
    json!({
        "name": "demo",
        "plugins": {
            "dataCollect": { "package": "collector", "params": { "url": "x" } },
            "modelTrain": { "package": "trainer" }
        }
    })
}

// ---------------------------------------------------------------------------
// Resolve
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resolve_inline_document_returns_flat_definition() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));

    let response = post_json(
        app,
        "/api/v1/pipelines/resolve",
        json!({ "config": two_stage_document() }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let data = &json["data"];
    assert_eq!(data["name"], "demo");
    assert_eq!(data["dataCollect"], "collector");
    assert_eq!(data["dataCollectParams"], json!({ "url": "x" }));
    assert_eq!(data["modelTrain"], "trainer");
    assert!(data["modelTrainParams"].is_null());
    assert!(data["dataAccess"].is_null());
}

#[tokio::test]
async fn resolve_bare_path_is_unsupported_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));

    let response = post_json(
        app,
        "/api/v1/pipelines/resolve",
        json!({ "config": "./pipeline.json" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "UNSUPPORTED_PROTOCOL");
}

/// App whose `CONFIG_DIR` is `<dir>/configs`, created empty.
fn app_with_config_dir(dir: &tempfile::TempDir) -> (Router, std::path::PathBuf) {
    let configs = dir.path().join("configs");
    std::fs::create_dir_all(&configs).unwrap();
    let mut config = common::test_config(&dir.path().join("workspaces"), "true");
    config.config_dir = Some(configs.clone());
    (common::build_test_app(config), configs)
}

#[tokio::test]
async fn resolve_file_uri_reads_document_from_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    let (app, configs) = app_with_config_dir(&dir);
    let path = configs.join("pipeline.json");
    std::fs::write(
        &path,
        json!({ "plugins": { "dataAccess": { "package": "@scope/access" } } }).to_string(),
    )
    .unwrap();

    let response = post_json(
        app,
        "/api/v1/pipelines/resolve",
        json!({ "config": format!("file://{}", path.display()) }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["dataAccess"], "@scope/access");
}

#[tokio::test]
async fn resolve_file_uri_is_forbidden_without_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.json");
    std::fs::write(&path, two_stage_document().to_string()).unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));

    let response = post_json(
        app,
        "/api/v1/pipelines/resolve",
        json!({ "config": format!("file://{}", path.display()) }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "FORBIDDEN");
}

#[tokio::test]
async fn resolve_file_uri_outside_config_dir_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let (app, configs) = app_with_config_dir(&dir);
    let outside = dir.path().join("elsewhere.json");
    std::fs::write(&outside, two_stage_document().to_string()).unwrap();

    for reference in [
        format!("file://{}", outside.display()),
        format!("file://{}/../elsewhere.json", configs.display()),
    ] {
        let response = post_json(
            app.clone(),
            "/api/v1/pipelines/resolve",
            json!({ "config": reference }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{reference}");
    }
}

#[tokio::test]
async fn resolve_file_document_with_local_reference_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (app, configs) = app_with_config_dir(&dir);
    let path = configs.join("pipeline.json");
    std::fs::write(
        &path,
        json!({ "plugins": { "dataAccess": { "package": "./local-access" } } }).to_string(),
    )
    .unwrap();

    let response = post_json(
        app,
        "/api/v1/pipelines/resolve",
        json!({ "config": format!("file://{}", path.display()) }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_PLUGIN_REFERENCE");
}

#[tokio::test]
async fn resolve_inline_local_reference_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));

    let response = post_json(
        app,
        "/api/v1/pipelines/resolve",
        json!({ "config": { "plugins": { "dataCollect": { "package": "/tmp/evil" } } } }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_PLUGIN_REFERENCE");
    assert!(json["error"].as_str().unwrap().contains("/tmp/evil"));
}

#[tokio::test]
async fn resolve_missing_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (app, configs) = app_with_config_dir(&dir);
    let missing = configs.join("absent.json");

    let response = post_json(
        app,
        "/api/v1/pipelines/resolve",
        json!({ "config": format!("file://{}", missing.display()) }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resolve_remote_local_reference_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));
    let url = serve_config(json!({
        "plugins": { "dataCollect": { "package": "../local/evil" } }
    }))
    .await;

    let response = post_json(app, "/api/v1/pipelines/resolve", json!({ "config": url })).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_PLUGIN_REFERENCE");
    assert!(json["error"].as_str().unwrap().contains("../local/evil"));
}

#[tokio::test]
async fn resolve_remote_document() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));
    let url = serve_config(two_stage_document()).await;

    let response = post_json(app, "/api/v1/pipelines/resolve", json!({ "config": url })).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["modelTrain"], "trainer");
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[tokio::test]
async fn run_streams_progress_and_executes_stages_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = common::write_plugin_script(dir.path());
    let workspaces = dir.path().join("workspaces");
    let app = common::build_test_app(common::test_config(&workspaces, &plugin));

    let response = post_json(
        app,
        "/api/v1/pipelines/run",
        json!({ "config": two_stage_document() }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let frames = parse_sse(&body_text(response).await);
    let names: Vec<&str> = frames.iter().map(|(event, _)| event.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "session",
            "job:queued",
            "job:start",
            "stage:start",
            "stage:end",
            "stage:start",
            "stage:end",
            "job:end",
            "session",
        ]
    );
    assert_eq!(frames[0].1, json!("start"));
    assert_eq!(frames[8].1, json!("close"));
    assert_eq!(frames[3].1["stage"], "dataCollect");
    assert_eq!(frames[5].1["package"], "trainer");

    let job_id = frames[1].1["job_id"].as_str().unwrap().to_string();
    assert_eq!(frames[2].1["job_id"], job_id.as_str());
    let log = std::fs::read_to_string(workspaces.join(&job_id).join("stages.log")).unwrap();
    assert_eq!(log, "dataCollect collector\nmodelTrain trainer\n");
}

#[cfg(unix)]
#[tokio::test]
async fn run_stops_at_first_failing_stage() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = common::write_plugin_script(dir.path());
    let app = common::build_test_app(common::test_config(dir.path(), &plugin));

    let document = json!({
        "plugins": {
            "dataCollect": { "package": "fail" },
            "modelTrain": { "package": "trainer" }
        }
    });
    let response = post_json(app, "/api/v1/pipelines/run", json!({ "config": document })).await;

    let frames = parse_sse(&body_text(response).await);
    let names: Vec<&str> = frames.iter().map(|(event, _)| event.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "session",
            "job:queued",
            "job:start",
            "stage:start",
            "stage:error",
            "job:error",
            "session",
        ]
    );
    assert!(frames[5].1["error"]
        .as_str()
        .unwrap()
        .contains("exit code 1"));
}

#[cfg(unix)]
#[tokio::test]
async fn run_from_job_starts_with_previous_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = common::write_plugin_script(dir.path());
    let workspaces = dir.path().join("workspaces");
    let config = common::test_config(&workspaces, &plugin);
    let document = json!({ "plugins": { "modelEvaluate": { "package": "eval" } } });

    let first = post_json(
        common::build_test_app(config.clone()),
        "/api/v1/pipelines/run",
        json!({ "config": document.clone() }),
    )
    .await;
    let first_frames = parse_sse(&body_text(first).await);
    let first_job = first_frames[1].1["job_id"].as_str().unwrap().to_string();
    std::fs::write(workspaces.join(&first_job).join("model.bin"), "weights").unwrap();

    let second = post_json(
        common::build_test_app(config),
        "/api/v1/pipelines/run",
        json!({ "config": document, "from_job": first_job }),
    )
    .await;
    let second_frames = parse_sse(&body_text(second).await);
    let second_job = second_frames[1].1["job_id"].as_str().unwrap().to_string();
    assert_ne!(first_job, second_job);

    let copied = workspaces.join(&second_job);
    assert_eq!(std::fs::read_to_string(copied.join("model.bin")).unwrap(), "weights");
    // One line from the first run, one appended by the second.
    assert_eq!(
        std::fs::read_to_string(copied.join("stages.log")).unwrap(),
        "modelEvaluate eval\nmodelEvaluate eval\n"
    );
}

#[tokio::test]
async fn run_from_unknown_job_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));

    let response = post_json(
        app,
        "/api/v1/pipelines/run",
        json!({
            "config": two_stage_document(),
            "from_job": "0190b1a2-0000-7000-8000-000000000000"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn run_with_inline_local_reference_is_rejected_before_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let workspaces = dir.path().join("workspaces");
    let app = common::build_test_app(common::test_config(&workspaces, "true"));

    let response = post_json(
        app,
        "/api/v1/pipelines/run",
        json!({ "config": { "plugins": { "modelTrain": { "package": "../evil" } } } }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_PLUGIN_REFERENCE");
    assert!(!workspaces.exists(), "no job workspace may be created");
}

#[tokio::test]
async fn run_with_unresolvable_config_returns_json_error() {
    let dir = tempfile::tempdir().unwrap();
    let app = common::build_test_app(common::test_config(dir.path(), "true"));

    let response = post_json(
        app,
        "/api/v1/pipelines/run",
        json!({ "config": "ftp://example.com/pipeline.json" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(body_json(response).await["code"], "UNSUPPORTED_PROTOCOL");
}
