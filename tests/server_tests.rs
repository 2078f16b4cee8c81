#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use domscan_rs::catalog::ToolKind;
use domscan_rs::command::CommandBuilder;
use domscan_rs::orchestrator::{OrchestratorConfig, ScanOrchestrator};
use domscan_rs::server;
use tower::ServiceExt;

fn test_app(builder: CommandBuilder, ui_dir: &std::path::Path) -> Router {
    let config = OrchestratorConfig {
        max_concurrent_runs: 4,
        stop_grace: Duration::from_millis(500),
        stop_all_timeout: Duration::from_secs(5),
    };
    server::app(Arc::new(ScanOrchestrator::new(config, builder)), ui_dir.to_path_buf())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn wait_done(app: &Router, batch_id: &str) -> serde_json::Value {
    for _ in 0..500 {
        let (status, body) = send(app, get(&format!("/api/scans/{batch_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
        if view["phase"] == "done" {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {batch_id} never finished");
}

#[tokio::test]
async fn scan_then_stream_over_sse() {
    let ui = tempfile::tempdir().unwrap();
    let app = test_app(CommandBuilder::new().with_program(ToolKind::Nmap, "echo"), ui.path());

    let (status, body) = send(
        &app,
        post_json(
            "/api/scans",
            r#"{"domains":["example.com"],"tools":["nmap"],
                "selections":{"example.com":{"nmap":{"flags":["-sV"],"inputs":{"-p":"80,443"}}}}}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let ack: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(ack["accepted"], true);
    let batch_id = ack["batch_id"].as_str().unwrap().to_string();

    let view = wait_done(&app, &batch_id).await;
    assert_eq!(view["runs"][0]["status"], "completed");

    let (status, body) = send(&app, get("/api/domains/example.com/tools/nmap/stream")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(
        text.contains("event: line\ndata: example.com -sV -p 80,443\n"),
        "{text}"
    );
    assert!(text.contains("event: end\ndata: {\"exit_code\":0,\"status\":\"completed\"}"), "{text}");

    let (status, body) = send(&app, get("/api/domains/example.com/progress")).await;
    assert_eq!(status, StatusCode::OK);
    let state: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["status"], "completed");
    assert_eq!(state["progress_percent"], 100);
}

#[tokio::test]
async fn duplicate_scan_conflicts_and_clear_requires_force() {
    let ui = tempfile::tempdir().unwrap();
    let app = test_app(CommandBuilder::new().with_program(ToolKind::Nmap, "sleep"), ui.path());

    let scan = r#"{"domains":["30"],"tools":["nmap"]}"#;
    let (status, _) = send(&app, post_json("/api/scans", scan)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, body) = send(&app, post_json("/api/scans", scan)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["error"], "run_already_active");

    let delete = |uri: &str| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app, delete("/api/domains/30")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, body) = send(&app, delete("/api/domains/30?force=true")).await;
    assert_eq!(status, StatusCode::OK);
    let cleared: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(cleared["removed"], 1);

    let (_, body) = send(&app, get("/api/domains")).await;
    assert_eq!(body, b"[]");
}

#[tokio::test]
async fn stop_endpoints_report_counts() {
    let ui = tempfile::tempdir().unwrap();
    let app = test_app(CommandBuilder::new().with_program(ToolKind::Nmap, "sleep"), ui.path());

    let (status, _) = send(&app, post_json("/api/scans", r#"{"domains":["30","31"],"tools":["nmap"]}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&app, post_json("/api/domains/30/tools/nmap/stop", "")).await;
    assert_eq!(status, StatusCode::OK);
    let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(summary["success"], true);
    assert_eq!(summary["stopped"], 1);

    let (status, body) = send(&app, post_json("/api/tools/nmap/stop", "")).await;
    assert_eq!(status, StatusCode::OK);
    let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(summary["stopped"], 1);

    let (status, _) = send(&app, post_json("/api/domains/30/tools/gobuster/stop", "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, post_json("/api/tools/nikto/stop", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_input_value_is_rejected_before_any_run() {
    let ui = tempfile::tempdir().unwrap();
    let app = test_app(CommandBuilder::new(), ui.path());

    let (status, body) = send(
        &app,
        post_json(
            "/api/scans",
            r#"{"domains":["example.com"],"tools":["nmap"],
                "selections":{"example.com":{"nmap":{"inputs":{"-p":"999999"}}}}}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["error"], "invalid_parameter_value");

    let (_, body) = send(&app, get("/api/domains")).await;
    assert_eq!(body, b"[]");
}

#[tokio::test]
async fn static_ui_served_as_fallback() {
    let ui = tempfile::tempdir().unwrap();
    std::fs::write(ui.path().join("index.html"), "<h1>domscan</h1>").unwrap();
    let app = test_app(CommandBuilder::new(), ui.path());

    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>domscan</h1>");
}
