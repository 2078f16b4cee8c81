use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    broadcast::StreamEvent,
    catalog::{ToolDefinition, ToolKind},
    command::ToolSelection,
    error::ScanError,
    orchestrator::{ScanOrchestrator, ScanTarget},
    types::{BatchView, DomainScanState, ScanAck, StopSummary},
};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<ScanOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ScanOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScanError::InvalidDomain(_)
            | ScanError::UnknownTool(_)
            | ScanError::UnknownParameter { .. }
            | ScanError::InvalidParameterValue { .. } => StatusCode::BAD_REQUEST,
            ScanError::NotFound(_) => StatusCode::NOT_FOUND,
            ScanError::RunAlreadyActive { .. } | ScanError::ActiveScanInProgress(_) => {
                StatusCode::CONFLICT
            }
            ScanError::SpawnFailure { .. } | ScanError::ProcessError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub domains: Vec<String>,
    pub tools: Vec<String>,
    /// domain -> tool -> selection; domains and tools not in the request are ignored.
    #[serde(default)]
    pub selections: BTreeMap<String, BTreeMap<String, ToolSelection>>,
}

impl ScanRequest {
    fn into_targets(self) -> Result<Vec<ScanTarget>, ScanError> {
        let tools = self
            .tools
            .iter()
            .map(|t| t.parse::<ToolKind>())
            .collect::<Result<Vec<_>, _>>()?;
        let mut selections = BTreeMap::new();
        for (domain, per_tool) in self.selections {
            let mut parsed = BTreeMap::new();
            for (tool, selection) in per_tool {
                parsed.insert(tool.parse::<ToolKind>()?, selection);
            }
            selections.insert(domain.trim().to_ascii_lowercase(), parsed);
        }

        Ok(self
            .domains
            .into_iter()
            .map(|domain| {
                let chosen = selections.get(&domain.trim().to_ascii_lowercase());
                let mut target = ScanTarget::new(domain, tools.iter().copied());
                for tool in &tools {
                    if let Some(selection) = chosen.and_then(|c| c.get(tool)) {
                        target = target.with_selection(*tool, selection.clone());
                    }
                }
                target
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub domain: String,
    #[serde(flatten)]
    pub selection: ToolSelection,
}

#[derive(Debug, Serialize)]
struct PreviewResponse {
    command: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    removed: usize,
}

/// Build the API router without the static UI.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/{tool}/preview", post(preview_command))
        .route("/tools/{tool}/stop", post(stop_tool))
        .route("/scans", post(start_scan))
        .route("/scans/{batch_id}", get(get_batch))
        .route("/domains", get(list_domains).delete(clear_all))
        .route("/domains/{domain}", delete(clear_domain))
        .route("/domains/{domain}/progress", get(domain_progress))
        .route("/domains/{domain}/tools/{tool}/stream", get(stream_output))
        .route("/domains/{domain}/tools/{tool}/stop", post(stop_tool_on))
        .route("/stop-all", post(stop_all))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// API router plus the static UI in `ui_dir` as fallback.
pub fn app(orchestrator: Arc<ScanOrchestrator>, ui_dir: PathBuf) -> Router {
    let static_svc = ServeDir::new(ui_dir).append_index_html_on_directories(true);
    router(AppState::new(orchestrator)).fallback_service(static_svc)
}

/// Serve [`app`] on `bind` until `shutdown` resolves.
pub async fn spawn_server(
    bind: &str,
    orchestrator: Arc<ScanOrchestrator>,
    ui_dir: PathBuf,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = app(orchestrator, ui_dir);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving scan API");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn list_tools(State(app): State<AppState>) -> Json<Vec<&'static ToolDefinition>> {
    Json(app.orchestrator.catalog())
}

async fn preview_command(
    State(app): State<AppState>,
    Path(tool): Path<String>,
    Json(req): Json<PreviewRequest>,
) -> Result<impl IntoResponse, ScanError> {
    let tool: ToolKind = tool.parse()?;
    let command = app.orchestrator.preview(tool, &req.domain, &req.selection)?;
    Ok(Json(PreviewResponse {
        command: command.to_string(),
    }))
}

async fn start_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<(StatusCode, Json<ScanAck>), ScanError> {
    let targets = req.into_targets()?;
    let ack = app.orchestrator.start_scan(&targets).await?;
    let status = if ack.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ack)))
}

async fn get_batch(
    State(app): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchView>, ScanError> {
    Ok(Json(app.orchestrator.batch(batch_id).await?))
}

async fn list_domains(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.orchestrator.list_domains().await)
}

async fn domain_progress(
    State(app): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<DomainScanState>, ScanError> {
    Ok(Json(app.orchestrator.domain_progress(&domain).await?))
}

async fn stream_output(
    State(app): State<AppState>,
    Path((domain, tool)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ScanError> {
    let tool: ToolKind = tool.parse()?;
    let subscription = app.orchestrator.stream_output(&domain, tool).await?;
    let stream = subscription.map(|event| Ok(sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

fn sse_event(event: StreamEvent) -> Event {
    match event {
        // SSE cannot carry bare carriage returns.
        StreamEvent::Line { line } => Event::default().event("line").data(line.replace('\r', "")),
        StreamEvent::End { status, exit_code } => {
            let body = serde_json::json!({ "status": status, "exit_code": exit_code });
            Event::default().event("end").data(body.to_string())
        }
    }
}

async fn stop_tool_on(
    State(app): State<AppState>,
    Path((domain, tool)): Path<(String, String)>,
) -> Result<Json<StopSummary>, ScanError> {
    let tool: ToolKind = tool.parse()?;
    Ok(Json(app.orchestrator.stop_tool_on(&domain, tool).await?))
}

async fn stop_tool(
    State(app): State<AppState>,
    Path(tool): Path<String>,
) -> Result<Json<StopSummary>, ScanError> {
    let tool: ToolKind = tool.parse()?;
    Ok(Json(app.orchestrator.stop_tool(tool).await))
}

async fn stop_all(State(app): State<AppState>) -> Json<StopSummary> {
    Json(app.orchestrator.stop_all().await)
}

async fn clear_domain(
    State(app): State<AppState>,
    Path(domain): Path<String>,
    Query(params): Query<ClearParams>,
) -> Result<Json<ClearResponse>, ScanError> {
    let removed = app.orchestrator.clear(Some(&domain), params.force).await?;
    Ok(Json(ClearResponse { removed }))
}

async fn clear_all(
    State(app): State<AppState>,
    Query(params): Query<ClearParams>,
) -> Result<Json<ClearResponse>, ScanError> {
    let removed = app.orchestrator.clear(None, params.force).await?;
    Ok(Json(ClearResponse { removed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;
    use crate::orchestrator::OrchestratorConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let orch = ScanOrchestrator::new(OrchestratorConfig::default(), CommandBuilder::new());
        router(AppState::new(Arc::new(orch)))
    }

    async fn json_of(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn catalog_lists_four_tools() {
        let response = app()
            .oneshot(Request::builder().uri("/api/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_of(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(4));
        assert_eq!(body[0]["tool"], "nmap");
    }

    #[tokio::test]
    async fn preview_builds_command_in_catalog_order() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/tools/nmap/preview")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"domain":"Example.com","flags":["-sV","-sS"]}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["command"], "nmap example.com -sS -sV");
    }

    #[tokio::test]
    async fn input_errors_map_to_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/scans")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"domains":["bad_domain!"],"tools":["nmap"]}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"], "invalid_domain");

        let request = Request::builder()
            .method("POST")
            .uri("/api/scans")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"domains":["example.com"],"tools":["nikto"]}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn unknown_domain_is_not_found() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/domains/nowhere.com/progress")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_of(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn stop_all_with_nothing_running() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/stop-all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_of(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["stopped"], 0);
    }

    #[test]
    fn selections_apply_to_requested_pairs_only() {
        let req: ScanRequest = serde_json::from_str(
            r#"{
                "domains": ["A.com", "b.com"],
                "tools": ["nmap"],
                "selections": {
                    "a.com": {"nmap": {"flags": ["-sV"]}, "gobuster": {"flags": ["--expanded"]}}
                }
            }"#,
        )
        .unwrap();
        let targets = req.into_targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].tools.len(), 1);
        assert_eq!(targets[0].tools[&ToolKind::Nmap].flags, vec!["-sV".to_string()]);
        assert!(targets[1].tools[&ToolKind::Nmap].flags.is_empty());
    }
}
