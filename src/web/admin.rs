use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Response, StatusCode},
    response::Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use super::ApiError;
use crate::engine::{CleanupOptions, Engine, StreamStatus};
use crate::state::SharedState;
use crate::stream::StreamSpec;

/// Embedded control panel.
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// Host memory and load, for the control panel header.
pub async fn sys_status() -> Json<serde_json::Value> {
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(json!({
        "mem_total": mem.0 / 1024, // MB
        "mem_avail": mem.1 / 1024, // MB
        "load_avg": load,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default = "default_stream_id")]
    pub id: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub overlay_image: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_stream_id() -> String {
    "stream".to_string()
}

impl From<StartRequest> for StreamSpec {
    fn from(req: StartRequest) -> Self {
        Self {
            id: req.id,
            source: req.source,
            destination: req.destination,
            overlay_image: req.overlay_image,
            extra_args: req.extra_args,
        }
    }
}

fn status_json(status: &StreamStatus) -> serde_json::Value {
    let p = &status.process;
    let uptime = p
        .started_at
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);
    json!({
        "id": p.spec.id,
        "state": p.state,
        "running": status.alive,
        "pid": p.pid,
        "source": p.spec.source,
        "destination": p.spec.destination,
        "log": p.log_path,
        "uptime_seconds": if status.alive { uptime } else { 0 },
    })
}

pub async fn handle_start(
    State(state): State<SharedState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = Engine::start(&state, req.into()).await?;
    Ok(Json(json!({
        "status": "started",
        "id": status.process.spec.id,
        "pid": status.process.pid,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    #[serde(default = "default_stream_id")]
    pub id: String,
    #[serde(default)]
    pub force: bool,
}

pub async fn handle_stop(
    State(state): State<SharedState>,
    Json(req): Json<StopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = Engine::stop(&state, &req.id, req.force).await?;
    Ok(Json(json!({
        "status": "stopped",
        "id": req.id,
        "state": status.process.state,
    })))
}

pub async fn handle_stop_all(
    State(state): State<SharedState>,
) -> Json<serde_json::Value> {
    let stopped: Vec<_> = Engine::stop_all(&state)
        .await
        .into_iter()
        .map(|(id, outcome)| match outcome {
            Ok(status) => json!({ "id": id, "state": status.process.state }),
            Err(e) => json!({ "id": id, "error": e.to_string() }),
        })
        .collect();
    Json(json!({ "stopped": stopped }))
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    #[serde(default = "default_stream_id")]
    pub id: String,
}

pub async fn handle_status(
    State(state): State<SharedState>,
    Query(query): Query<IdQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = Engine::status(&state, &query.id)?;
    Ok(Json(status_json(&status)))
}

pub async fn handle_list(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let streams: Vec<_> = Engine::list_all(&state)
        .iter()
        .map(status_json)
        .collect();
    Json(json!({ "streams": streams }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub id: String,
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    200
}

pub async fn handle_logs(
    State(state): State<SharedState>,
    Query(query): Query<LogsQuery>,
) -> Result<Response<Body>, ApiError> {
    let lines = query.lines.clamp(1, 10_000);
    let content = Engine::tail_log(&state, &query.id, lines)?;
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(content))
        .unwrap())
}

/// Stream the whole log file instead of tailing it, for operators who want
/// to pull it into local tooling.
pub async fn download_log(
    State(state): State<SharedState>,
    Query(query): Query<IdQuery>,
) -> Result<Response<Body>, (StatusCode, String)> {
    crate::stream::validate_id(&query.id)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let log_path = state.registry.log_path(&query.id);

    let file = File::open(&log_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "Log file not found".to_string()))?;

    let content_type = mime_guess::from_path(&log_path)
        .first_or_text_plain()
        .to_string();

    let stream = ReaderStream::new(file);
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.log\"", query.id),
        )
        .body(Body::from_stream(stream))
        .unwrap())
}

#[derive(Debug, Deserialize, Default)]
pub struct CleanupRequest {
    #[serde(default)]
    pub ids: Option<Vec<String>>,
    #[serde(default, alias = "kill_all_ffmpeg")]
    pub kill_all: bool,
    #[serde(default)]
    pub remove_logs: bool,
}

pub async fn handle_cleanup(
    State(state): State<SharedState>,
    body: Option<Json<CleanupRequest>>,
) -> Json<serde_json::Value> {
    let Json(req) = body.unwrap_or_default();
    let report = Engine::cleanup(
        &state,
        CleanupOptions {
            ids: req.ids,
            kill_all: req.kill_all,
            remove_logs: req.remove_logs,
        },
    )
    .await;
    Json(json!(report))
}
