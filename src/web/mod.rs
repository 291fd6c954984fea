pub mod admin;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::error::{ControlError, LaunchError};
use crate::state::SharedState;

/// Wrapper mapping lifecycle errors onto HTTP responses so handlers can use
/// `?` directly on engine calls.
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            ControlError::Launch(LaunchError::ExecutableNotFound(_)) => StatusCode::NOT_FOUND,
            ControlError::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::TerminationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ControlError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn require_auth(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let expected = format!("Bearer {}", state.config.server.auth_token);
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if presented == Some(expected.as_str()) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized: invalid or missing Bearer token" })),
        )
            .into_response()
    }
}

/// Full application router. Everything except the control panel page
/// requires the configured bearer token.
pub fn router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/start", post(admin::handle_start))
        .route("/stop", post(admin::handle_stop))
        .route("/stop-all", post(admin::handle_stop_all))
        .route("/status", get(admin::handle_status))
        .route("/list", get(admin::handle_list))
        .route("/logs", get(admin::handle_logs))
        .route("/logs/download", get(admin::download_log))
        .route("/cleanup", post(admin::handle_cleanup))
        .route("/sys/status", get(admin::sys_status))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(admin::index_handler))
        .merge(api)
        .with_state(state)
}
