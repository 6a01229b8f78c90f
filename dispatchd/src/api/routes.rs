use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::protocol::API_PREFIX;
use shared::types::{EndpointSnapshot, RecordSnapshot};
use crate::controller::DispatchController;
use crate::error::DispatchError;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<DispatchController>,
}

/// Either field may be left out to keep the current text
#[derive(Debug, Default, Deserialize)]
pub struct MessagesRequest {
    pub motd: Option<String>,
    pub kick: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Controller failure rendered as a JSON error with a matching status code
#[derive(Debug)]
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::StartTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Provider { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Cancelled(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("API request failed: {}", self.0);
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/endpoints", get(get_endpoints))
        .route("/endpoints/:name", get(get_endpoint))
        .route("/endpoints/:name/start", post(start_endpoint))
        .route("/endpoints/:name/stop", post(stop_endpoint))
        .route("/endpoints/:name/messages", put(set_messages))
        .route("/records", get(get_records));

    Router::new().nest(API_PREFIX, routes).with_state(state)
}

async fn get_endpoints(State(state): State<AppState>) -> Json<Vec<EndpointSnapshot>> {
    Json(state.controller.snapshots())
}

async fn get_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EndpointSnapshot>, ApiError> {
    Ok(Json(state.controller.describe(&name).await?))
}

async fn start_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EndpointSnapshot>, ApiError> {
    tracing::info!("Manual start requested for {}", name);
    state.controller.start_endpoint(&name).await?;
    let endpoint = state.controller.endpoint(&name)?;
    Ok(Json(state.controller.snapshot(&endpoint, None)))
}

async fn stop_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    tracing::info!("Manual stop requested for {}", name);
    state.controller.stop_endpoint(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_messages(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<MessagesRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .controller
        .set_decoy_messages(&name, request.motd.as_deref(), request.kick.as_deref())?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_records(State(state): State<AppState>) -> Json<RecordSnapshot> {
    Json(state.controller.authority().snapshot())
}
