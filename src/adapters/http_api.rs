//! Inbound HTTP API
//!
//! Thin axum handlers over [`Host`]. Message responses are streamed back as
//! server-sent events, one event per [`AggregateEvent`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{AggregateEvent, SessionId};
use crate::error::{HostError, RouterError, SessionError};
use crate::host::Host;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub host: Arc<Host>,
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl ApiResponse<()> {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
}

fn session_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Expired(_) => StatusCode::GONE,
    }
}

fn error_response(err: HostError) -> Response {
    let status = match &err {
        HostError::Session(e) => session_status(e),
        HostError::Router(RouterError::NoCandidateAgent) => StatusCode::UNPROCESSABLE_ENTITY,
        HostError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::<()>::error(err.to_string()))).into_response()
}

fn event_name(event: &AggregateEvent) -> &'static str {
    match event {
        AggregateEvent::Dispatched { .. } => "dispatched",
        AggregateEvent::Chunk(_) => "chunk",
        AggregateEvent::TaskFinished { .. } => "task_finished",
        AggregateEvent::Finished(_) => "finished",
    }
}

/// POST /api/messages
pub async fn post_message(
    State(state): State<ApiState>,
    Json(request): Json<MessageRequest>,
) -> Response {
    if request.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error("Message text must not be empty")),
        )
            .into_response();
    }

    let session_id = request.session_id.map(SessionId::from);
    match state.host.handle_user_message(session_id, &request.text).await {
        Ok(stream) => {
            let events = stream.map(|event| Event::default().event(event_name(&event)).json_data(&event));
            Sse::new(events)
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// POST /api/sessions
pub async fn open_session(State(state): State<ApiState>) -> impl IntoResponse {
    let session_id = state.host.open_session().await;
    (StatusCode::CREATED, Json(ApiResponse::success(SessionCreated { session_id })))
}

/// GET /api/sessions/:id
pub async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.host.sessions().snapshot(&SessionId::from(id)).await {
        Ok(snapshot) => (StatusCode::OK, Json(ApiResponse::success(snapshot))).into_response(),
        Err(e) => (session_status(&e), Json(ApiResponse::<()>::error(e.to_string()))).into_response(),
    }
}

/// POST /api/sessions/:id/cancel
pub async fn cancel_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.host.cancel(&SessionId::from(id)).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::<()>::ok())).into_response(),
        Err(e) => (session_status(&e), Json(ApiResponse::<()>::error(e.to_string()))).into_response(),
    }
}

/// DELETE /api/sessions/:id
pub async fn close_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.host.close_session(&SessionId::from(id)).await {
        Ok(closed) => (StatusCode::OK, Json(ApiResponse::success(closed))).into_response(),
        Err(e) => (session_status(&e), Json(ApiResponse::<()>::error(e.to_string()))).into_response(),
    }
}

/// GET /api/agents
pub async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    (StatusCode::OK, Json(ApiResponse::success(state.host.roster())))
}
