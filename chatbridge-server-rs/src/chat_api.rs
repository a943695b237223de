use crate::error::AppError;
use crate::handlers::{AppState, ClientParams};
use crate::markup;
use crate::sse;
use axum::{
    extract::{Form, Query, State},
    http::{header, HeaderName, HeaderValue},
    response::{sse::Sse, Html, IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_PROMPT: &str = "Hello! Please tell me a short story about a robot.";

const HX_PUSH_URL: HeaderName = HeaderName::from_static("hx-push-url");

#[derive(Deserialize)]
pub struct ChatForm {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST /chat`: starts a run for the client, creating the session on first
/// contact. A new session gets the conversation container back; an existing
/// one gets an empty 200 and follows along over its event stream.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ChatForm>,
) -> Result<Response, AppError> {
    let client_id = form
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let prompt = form
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_PROMPT.to_string());

    let (session, created) = state.sessions.get_or_create(&client_id);
    // The run reports through the session's topic; the handle is not awaited.
    let _run = session.start(&prompt)?;
    info!(session_id = %client_id, created, "Run started");

    if !created {
        return Ok(().into_response());
    }

    let container = markup::chat_container(&client_id, &session.backend().turn())?;
    let mut response = Html(container).into_response();
    if let Ok(url) = HeaderValue::from_str(&markup::page_url(&client_id)) {
        response.headers_mut().insert(HX_PUSH_URL, url);
    }
    Ok(response)
}

/// `GET /events?client_id=`: the session's SSE stream. One stream per
/// session; closing it tears the session down.
pub async fn events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClientParams>,
) -> Result<Response, AppError> {
    let client_id = params
        .client_id
        .filter(|id| !id.is_empty())
        .ok_or(AppError::MissingClientId)?;

    let (session, _) = state.sessions.get_or_create(&client_id);
    let outbound = session
        .take_outbound()
        .ok_or_else(|| AppError::StreamTaken(client_id.clone()))?;
    info!(session_id = %client_id, "Client connected");

    let stream = sse::event_stream(
        Arc::clone(&state.sessions),
        client_id,
        outbound,
        session.disconnect_token(),
        state.config.heartbeat,
    );
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream),
    )
        .into_response())
}
