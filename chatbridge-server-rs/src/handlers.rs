use crate::config::ServerConfig;
use crate::error::AppError;
use crate::markup;
use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse, Json, Redirect, Response},
};
use chatbridge_sdk_rs::session::SessionManager;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(sessions: SessionManager, config: ServerConfig) -> Self {
        Self {
            sessions: Arc::new(sessions),
            config,
        }
    }
}

#[derive(Deserialize)]
pub struct ClientParams {
    pub client_id: Option<String>,
}

pub async fn health() -> impl IntoResponse {
    "OK"
}

pub async fn alive() -> impl IntoResponse {
    Json(json!({
        "status": "ok"
    }))
}

/// Landing page. With a known `client_id` the stored conversation is shown;
/// an unknown one redirects to a fresh page.
pub async fn index(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClientParams>,
) -> Result<Response, AppError> {
    let Some(client_id) = params.client_id.filter(|id| !id.is_empty()) else {
        return Ok(Html(markup::index_page(None)?).into_response());
    };
    let Some(session) = state.sessions.get(&client_id) else {
        return Ok(Redirect::to("/").into_response());
    };
    let container = markup::chat_container(&client_id, &session.backend().turn())?;
    Ok(Html(markup::index_page(Some(container))?).into_response())
}
