mod chat_api;
mod config;
mod error;
mod handlers;
mod markup;
mod sse;

use crate::config::{EngineKind, ServerConfig};
use crate::handlers::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use chatbridge_sdk_rs::{
    agent::AgentToolLoop,
    backend::ToolLoop,
    echo::EchoToolLoop,
    llm::{LLMConfig, LLM},
    router::EventRouter,
    runtime::LocalRuntime,
    session::{SessionConfig, SessionManager},
    tools::CalcTool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/alive", get(handlers::alive))
        .route("/chat", post(chat_api::chat))
        .route("/events", get(chat_api::events))
        .with_state(state)
}

fn engine(config: &ServerConfig) -> Arc<dyn ToolLoop> {
    match config.engine {
        EngineKind::Echo => Arc::new(EchoToolLoop::new(config.echo_delay)),
        EngineKind::Llm => {
            let llm = LLM::new(LLMConfig {
                model: config.model.clone(),
                api_key: config.api_key.clone(),
                reasoning_effort: Some("minimal".to_string()),
            });
            let runtime = Arc::new(LocalRuntime::new(vec![Box::new(CalcTool)]));
            Arc::new(AgentToolLoop::new(llm, runtime, ""))
        }
    }
}

/// Drops sessions whose client never opened an event stream.
async fn prune_unattached(sessions: Arc<SessionManager>, ttl: Duration) {
    let mut ticker = tokio::time::interval(ttl);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sessions.prune_unattached(ttl);
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();

    // Set up tracing using the SDK's logger
    chatbridge_sdk_rs::logger::init_logging();

    let config = ServerConfig::from_env();
    tracing::info!(engine = %config.engine, model = %config.model, "Starting chatbridge");

    let router = EventRouter::spawn();
    let sessions = SessionManager::new(
        router.clone(),
        engine(&config),
        SessionConfig {
            channel_capacity: config.channel_capacity,
            ..SessionConfig::default()
        },
    );
    let listener = TcpListener::bind(&config.addr).await?;
    let unattached_ttl = config.unattached_ttl;
    let state = Arc::new(AppState::new(sessions, config));
    let pruner = tokio::spawn(prune_unattached(
        Arc::clone(&state.sessions),
        unattached_ttl,
    ));

    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    pruner.abort();
    router.close();
    Ok(())
}
