//! In-process topic router.
//!
//! Publishers push serialized messages onto a topic; a dispatch worker routes
//! each message to the handler registered for that topic. Handler failures
//! (including malformed payloads) are logged and the message is acknowledged,
//! so one bad message never stops dispatch.

use crate::backend::{FinishedSignal, RunSummary};
use crate::events::{Event, EventParseError, EventSink, SinkError};
use crate::translator::TranslateError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SIGNAL_KEY: &str = "signal";
const RUN_FINISHED: &str = "run-finished";

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub metadata: HashMap<String, String>,
    pub payload: Vec<u8>,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(Event),
    RunFinished(RunSummary),
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            metadata: HashMap::new(),
            payload,
        }
    }

    pub fn run_finished(
        topic: impl Into<String>,
        summary: &RunSummary,
    ) -> Result<Self, serde_json::Error> {
        let mut message = Self::new(topic, serde_json::to_vec(summary)?);
        message
            .metadata
            .insert(SIGNAL_KEY.to_string(), RUN_FINISHED.to_string());
        Ok(message)
    }

    pub fn decode(&self) -> Result<Inbound, EventParseError> {
        if self.metadata.get(SIGNAL_KEY).map(String::as_str) == Some(RUN_FINISHED) {
            return Ok(Inbound::RunFinished(serde_json::from_slice(&self.payload)?));
        }
        Ok(Inbound::Event(Event::from_json(&self.payload)?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router is closed")]
    Closed,
    #[error(transparent)]
    Parse(#[from] EventParseError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error("handler failed: {0}")]
    Handler(String),
}

pub type Handler = Arc<dyn Fn(&Message) -> Result<(), RouterError> + Send + Sync>;

type HandlerMap = Arc<RwLock<HashMap<String, Handler>>>;

#[derive(Clone)]
pub struct EventRouter {
    handlers: HandlerMap,
    tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
}

impl EventRouter {
    /// Creates a router and spawns its dispatch worker on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        tokio::spawn(Self::dispatch(rx, Arc::clone(&handlers), shutdown.clone()));
        Self {
            handlers,
            tx,
            shutdown,
        }
    }

    async fn dispatch(
        mut rx: mpsc::UnboundedReceiver<Message>,
        handlers: HandlerMap,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => Self::route(&handlers, &message),
                    None => break,
                },
            }
        }
        info!("Event router stopped");
    }

    fn route(handlers: &HandlerMap, message: &Message) {
        let handler = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.topic)
            .cloned();
        let Some(handler) = handler else {
            debug!(topic = %message.topic, "No handler for topic, dropping message");
            return;
        };
        if let Err(e) = handler(message) {
            error!(
                topic = %message.topic,
                message_id = %message.id,
                payload = %String::from_utf8_lossy(&message.payload),
                error = %e,
                "Handler failed, message acknowledged"
            );
        }
    }

    /// Registers `handler` for `topic`, replacing any previous one.
    pub fn add_handler(&self, topic: impl Into<String>, handler: Handler) {
        let topic = topic.into();
        debug!(topic = %topic, "Adding handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic, handler);
    }

    pub fn remove_handler(&self, topic: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .is_some()
    }

    pub fn publish(&self, message: Message) -> Result<(), RouterError> {
        self.tx.send(message).map_err(|_| RouterError::Closed)
    }

    /// Sink that serializes events onto `topic`.
    pub fn sink(&self, topic: impl Into<String>) -> TopicSink {
        TopicSink {
            router: self.clone(),
            topic: topic.into(),
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Publishes events, and the end-of-run signal, onto one topic.
///
/// Routing the finished signal through the same topic keeps it behind every
/// event the run published.
#[derive(Clone)]
pub struct TopicSink {
    router: EventRouter,
    topic: String,
}

impl TopicSink {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl EventSink for TopicSink {
    fn publish(&self, event: &Event) -> Result<(), SinkError> {
        let payload = event.to_json()?;
        self.router
            .publish(Message::new(self.topic.clone(), payload))
            .map_err(|_| SinkError::Closed)
    }
}

impl FinishedSignal for TopicSink {
    fn run_finished(&self, summary: &RunSummary) {
        let sent = Message::run_finished(self.topic.clone(), summary)
            .map_err(|e| RouterError::Handler(e.to_string()))
            .and_then(|message| self.router.publish(message));
        if let Err(e) = sent {
            warn!(topic = %self.topic, run_id = %summary.run_id, error = %e, "Failed to publish run finished");
        }
    }
}
