//! Session registry.
//!
//! One lock guards membership only. Each session keeps its own locks for run
//! state (inside the backend) and for the outbound receiver.

use crate::backend::{
    BackendError, FinishedSignal, RunSummary, ToolConfig, ToolLoop, ToolLoopBackend,
};
use crate::delivery::{DEFAULT_CHANNEL_CAPACITY, DeliveryChannel, delivery_channel};
use crate::events::EventSink;
use crate::router::{EventRouter, Handler, Inbound, Message};
use crate::translator::{EventTranslator, TranslateError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel_capacity: usize,
    pub tool_config: ToolConfig,
    /// Seeded into every new session's turn.
    pub initial_data: HashMap<String, Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            tool_config: ToolConfig::default(),
            initial_data: HashMap::new(),
        }
    }
}

pub struct Session {
    id: String,
    topic: String,
    backend: ToolLoopBackend,
    delivery: DeliveryChannel<String>,
    disconnect: CancellationToken,
    outbound: Mutex<Option<mpsc::Receiver<String>>>,
    created_at: Instant,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn backend(&self) -> &ToolLoopBackend {
        &self.backend
    }

    /// Starts a run bound to this session's disconnect signal.
    pub fn start(&self, prompt: &str) -> Result<JoinHandle<RunSummary>, BackendError> {
        self.backend.start(&self.disconnect, prompt)
    }

    /// Hands out the receiving end of the delivery channel. Only the first
    /// caller gets it; a session has a single transport.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether a transport has taken the outbound receiver.
    pub fn is_attached(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.delivery.dropped()
    }

    pub fn is_closed(&self) -> bool {
        self.disconnect.is_cancelled()
    }
}

pub fn topic_for(session_id: &str) -> String {
    format!("session.{session_id}")
}

/// Frame announcing the end of a run. Sent only in response to the backend's
/// finished signal.
pub fn run_finished_frame(summary: &RunSummary) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "type": "run-finished",
        "run_id": summary.run_id,
        "generation": summary.generation,
        "outcome": summary.outcome,
    }))
}

/// Router handler that renders a session's events and queues them for its
/// transport. A full queue drops the frame and counts it.
pub fn delivery_forwarder(
    session_id: String,
    delivery: DeliveryChannel<String>,
    translator: EventTranslator,
) -> Handler {
    Arc::new(move |message: &Message| {
        let frames = match message.decode()? {
            Inbound::Event(event) => {
                debug!(session_id = %session_id, event_type = event.type_name(), "Forwarding event");
                translator.render(&event)?
            }
            Inbound::RunFinished(summary) => {
                vec![run_finished_frame(&summary).map_err(TranslateError::from)?]
            }
        };
        for frame in frames {
            if delivery.try_send(frame) {
                continue;
            }
            if delivery.is_closed() {
                debug!(session_id = %session_id, "Transport gone, discarding frame");
            } else {
                warn!(
                    session_id = %session_id,
                    dropped = delivery.dropped(),
                    "Delivery channel full, dropping frame"
                );
            }
        }
        Ok(())
    })
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    router: EventRouter,
    engine: Arc<dyn ToolLoop>,
    translator: EventTranslator,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(router: EventRouter, engine: Arc<dyn ToolLoop>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            router,
            engine,
            translator: EventTranslator::new(),
            config,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns the session for `id`, creating it on first contact. The flag is
    /// `true` when the session was created by this call.
    ///
    /// A session is normally torn down when its transport closes. One that
    /// never gets a transport is only removed by [`Self::prune_unattached`].
    pub fn get_or_create(&self, id: &str) -> (Arc<Session>, bool) {
        if let Some(session) = self.get(id) {
            return (session, false);
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let session = self.create_session(id);
                entry.insert(Arc::clone(&session));
                info!(session_id = %id, "Session created");
                (session, true)
            }
        }
    }

    /// Builds a session and subscribes it to its topic without registering it.
    pub fn create_session(&self, id: &str) -> Arc<Session> {
        let topic = topic_for(id);
        let (delivery, outbound) = delivery_channel(self.config.channel_capacity);
        let sink = Arc::new(self.router.sink(topic.clone()));
        let backend = ToolLoopBackend::new(
            Arc::clone(&self.engine),
            vec![sink.clone() as Arc<dyn EventSink>],
            sink as Arc<dyn FinishedSignal>,
        )
        .with_config(self.config.tool_config.clone())
        .with_initial_turn_data(self.config.initial_data.clone());

        self.router.add_handler(
            topic.clone(),
            delivery_forwarder(id.to_string(), delivery.clone(), self.translator.clone()),
        );

        Arc::new(Session {
            id: id.to_string(),
            topic,
            backend,
            delivery,
            disconnect: CancellationToken::new(),
            outbound: Mutex::new(Some(outbound)),
            created_at: Instant::now(),
        })
    }

    /// Inserts `session`. On an id collision the last write wins and the
    /// replaced session is returned untouched.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let replaced = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), session);
        if let Some(old) = &replaced {
            warn!(session_id = %old.id, "Session id collision, replacing registered session");
        }
        replaced
    }

    /// Tears a session down. Returns `false` if it was already gone.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(session) = removed else {
            debug!(session_id = %id, "Unregister for unknown session");
            return false;
        };
        self.teardown(&session);
        true
    }

    /// Unregisters idle sessions older than `ttl` whose transport never
    /// attached. Returns how many were removed.
    pub fn prune_unattached(&self, ttl: Duration) -> usize {
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| {
                    !s.is_attached()
                        && s.backend.is_finished()
                        && s.created_at.elapsed() >= ttl
                })
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &stale {
            self.teardown(session);
        }
        if !stale.is_empty() {
            info!(pruned = stale.len(), "Pruned sessions without a transport");
        }
        stale.len()
    }

    fn teardown(&self, session: &Session) {
        session.delivery.close();
        // Cancels any active run too: runs hang off this token.
        session.disconnect.cancel();
        self.router.remove_handler(&session.topic);
        info!(session_id = %session.id, dropped = session.dropped(), "Session unregistered");
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
