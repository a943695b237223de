//! Browser transport: drains a session's delivery channel into an SSE stream.

use axum::response::sse::Event;
use chatbridge_sdk_rs::session::SessionManager;
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const MESSAGE_EVENT: &str = "message";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// One `event: message` frame. Multi-line payloads become one `data:` line
/// per input line.
pub fn message_event(payload: &str) -> Event {
    Event::default().event(MESSAGE_EVENT).data(payload)
}

pub fn heartbeat_event() -> Event {
    Event::default().event(HEARTBEAT_EVENT).data("ping")
}

/// Unregisters the session when the stream is dropped, which is how hyper
/// reports a peer that went away.
struct UnregisterGuard {
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        if self.sessions.unregister(&self.session_id) {
            info!(session_id = %self.session_id, "Client disconnected");
        }
    }
}

struct StreamState {
    outbound: mpsc::Receiver<String>,
    disconnect: CancellationToken,
    heartbeat: Duration,
    guard: UnregisterGuard,
}

/// Waits on the next frame, the disconnect signal and the idle timer. The
/// timer is rebuilt on every wait, so it only fires after `heartbeat` of
/// silence.
pub fn event_stream(
    sessions: Arc<SessionManager>,
    session_id: String,
    outbound: mpsc::Receiver<String>,
    disconnect: CancellationToken,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = StreamState {
        outbound,
        disconnect,
        heartbeat,
        guard: UnregisterGuard {
            sessions,
            session_id,
        },
    };

    stream::unfold(state, |mut state| async move {
        let event = tokio::select! {
            _ = state.disconnect.cancelled() => {
                debug!(session_id = %state.guard.session_id, "Session closed, ending stream");
                return None;
            }
            frame = state.outbound.recv() => match frame {
                Some(frame) => message_event(&frame),
                None => return None,
            },
            _ = tokio::time::sleep(state.heartbeat) => heartbeat_event(),
        };
        Some((Ok(event), state))
    })
}
