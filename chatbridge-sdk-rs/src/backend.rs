//! Run lifecycle for one session.
//!
//! `ToolLoopBackend` owns the conversation turn, enforces at most one active
//! run, and drives an external [`ToolLoop`] on a spawned task. Every run ends
//! with exactly one [`FinishedSignal::run_finished`] call.

use crate::events::{Event, EventSink};
use crate::turn::Turn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ITERATIONS: usize = 5;
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounds handed to the tool-calling loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfig {
    pub max_iterations: usize,
    pub timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

impl ToolConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Handle given to a running loop: its cancellation token and event sinks.
#[derive(Clone)]
pub struct RunContext {
    run_id: String,
    cancel: CancellationToken,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        cancel: CancellationToken,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            cancel,
            sinks,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sends `event` to every sink. Sink failures are logged and skipped.
    pub fn publish(&self, event: Event) {
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&event) {
                warn!(
                    run_id = %self.run_id,
                    event_type = event.type_name(),
                    error = %e,
                    "Failed to publish event"
                );
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A failed run, carrying whatever turn state the loop had reached.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct LoopFailure {
    pub partial: Option<Turn>,
    pub error: anyhow::Error,
}

impl LoopFailure {
    pub fn new(error: impl Into<anyhow::Error>, partial: Option<Turn>) -> Self {
        Self {
            partial,
            error: error.into(),
        }
    }

    pub fn cancelled(partial: Turn) -> Self {
        Self::new(anyhow::anyhow!("run cancelled"), Some(partial))
    }
}

/// The external inference + tool-calling loop.
///
/// Implementations check the context's cancellation before starting each
/// iteration and honour the iteration and timeout bounds in `config`.
#[async_trait]
pub trait ToolLoop: Send + Sync {
    async fn run(&self, ctx: RunContext, turn: Turn, config: &ToolConfig)
    -> Result<Turn, LoopFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub generation: u64,
    pub outcome: RunOutcome,
}

/// Receives the single end-of-run notification.
pub trait FinishedSignal: Send + Sync {
    fn run_finished(&self, summary: &RunSummary);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend is already running")]
    AlreadyRunning,
}

/// The active run's generation and cancel handle. Both change together under
/// one lock, and `running` is only written while that lock is held.
#[derive(Default)]
struct RunSlot {
    generation: u64,
    cancel: Option<CancellationToken>,
}

struct RunState {
    running: AtomicBool,
    slot: Mutex<RunSlot>,
    turn: Mutex<Turn>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ToolLoopBackend {
    engine: Arc<dyn ToolLoop>,
    sinks: Vec<Arc<dyn EventSink>>,
    finished: Arc<dyn FinishedSignal>,
    config: ToolConfig,
    state: Arc<RunState>,
}

impl ToolLoopBackend {
    pub fn new(
        engine: Arc<dyn ToolLoop>,
        sinks: Vec<Arc<dyn EventSink>>,
        finished: Arc<dyn FinishedSignal>,
    ) -> Self {
        Self {
            engine,
            sinks,
            finished,
            config: ToolConfig::default(),
            state: Arc::new(RunState {
                running: AtomicBool::new(false),
                slot: Mutex::new(RunSlot::default()),
                turn: Mutex::new(Turn::new()),
            }),
        }
    }

    pub fn with_config(mut self, config: ToolConfig) -> Self {
        self.config = config;
        self
    }

    /// Merges `data` into the stored turn before any input is appended.
    pub fn with_initial_turn_data(self, data: HashMap<String, Value>) -> Self {
        lock(&self.state.turn).merge_data(data);
        self
    }

    /// Starts a run on the current tokio runtime.
    ///
    /// Fails with [`BackendError::AlreadyRunning`] without touching any state
    /// if a run is active. A non-empty `prompt` is appended to the turn as a
    /// user block. The returned handle resolves once the finished signal has
    /// been emitted.
    pub fn start(
        &self,
        parent: &CancellationToken,
        prompt: &str,
    ) -> Result<JoinHandle<RunSummary>, BackendError> {
        let mut slot = lock(&self.state.slot);
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackendError::AlreadyRunning);
        }

        slot.generation += 1;
        let generation = slot.generation;
        let run_id = Uuid::new_v4().to_string();
        let snapshot = {
            let mut turn = lock(&self.state.turn);
            if !prompt.is_empty() {
                turn.append_user_text(prompt);
            }
            turn.clone()
        };

        let cancel = parent.child_token();
        slot.cancel = Some(cancel.clone());
        drop(slot);

        let ctx = RunContext::new(run_id.clone(), cancel.clone(), self.sinks.clone());
        let engine = Arc::clone(&self.engine);
        let finished = Arc::clone(&self.finished);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();

        info!(run_id = %run_id, generation, "Starting tool loop");

        Ok(tokio::spawn(async move {
            // The loop runs on its own task so a panic surfaces as a JoinError
            // and the bookkeeping below still happens.
            let result =
                tokio::spawn(async move { engine.run(ctx, snapshot, &config).await }).await;
            let (updated, outcome) = match result {
                Ok(Ok(turn)) => (Some(turn), RunOutcome::Completed),
                Ok(Err(failure)) => {
                    let outcome = if cancel.is_cancelled() {
                        info!(run_id = %run_id, "Tool loop cancelled");
                        RunOutcome::Cancelled
                    } else {
                        error!(run_id = %run_id, error = %failure.error, "Tool loop failed");
                        RunOutcome::Failed(failure.error.to_string())
                    };
                    (failure.partial, outcome)
                }
                Err(join_error) => {
                    error!(run_id = %run_id, error = %join_error, "Tool loop panicked");
                    (None, RunOutcome::Failed(format!("tool loop panicked: {join_error}")))
                }
            };

            {
                let mut slot = lock(&state.slot);
                // A newer run may have started after a kill; leave its state alone.
                if slot.generation == generation {
                    if let Some(turn) = updated {
                        *lock(&state.turn) = turn;
                    }
                    slot.cancel = None;
                    state.running.store(false, Ordering::Release);
                } else {
                    warn!(run_id = %run_id, generation, "Discarding result of superseded run");
                }
            }

            let summary = RunSummary {
                run_id,
                generation,
                outcome,
            };
            finished.run_finished(&summary);
            summary
        }))
    }

    /// Requests cooperative cancellation of the active run.
    pub fn interrupt(&self) {
        match lock(&self.state.slot).cancel.as_ref() {
            Some(cancel) => cancel.cancel(),
            None => debug!("Interrupt requested but no run is active"),
        }
    }

    /// Cancels the active run and clears the bookkeeping immediately, without
    /// waiting for the worker to observe the cancellation.
    pub fn kill(&self) {
        let mut slot = lock(&self.state.slot);
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        self.state.running.store(false, Ordering::Release);
    }

    /// Advisory: a concurrent `start` may still fail.
    pub fn is_finished(&self) -> bool {
        !self.state.running.load(Ordering::Acquire)
    }

    pub fn turn(&self) -> Turn {
        lock(&self.state.turn).clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::{EventMetadata, SinkError};
    use crate::turn::Block;
    use tokio::sync::{Notify, mpsc};

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<Event>>,
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: &Event) -> Result<(), SinkError> {
            lock(&self.events).push(event.clone());
            Ok(())
        }
    }

    pub(crate) struct ChannelFinished(pub mpsc::UnboundedSender<RunSummary>);

    impl FinishedSignal for ChannelFinished {
        fn run_finished(&self, summary: &RunSummary) {
            let _ = self.0.send(summary.clone());
        }
    }

    /// Publishes a start event, then waits for `release` or cancellation.
    struct GatedLoop {
        release: Arc<Notify>,
        fail: bool,
    }

    #[async_trait]
    impl ToolLoop for GatedLoop {
        async fn run(
            &self,
            ctx: RunContext,
            mut turn: Turn,
            _config: &ToolConfig,
        ) -> Result<Turn, LoopFailure> {
            ctx.publish(Event::PartialStart {
                meta: EventMetadata::new(ctx.run_id(), &turn.id),
            });
            tokio::select! {
                _ = self.release.notified() => {}
                _ = ctx.cancelled() => return Err(LoopFailure::cancelled(turn)),
            }
            turn.append(Block::Llm {
                text: "answer".to_string(),
            });
            if self.fail {
                return Err(LoopFailure::new(anyhow::anyhow!("boom"), Some(turn)));
            }
            Ok(turn)
        }
    }

    fn backend(fail: bool) -> (
        ToolLoopBackend,
        Arc<Notify>,
        Arc<RecordingSink>,
        mpsc::UnboundedReceiver<RunSummary>,
    ) {
        let release = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = ToolLoopBackend::new(
            Arc::new(GatedLoop {
                release: Arc::clone(&release),
                fail,
            }),
            vec![sink.clone() as Arc<dyn EventSink>],
            Arc::new(ChannelFinished(tx)),
        );
        (backend, release, sink, rx)
    }

    #[tokio::test]
    async fn test_second_start_fails_without_mutating_turn() {
        let (backend, release, _sink, mut finished) = backend(false);
        let root = CancellationToken::new();

        let handle = backend.start(&root, "first").unwrap();
        assert!(!backend.is_finished());
        assert_eq!(
            backend.start(&root, "second").unwrap_err(),
            BackendError::AlreadyRunning
        );
        assert_eq!(backend.turn().len(), 1);

        release.notify_one();
        let summary = handle.await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert!(backend.is_finished());
        assert_eq!(finished.recv().await, Some(summary));
        assert!(finished.try_recv().is_err());

        let turn = backend.turn();
        assert_eq!(turn.last_user_text(), Some("first"));
        assert!(matches!(turn.blocks.last(), Some(Block::Llm { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_exactly_one() {
        let (backend, release, _sink, _finished) = backend(false);
        let backend = Arc::new(backend);
        let root = CancellationToken::new();

        let mut attempts = Vec::new();
        for i in 0..16 {
            let backend = Arc::clone(&backend);
            let root = root.clone();
            attempts.push(tokio::spawn(async move {
                backend.start(&root, &format!("prompt {i}")).ok()
            }));
        }
        let mut handles = Vec::new();
        for attempt in attempts {
            if let Some(handle) = attempt.await.unwrap() {
                handles.push(handle);
            }
        }
        assert_eq!(handles.len(), 1);

        release.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(backend.is_finished());
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_turn_and_still_signals() {
        let (backend, release, sink, mut finished) = backend(true);
        let handle = backend.start(&CancellationToken::new(), "hi").unwrap();
        release.notify_one();
        let summary = handle.await.unwrap();

        assert!(matches!(summary.outcome, RunOutcome::Failed(ref m) if m == "boom"));
        assert_eq!(finished.recv().await.map(|s| s.run_id), Some(summary.run_id));
        assert!(matches!(backend.turn().blocks.last(), Some(Block::Llm { .. })));
        assert_eq!(lock(&sink.events).len(), 1);
        assert!(backend.is_finished());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_cooperatively() {
        let (backend, _release, _sink, mut finished) = backend(false);
        let handle = backend.start(&CancellationToken::new(), "hi").unwrap();
        backend.interrupt();
        let summary = handle.await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(finished.recv().await.map(|s| s.outcome), Some(RunOutcome::Cancelled));
        assert!(backend.is_finished());
        // The partial turn keeps the prompt.
        assert_eq!(backend.turn().last_user_text(), Some("hi"));
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_the_run() {
        let (backend, _release, _sink, _finished) = backend(false);
        let parent = CancellationToken::new();
        let handle = backend.start(&parent, "hi").unwrap();
        parent.cancel();
        assert_eq!(handle.await.unwrap().outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_kill_clears_running_immediately_and_old_run_does_not_clobber() {
        let (backend, release, _sink, mut finished) = backend(false);
        let root = CancellationToken::new();
        let first = backend.start(&root, "one").unwrap();

        backend.kill();
        assert!(backend.is_finished());

        let second = backend.start(&root, "two").unwrap();
        assert!(!backend.is_finished());

        let first_summary = first.await.unwrap();
        assert_eq!(first_summary.generation, 1);
        // The superseded worker must not reset the newer run's flag.
        assert!(!backend.is_finished());

        release.notify_one();
        let second_summary = second.await.unwrap();
        assert_eq!(second_summary.generation, 2);
        assert!(backend.is_finished());

        let mut generations = vec![
            finished.recv().await.unwrap().generation,
            finished.recv().await.unwrap().generation,
        ];
        generations.sort_unstable();
        assert_eq!(generations, vec![1, 2]);
        assert_eq!(backend.turn().last_user_text(), Some("two"));
    }

    struct PanicLoop;

    #[async_trait]
    impl ToolLoop for PanicLoop {
        async fn run(
            &self,
            _ctx: RunContext,
            _turn: Turn,
            _config: &ToolConfig,
        ) -> Result<Turn, LoopFailure> {
            panic!("engine exploded");
        }
    }

    #[tokio::test]
    async fn test_panicking_loop_still_signals_and_frees_the_backend() {
        let (tx, mut finished) = mpsc::unbounded_channel();
        let backend = ToolLoopBackend::new(
            Arc::new(PanicLoop),
            Vec::new(),
            Arc::new(ChannelFinished(tx)),
        );
        let root = CancellationToken::new();

        let summary = backend.start(&root, "hi").unwrap().await.unwrap();
        assert!(matches!(summary.outcome, RunOutcome::Failed(ref m) if m.contains("panicked")));
        assert_eq!(finished.recv().await, Some(summary));
        assert!(backend.is_finished());
        // The prompt stays in the stored turn.
        assert_eq!(backend.turn().last_user_text(), Some("hi"));

        let again = backend.start(&root, "again").unwrap();
        assert!(again.await.is_ok());
    }

    /// Returns at once, except for the prompt "slow", which waits for
    /// cancellation.
    struct PromptLoop;

    #[async_trait]
    impl ToolLoop for PromptLoop {
        async fn run(
            &self,
            ctx: RunContext,
            turn: Turn,
            _config: &ToolConfig,
        ) -> Result<Turn, LoopFailure> {
            if turn.last_user_text() == Some("slow") {
                ctx.cancelled().await;
                return Err(LoopFailure::cancelled(turn));
            }
            Ok(turn)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_superseded_worker_never_releases_a_live_run() {
        let (tx, _finished) = mpsc::unbounded_channel();
        let backend = ToolLoopBackend::new(
            Arc::new(PromptLoop),
            Vec::new(),
            Arc::new(ChannelFinished(tx)),
        );
        let root = CancellationToken::new();

        for _ in 0..2_000 {
            let fast = backend.start(&root, "fast").unwrap();
            tokio::task::yield_now().await;
            backend.kill();
            let slow = backend.start(&root, "slow").unwrap();

            fast.await.unwrap();
            assert!(!backend.is_finished());
            assert_eq!(
                backend.start(&root, "third").unwrap_err(),
                BackendError::AlreadyRunning
            );

            backend.interrupt();
            assert_eq!(slow.await.unwrap().outcome, RunOutcome::Cancelled);
            assert!(backend.is_finished());
        }
    }

    #[tokio::test]
    async fn test_empty_prompt_is_not_appended() {
        let (backend, release, _sink, _finished) = backend(false);
        let handle = backend.start(&CancellationToken::new(), "").unwrap();
        release.notify_one();
        handle.await.unwrap();
        assert_eq!(backend.turn().last_user_text(), None);
    }

    #[test]
    fn test_initial_turn_data_is_merged() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = ToolLoopBackend::new(
            Arc::new(GatedLoop {
                release: Arc::new(Notify::new()),
                fail: false,
            }),
            Vec::new(),
            Arc::new(ChannelFinished(tx)),
        )
        .with_initial_turn_data(HashMap::from([(
            "server_tools".to_string(),
            Value::from(true),
        )]));
        assert_eq!(backend.turn().data["server_tools"], true);
        assert!(backend.is_finished());
    }

    #[test]
    fn test_tool_config_defaults() {
        let config = ToolConfig::default();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.timeout, Duration::from_secs(60));
        let config = config
            .with_max_iterations(2)
            .with_timeout(Duration::from_millis(10));
        assert_eq!(config.max_iterations, 2);
    }
}
