use crate::backend::{LoopFailure, RunContext, ToolConfig, ToolLoop};
use crate::events::{Event, EventMetadata};
use crate::turn::{Block, Turn};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::debug;

pub const DEFAULT_ECHO_DELAY: Duration = Duration::from_millis(50);
const ECHO_MODEL: &str = "echo";
const FALLBACK_TEXT: &str = "Nothing to echo.";

/// Tool loop that streams the latest user message back one character at a
/// time. Useful for exercising the transport without an LLM.
#[derive(Debug, Clone)]
pub struct EchoToolLoop {
    delay: Duration,
}

impl Default for EchoToolLoop {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_DELAY)
    }
}

impl EchoToolLoop {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ToolLoop for EchoToolLoop {
    async fn run(
        &self,
        ctx: RunContext,
        mut turn: Turn,
        config: &ToolConfig,
    ) -> Result<Turn, LoopFailure> {
        if ctx.is_cancelled() {
            return Err(LoopFailure::cancelled(turn));
        }

        let text = turn
            .last_user_text()
            .filter(|t| !t.is_empty())
            .unwrap_or(FALLBACK_TEXT)
            .to_string();
        let meta = EventMetadata::new(ctx.run_id(), &turn.id).with_model(ECHO_MODEL);
        let deadline = Instant::now() + config.timeout;

        ctx.publish(Event::PartialStart { meta: meta.clone() });

        let mut completion = String::with_capacity(text.len());
        for ch in text.chars() {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!(run_id = %ctx.run_id(), chars = completion.chars().count(), "Echo interrupted");
                    ctx.publish(Event::Interrupt { meta, text: completion.clone() });
                    turn.append(Block::Llm { text: completion });
                    return Err(LoopFailure::cancelled(turn));
                }
                _ = sleep_until(deadline) => {
                    let error = format!("run timed out after {:?}", config.timeout);
                    ctx.publish(Event::Error { meta, error: error.clone() });
                    turn.append(Block::Llm { text: completion });
                    return Err(LoopFailure::new(anyhow::anyhow!(error), Some(turn)));
                }
                _ = sleep(self.delay) => {}
            }
            completion.push(ch);
            ctx.publish(Event::Partial {
                meta: meta.clone(),
                delta: ch.to_string(),
                completion: completion.clone(),
            });
        }

        ctx.publish(Event::Final {
            meta,
            text: completion.clone(),
        });
        turn.append(Block::Llm { text: completion });
        Ok(turn)
    }
}
