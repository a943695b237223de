use crate::backend::{LoopFailure, RunContext, ToolConfig, ToolLoop};
use crate::events::{Event, EventMetadata, LlmInferenceData, ToolCall as CallPayload, ToolResult};
use crate::llm::{LLM, LLMResponse};
use crate::prompts::SYSTEM_PROMPT;
use crate::runtime::Runtime;
use crate::turn::{Block, Turn};
use async_trait::async_trait;
use genai::chat::{ChatMessage, ChatRole, ContentPart, ToolCall, ToolResponse};
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

/// LLM-driven tool loop: asks the model, runs any tools it calls, feeds the
/// results back, and repeats until the model answers without tool calls.
pub struct AgentToolLoop {
    llm: LLM,
    runtime: Arc<dyn Runtime>,
    system_message: String,
}

impl AgentToolLoop {
    pub fn new(llm: LLM, runtime: Arc<dyn Runtime>, system_message: &str) -> Self {
        let system_message = if system_message.is_empty() {
            SYSTEM_PROMPT.to_string()
        } else {
            format!("{}\n\n{}", SYSTEM_PROMPT, system_message)
        };
        Self {
            llm,
            runtime,
            system_message,
        }
    }

    fn history(&self, turn: &Turn) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_message.clone())];
        for block in &turn.blocks {
            match block {
                Block::System { text } => messages.push(ChatMessage::system(text.clone())),
                Block::User { text } => messages.push(ChatMessage::user(text.clone())),
                Block::Llm { text } => messages.push(ChatMessage::assistant(text.clone())),
                Block::ToolCall {
                    id,
                    name,
                    arguments,
                } => messages.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content: vec![ContentPart::ToolCall(ToolCall {
                        call_id: id.clone(),
                        fn_name: name.clone(),
                        fn_arguments: arguments.clone(),
                    })]
                    .into(),
                    options: None,
                }),
                Block::ToolUse { id, result, .. } => messages.push(ChatMessage::from(
                    ToolResponse::new(id.clone(), result.clone()),
                )),
            }
        }
        messages
    }

    fn tool_specs(&self) -> Option<Vec<genai::chat::Tool>> {
        let tools: Vec<genai::chat::Tool> = self
            .runtime
            .tools()
            .iter()
            .map(|t| genai::chat::Tool {
                name: t.name(),
                description: Some(t.description()),
                schema: Some(t.parameters()),
                config: None,
            })
            .collect();
        if tools.is_empty() { None } else { Some(tools) }
    }

    /// One model call, streamed to the sinks as start/partial/final.
    async fn infer(
        &self,
        ctx: &RunContext,
        turn: &Turn,
        messages: &[ChatMessage],
        tools: Option<Vec<genai::chat::Tool>>,
        deadline: Instant,
    ) -> Result<LLMResponse, anyhow::Error> {
        let mut meta = EventMetadata::new(ctx.run_id(), &turn.id).with_model(&self.llm.model);
        ctx.publish(Event::PartialStart { meta: meta.clone() });

        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                ctx.publish(Event::Interrupt { meta, text: String::new() });
                return Err(anyhow::anyhow!("run cancelled"));
            }
            response = timeout_at(deadline, self.llm.completion(messages.to_vec(), tools)) => response,
        };
        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                ctx.publish(Event::Error {
                    meta,
                    error: e.to_string(),
                });
                return Err(e.into());
            }
            Err(_) => {
                ctx.publish(Event::Error {
                    meta,
                    error: "run timed out".to_string(),
                });
                return Err(anyhow::anyhow!("run timed out"));
            }
        };

        meta.llm = Some(LlmInferenceData {
            model: Some(self.llm.model.clone()),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        });
        if !response.content.is_empty() {
            ctx.publish(Event::Partial {
                meta: meta.clone(),
                delta: response.content.clone(),
                completion: response.content.clone(),
            });
        }
        ctx.publish(Event::Final {
            meta,
            text: response.content.clone(),
        });
        Ok(response)
    }

    /// Runs one tool call and publishes its lifecycle. The call's card is
    /// always completed, including when the run deadline cuts it short.
    async fn call_tool(
        &self,
        ctx: &RunContext,
        turn: &mut Turn,
        tool_call: &ToolCall,
        deadline: Instant,
    ) -> Result<String, anyhow::Error> {
        let meta = EventMetadata::new(ctx.run_id(), &turn.id);
        let payload = CallPayload {
            id: tool_call.call_id.clone(),
            name: tool_call.fn_name.clone(),
            input: tool_call.fn_arguments.to_string(),
        };
        turn.append(Block::ToolCall {
            id: tool_call.call_id.clone(),
            name: tool_call.fn_name.clone(),
            arguments: tool_call.fn_arguments.clone(),
        });
        ctx.publish(Event::ToolCall {
            meta: meta.clone(),
            tool_call: payload.clone(),
        });
        ctx.publish(Event::ToolCallExecute {
            meta: meta.clone(),
            tool_call: payload,
        });

        info!(
            run_id = %ctx.run_id(),
            tool = %tool_call.fn_name,
            args = %tool_call.fn_arguments,
            "Executing tool"
        );
        let execution = timeout_at(
            deadline,
            self.runtime
                .execute(&tool_call.fn_name, tool_call.fn_arguments.clone()),
        )
        .await;
        let (output, timed_out) = match execution {
            Ok(Ok(s)) => (s, false),
            Ok(Err(e)) => (format!("Error: {}", e), false),
            Err(_) => ("Error: run timed out".to_string(), true),
        };

        ctx.publish(Event::ToolResult {
            meta,
            tool_result: ToolResult {
                id: tool_call.call_id.clone(),
                result: output.clone(),
            },
        });
        turn.append(Block::ToolUse {
            id: tool_call.call_id.clone(),
            name: tool_call.fn_name.clone(),
            result: output.clone(),
        });

        if timed_out {
            return Err(anyhow::anyhow!(
                "run timed out during tool {}",
                tool_call.fn_name
            ));
        }
        Ok(output)
    }
}

#[async_trait]
impl ToolLoop for AgentToolLoop {
    async fn run(
        &self,
        ctx: RunContext,
        mut turn: Turn,
        config: &ToolConfig,
    ) -> Result<Turn, LoopFailure> {
        let deadline = Instant::now() + config.timeout;
        let tools = self.tool_specs();
        let mut messages = self.history(&turn);

        for iteration in 0..config.max_iterations {
            if ctx.is_cancelled() {
                return Err(LoopFailure::cancelled(turn));
            }
            debug!(run_id = %ctx.run_id(), iteration, "Starting iteration");

            let response = match self
                .infer(&ctx, &turn, &messages, tools.clone(), deadline)
                .await
            {
                Ok(response) => response,
                Err(e) => return Err(LoopFailure::new(e, Some(turn))),
            };

            if !response.content.is_empty() {
                turn.append(Block::Llm {
                    text: response.content.clone(),
                });
            }
            if response.tool_calls.is_empty() {
                return Ok(turn);
            }

            let mut assistant_parts = vec![];
            if !response.content.is_empty() {
                assistant_parts.push(ContentPart::Text(response.content.clone()));
            }
            for tool_call in &response.tool_calls {
                assistant_parts.push(ContentPart::ToolCall(tool_call.clone()));
            }
            messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: assistant_parts.into(),
                options: None,
            });

            for tool_call in &response.tool_calls {
                let output = match self.call_tool(&ctx, &mut turn, tool_call, deadline).await {
                    Ok(output) => output,
                    Err(e) => return Err(LoopFailure::new(e, Some(turn))),
                };
                messages.push(ChatMessage::from(ToolResponse::new(
                    tool_call.call_id.clone(),
                    output,
                )));
            }
        }

        Err(LoopFailure::new(
            anyhow::anyhow!("max iterations ({}) reached", config.max_iterations),
            Some(turn),
        ))
    }
}
