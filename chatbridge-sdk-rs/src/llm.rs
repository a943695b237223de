use genai::Client;
use genai::chat::{ChatMessage, ChatRequest};
use serde::Deserialize;
use std::env;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error(transparent)]
    Genai(#[from] genai::Error),
}

#[derive(Clone)]
pub struct LLM {
    pub model: String,
    pub client: Client,
    pub api_key: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LLMConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub reasoning_effort: Option<String>,
}

impl LLM {
    pub fn new(config: LLMConfig) -> Self {
        let client = Client::default();
        Self {
            model: config.model,
            client,
            api_key: config.api_key,
            reasoning_effort: config.reasoning_effort,
        }
    }

    pub async fn completion(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<genai::chat::Tool>>,
    ) -> Result<LLMResponse, LlmError> {
        let mut chat_req = ChatRequest::new(messages);

        if let Some(t) = tools {
            chat_req = chat_req.with_tools(t);
        }

        if let Some(key) = &self.api_key {
            if self.model.starts_with("gpt") && env::var("OPENAI_API_KEY").is_err() {
                unsafe {
                    env::set_var("OPENAI_API_KEY", key);
                }
            }
            if self.model.starts_with("claude") && env::var("ANTHROPIC_API_KEY").is_err() {
                unsafe {
                    env::set_var("ANTHROPIC_API_KEY", key);
                }
            }
        }

        let output = self.client.exec_chat(&self.model, chat_req, None).await?;

        let text: String = output.content.texts().join("");
        let tool_calls: Vec<genai::chat::ToolCall> =
            output.tool_calls().iter().map(|t| (*t).clone()).collect();
        let input_tokens = output
            .usage
            .prompt_tokens
            .and_then(|t| u64::try_from(t).ok());
        let output_tokens = output
            .usage
            .completion_tokens
            .and_then(|t| u64::try_from(t).ok());

        Ok(LLMResponse {
            content: text,
            tool_calls,
            input_tokens,
            output_tokens,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: String,
    pub tool_calls: Vec<genai::chat::ToolCall>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}
