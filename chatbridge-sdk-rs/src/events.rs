use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Inference-level metadata attached by the engine (model name, token usage).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmInferenceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Identifies the entity that produced an event and the run/turn it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: Uuid,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmInferenceData>,
}

impl EventMetadata {
    pub fn new(run_id: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: run_id.into(),
            turn_id: turn_id.into(),
            llm: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.llm
            .get_or_insert_with(LlmInferenceData::default)
            .model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    #[serde(default)]
    pub result: String,
}

/// The closed set of events published by the inference engine.
///
/// On the wire every event is a JSON object with a `type` discriminator and a
/// `meta` block. `Partial` carries both `delta` and `completion`; `completion`
/// is the cumulative text so far and is the only field consumers render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    #[serde(rename = "start")]
    PartialStart { meta: EventMetadata },
    Partial {
        meta: EventMetadata,
        #[serde(default)]
        delta: String,
        completion: String,
    },
    Final {
        meta: EventMetadata,
        #[serde(default)]
        text: String,
    },
    Interrupt {
        meta: EventMetadata,
        #[serde(default)]
        text: String,
    },
    Error {
        meta: EventMetadata,
        error: String,
    },
    ToolCall {
        meta: EventMetadata,
        tool_call: ToolCall,
    },
    ToolCallExecute {
        meta: EventMetadata,
        tool_call: ToolCall,
    },
    ToolResult {
        meta: EventMetadata,
        tool_result: ToolResult,
    },
    ToolCallExecutionResult {
        meta: EventMetadata,
        tool_result: ToolResult,
    },
    #[serde(rename = "agent-mode-switch")]
    ModeSwitch {
        meta: EventMetadata,
        #[serde(default)]
        message: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Log {
        meta: EventMetadata,
        #[serde(default)]
        level: String,
        message: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    Info {
        meta: EventMetadata,
        message: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("malformed event payload: {0}")]
pub struct EventParseError(#[from] serde_json::Error);

impl Event {
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Event::PartialStart { meta }
            | Event::Partial { meta, .. }
            | Event::Final { meta, .. }
            | Event::Interrupt { meta, .. }
            | Event::Error { meta, .. }
            | Event::ToolCall { meta, .. }
            | Event::ToolCallExecute { meta, .. }
            | Event::ToolResult { meta, .. }
            | Event::ToolCallExecutionResult { meta, .. }
            | Event::ModeSwitch { meta, .. }
            | Event::Log { meta, .. }
            | Event::Info { meta, .. } => meta,
        }
    }

    /// Wire name of the event, as found in the `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::PartialStart { .. } => "start",
            Event::Partial { .. } => "partial",
            Event::Final { .. } => "final",
            Event::Interrupt { .. } => "interrupt",
            Event::Error { .. } => "error",
            Event::ToolCall { .. } => "tool-call",
            Event::ToolCallExecute { .. } => "tool-call-execute",
            Event::ToolResult { .. } => "tool-result",
            Event::ToolCallExecutionResult { .. } => "tool-call-execution-result",
            Event::ModeSwitch { .. } => "agent-mode-switch",
            Event::Log { .. } => "log",
            Event::Info { .. } => "info",
        }
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, EventParseError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("event sink is closed")]
    Closed,
}

/// Destination for events produced during a run. Publishing must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event) -> Result<(), SinkError>;
}
