use crate::events::{Event, EventMetadata, ToolResult};
use crate::timeline::{
    EntityCompleted, EntityCreated, EntityId, EntityUpdated, Props, UiOp,
};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Version source for UI operations.
///
/// Returns wall-clock nanoseconds, bumped to `last + 1` whenever the clock
/// does not advance between reads, so successive versions strictly increase.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicI64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            }) {
            Ok(prev) | Err(prev) => now.max(prev + 1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("partial for {entity} is not cumulative: completion does not end with delta")]
    NonCumulativePartial { entity: EntityId },
    #[error("failed to render ui operation: {0}")]
    Render(#[from] serde_json::Error),
}

pub const THINKING_STARTED: &str = "thinking-started";
pub const THINKING_ENDED: &str = "thinking-ended";

/// Maps inference events onto UI operations.
///
/// Each call is independent; the only shared state is the version clock.
/// `info` events only matter when they open or close a thinking stream,
/// which gets its own `llm_text` entity next to the message.
#[derive(Debug, Clone, Default)]
pub struct EventTranslator {
    clock: Arc<VersionClock>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<VersionClock>) -> Self {
        Self { clock }
    }

    pub fn translate(&self, event: &Event) -> Result<Vec<UiOp>, TranslateError> {
        let meta = event.metadata();
        let message_id = EntityId::llm_text(meta.id.to_string());

        let ops = match event {
            Event::PartialStart { .. } => {
                let mut props = object(json!({
                    "role": "assistant",
                    "text": "",
                    "streaming": true,
                }));
                attach_inference(&mut props, meta);
                vec![self.created(message_id, props)]
            }
            Event::Partial {
                delta, completion, ..
            } => {
                if !completion.ends_with(delta.as_str()) {
                    return Err(TranslateError::NonCumulativePartial { entity: message_id });
                }
                let mut patch = object(json!({
                    "text": completion,
                    "streaming": true,
                }));
                attach_inference(&mut patch, meta);
                vec![self.updated(message_id, patch)]
            }
            Event::Final { text, .. } | Event::Interrupt { text, .. } => {
                self.finish_text(message_id, text.clone(), meta)
            }
            Event::Error { error, .. } => {
                self.finish_text(message_id, format!("**Error**\n\n{error}"), meta)
            }
            Event::ToolCall { tool_call, .. } => {
                let props = object(json!({
                    "name": tool_call.name,
                    "input": tool_call.input,
                }));
                vec![self.created(EntityId::tool_call(&tool_call.id), props)]
            }
            Event::ToolCallExecute { tool_call, .. } => {
                let patch = object(json!({
                    "exec": true,
                    "input": tool_call.input,
                }));
                vec![self.updated(EntityId::tool_call(&tool_call.id), patch)]
            }
            Event::ToolResult { tool_result, .. }
            | Event::ToolCallExecutionResult { tool_result, .. } => {
                self.finish_tool(tool_result)
            }
            Event::ModeSwitch { message, data, .. } => {
                let mut props = object(json!({ "kind": "agent_mode", "title": message }));
                props.extend(data.clone());
                self.announce(format!("agentmode-{}", meta.turn_id), props)
            }
            Event::Log {
                level,
                message,
                fields,
                ..
            } => {
                let level = if level.is_empty() { "info" } else { level };
                let mut props = object(json!({
                    "kind": "log",
                    "level": level,
                    "message": message,
                }));
                if !fields.is_empty() {
                    props.insert("fields".to_string(), Value::Object(fields.clone()));
                }
                self.announce(format!("log-{}", meta.turn_id), props)
            }
            Event::Info { message, .. } => match message.as_str() {
                THINKING_STARTED => {
                    let props = object(json!({
                        "role": "thinking",
                        "text": "",
                        "streaming": true,
                    }));
                    vec![self.created(thinking_id(meta), props)]
                }
                THINKING_ENDED => {
                    let id = thinking_id(meta);
                    vec![
                        self.updated(id.clone(), object(json!({ "streaming": false }))),
                        self.completed(id, Props::new()),
                    ]
                }
                _ => Vec::new(),
            },
        };
        Ok(ops)
    }

    /// Translates and serializes each operation for a text transport.
    pub fn render(&self, event: &Event) -> Result<Vec<String>, TranslateError> {
        self.translate(event)?
            .iter()
            .map(|op| op.to_json().map_err(TranslateError::from))
            .collect()
    }

    fn created(&self, id: EntityId, props: Props) -> UiOp {
        UiOp::Created(EntityCreated {
            id,
            props,
            version: self.clock.next(),
            started_at: Utc::now(),
        })
    }

    fn updated(&self, id: EntityId, patch: Props) -> UiOp {
        UiOp::Updated(EntityUpdated {
            id,
            patch,
            version: self.clock.next(),
            updated_at: Utc::now(),
        })
    }

    fn completed(&self, id: EntityId, result: Props) -> UiOp {
        UiOp::Completed(EntityCompleted {
            id,
            result,
            version: self.clock.next(),
        })
    }

    fn finish_text(&self, id: EntityId, text: String, meta: &EventMetadata) -> Vec<UiOp> {
        let mut result = object(json!({ "text": text }));
        attach_inference(&mut result, meta);
        vec![
            self.completed(id.clone(), result),
            self.updated(id, object(json!({ "streaming": false }))),
        ]
    }

    fn finish_tool(&self, tool_result: &ToolResult) -> Vec<UiOp> {
        let id = EntityId::tool_call(&tool_result.id);
        let payload = object(json!({ "result": tool_result.result }));
        vec![
            self.updated(id.clone(), payload.clone()),
            self.completed(id, payload),
        ]
    }

    /// One-shot `plain` entity. The id is generated once and shared by the
    /// create and the complete.
    fn announce(&self, prefix: String, props: Props) -> Vec<UiOp> {
        let id = EntityId::plain(format!("{prefix}-{}", Uuid::new_v4().simple()));
        vec![
            self.created(id.clone(), props.clone()),
            self.completed(id, props),
        ]
    }
}

fn thinking_id(meta: &EventMetadata) -> EntityId {
    EntityId::llm_text(format!("{}:thinking", meta.id))
}

fn object(value: Value) -> Props {
    match value {
        Value::Object(map) => map,
        _ => Props::new(),
    }
}

fn attach_inference(props: &mut Props, meta: &EventMetadata) {
    if let Some(llm) = &meta.llm {
        if let Ok(value) = serde_json::to_value(llm) {
            props.insert("metadata".to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ToolCall;
    use crate::timeline::{EntityKind, Timeline};
    use serde_json::Map;

    fn meta() -> EventMetadata {
        EventMetadata::new("run-1", "turn-1")
    }

    fn tool_call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "calc".to_string(),
            input: r#"{"a":1,"b":2}"#.to_string(),
        }
    }

    #[test]
    fn test_version_clock_is_strictly_increasing() {
        let clock = VersionClock::new();
        let mut last = clock.next();
        for _ in 0..10_000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_streaming_text_lifecycle() {
        let translator = EventTranslator::new();
        let meta = meta();
        let id = EntityId::llm_text(meta.id.to_string());
        let events = vec![
            Event::PartialStart { meta: meta.clone() },
            Event::Partial {
                meta: meta.clone(),
                delta: "he".to_string(),
                completion: "he".to_string(),
            },
            Event::Partial {
                meta: meta.clone(),
                delta: "llo".to_string(),
                completion: "hello".to_string(),
            },
            Event::Final {
                meta: meta.clone(),
                text: "hello".to_string(),
            },
        ];

        let mut timeline = Timeline::new();
        let mut ops = Vec::new();
        for event in &events {
            for op in translator.translate(event).unwrap() {
                timeline.apply(&op).unwrap();
                ops.push(op);
            }
        }

        assert_eq!(ops.len(), 5);
        assert!(matches!(ops[0], UiOp::Created(_)));
        assert!(matches!(ops[3], UiOp::Completed(_)));
        match &ops[4] {
            UiOp::Updated(u) => assert_eq!(u.patch["streaming"], false),
            other => panic!("unexpected op: {other:?}"),
        }
        let entity = timeline.get(&id).unwrap();
        assert_eq!(entity.result.as_ref().unwrap()["text"], "hello");
        assert!(!entity.streaming());
    }

    #[test]
    fn test_interrupt_completes_with_partial_text_then_settles() {
        let translator = EventTranslator::new();
        let meta = meta();
        let ops = translator
            .translate(&Event::Interrupt {
                meta: meta.clone(),
                text: "hal".to_string(),
            })
            .unwrap();

        assert_eq!(ops.len(), 2);
        match (&ops[0], &ops[1]) {
            (UiOp::Completed(c), UiOp::Updated(u)) => {
                assert_eq!(c.result["text"], "hal");
                assert_eq!(u.patch.len(), 1);
                assert_eq!(u.patch["streaming"], false);
                assert!(u.version > c.version);
                assert_eq!(c.id, u.id);
            }
            other => panic!("unexpected ops: {other:?}"),
        }
    }

    #[test]
    fn test_error_text_is_formatted() {
        let translator = EventTranslator::new();
        let ops = translator
            .translate(&Event::Error {
                meta: meta(),
                error: "rate limited".to_string(),
            })
            .unwrap();
        match &ops[0] {
            UiOp::Completed(c) => assert_eq!(c.result["text"], "**Error**\n\nrate limited"),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn test_non_cumulative_partial_is_rejected() {
        let translator = EventTranslator::new();
        let err = translator
            .translate(&Event::Partial {
                meta: meta(),
                delta: "llo".to_string(),
                completion: "he".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, TranslateError::NonCumulativePartial { .. }));
    }

    #[test]
    fn test_tool_call_and_result_share_one_entity() {
        let translator = EventTranslator::new();
        let call = tool_call("call_42");
        let events = vec![
            Event::ToolCall {
                meta: meta(),
                tool_call: call.clone(),
            },
            Event::ToolCallExecute {
                meta: meta(),
                tool_call: call.clone(),
            },
            Event::ToolResult {
                meta: meta(),
                tool_result: ToolResult {
                    id: "call_42".to_string(),
                    result: "3".to_string(),
                },
            },
        ];

        let ops: Vec<UiOp> = events
            .iter()
            .flat_map(|e| translator.translate(e).unwrap())
            .collect();
        let id = EntityId::tool_call("call_42");
        assert!(ops.iter().all(|op| op.id() == &id));
        let creates = ops.iter().filter(|op| matches!(op, UiOp::Created(_))).count();
        let completes = ops
            .iter()
            .filter(|op| matches!(op, UiOp::Completed(_)))
            .count();
        assert_eq!((creates, completes), (1, 1));
        assert!(matches!(ops.last(), Some(UiOp::Completed(c)) if c.result["result"] == "3"));

        let mut timeline = Timeline::new();
        for op in &ops {
            timeline.apply(op).unwrap();
        }
    }

    #[test]
    fn test_execution_result_behaves_like_tool_result() {
        let translator = EventTranslator::new();
        let ops = translator
            .translate(&Event::ToolCallExecutionResult {
                meta: meta(),
                tool_result: ToolResult {
                    id: "call_7".to_string(),
                    result: "ok".to_string(),
                },
            })
            .unwrap();
        assert!(matches!(&ops[0], UiOp::Updated(u) if u.patch["result"] == "ok"));
        assert!(matches!(&ops[1], UiOp::Completed(_)));
    }

    #[test]
    fn test_mode_switches_pair_create_and_complete_on_one_id() {
        let translator = EventTranslator::new();
        let mut data = Map::new();
        data.insert("from".to_string(), json!("analyst"));
        data.insert("to".to_string(), json!("reviewer"));
        let event = Event::ModeSwitch {
            meta: meta(),
            message: "switching".to_string(),
            data,
        };

        let first = translator.translate(&event).unwrap();
        let second = translator.translate(&event).unwrap();
        for pair in [&first, &second] {
            assert_eq!(pair.len(), 2);
            assert!(matches!(pair[0], UiOp::Created(_)));
            assert!(matches!(pair[1], UiOp::Completed(_)));
            assert_eq!(pair[0].id(), pair[1].id());
            assert_eq!(pair[0].id().kind, EntityKind::Plain);
        }
        assert_ne!(first[0].id(), second[0].id());
        match &first[0] {
            UiOp::Created(c) => {
                assert_eq!(c.props["title"], "switching");
                assert_eq!(c.props["to"], "reviewer");
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn test_log_becomes_plain_announcement() {
        let translator = EventTranslator::new();
        let ops = translator
            .translate(&Event::Log {
                meta: meta(),
                level: String::new(),
                message: "tool registry loaded".to_string(),
                fields: Map::new(),
            })
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], UiOp::Created(c) if c.props["level"] == "info"));
    }

    #[test]
    fn test_thinking_info_opens_and_closes_a_thinking_entity() {
        let translator = EventTranslator::new();
        let meta = meta();
        let info = |message: &str| Event::Info {
            meta: meta.clone(),
            message: message.to_string(),
            data: Map::new(),
        };
        let thinking = EntityId::llm_text(format!("{}:thinking", meta.id));

        let started = translator.translate(&info(THINKING_STARTED)).unwrap();
        assert_eq!(started.len(), 1);
        assert!(matches!(&started[0], UiOp::Created(c)
            if c.id == thinking && c.props["role"] == "thinking" && c.props["streaming"] == true));

        let ended = translator.translate(&info(THINKING_ENDED)).unwrap();
        assert_eq!(ended.len(), 2);
        assert!(matches!(&ended[0], UiOp::Updated(u)
            if u.id == thinking && u.patch["streaming"] == false));
        assert!(matches!(&ended[1], UiOp::Completed(c) if c.id == thinking));

        let mut timeline = Timeline::new();
        for op in started.iter().chain(&ended) {
            timeline.apply(op).unwrap();
        }

        assert!(translator.translate(&info("retrying request")).unwrap().is_empty());
    }

    #[test]
    fn test_render_produces_one_json_line_per_op() {
        let translator = EventTranslator::new();
        let frames = translator
            .render(&Event::Final {
                meta: meta(),
                text: "line one\nline two".to_string(),
            })
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| !f.contains('\n')));
        let last: Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(last["patch"]["streaming"], false);
    }
}
