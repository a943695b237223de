//! UI-facing entity model.
//!
//! Every UI-visible unit (a streaming text block, a tool-call card, a one-shot
//! announcement) is an entity that goes through `Created`, zero or more
//! `Updated` and exactly one `Completed`. The only operation allowed after
//! `Completed` is a single settle update that flips `streaming` to false.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

pub type Props = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    LlmText,
    ToolCall,
    Plain,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::LlmText => "llm_text",
            EntityKind::ToolCall => "tool_call",
            EntityKind::Plain => "plain",
        }
    }
}

/// Two entities are the same only if both the local id and the kind match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub local_id: String,
    pub kind: EntityKind,
}

impl EntityId {
    pub fn new(local_id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            local_id: local_id.into(),
            kind,
        }
    }

    pub fn llm_text(local_id: impl Into<String>) -> Self {
        Self::new(local_id, EntityKind::LlmText)
    }

    pub fn tool_call(local_id: impl Into<String>) -> Self {
        Self::new(local_id, EntityKind::ToolCall)
    }

    pub fn plain(local_id: impl Into<String>) -> Self {
        Self::new(local_id, EntityKind::Plain)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.local_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreated {
    pub id: EntityId,
    pub props: Props,
    pub version: i64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdated {
    pub id: EntityId,
    pub patch: Props,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCompleted {
    pub id: EntityId,
    pub result: Props,
    pub version: i64,
}

/// A single UI operation produced by the translator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UiOp {
    Created(EntityCreated),
    Updated(EntityUpdated),
    Completed(EntityCompleted),
}

impl UiOp {
    pub fn id(&self) -> &EntityId {
        match self {
            UiOp::Created(c) => &c.id,
            UiOp::Updated(u) => &u.id,
            UiOp::Completed(c) => &c.id,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            UiOp::Created(c) => c.version,
            UiOp::Updated(u) => u.version,
            UiOp::Completed(c) => c.version,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Materialized state of one entity on the consumer side.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub version: i64,
    pub props: Props,
    pub result: Option<Props>,
    settled: bool,
}

impl Entity {
    pub fn streaming(&self) -> bool {
        self.props
            .get("streaming")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_completed(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimelineError {
    #[error("entity {0} already exists")]
    Duplicate(EntityId),
    #[error("entity {0} is unknown")]
    Unknown(EntityId),
    #[error("stale version {version} for entity {id} (last seen {last})")]
    StaleVersion {
        id: EntityId,
        version: i64,
        last: i64,
    },
    #[error("entity {0} was already completed")]
    AlreadyCompleted(EntityId),
    #[error("entity {0} was updated after completion")]
    UpdatedAfterComplete(EntityId),
}

/// Applies operations in arrival order and rejects any that break the
/// entity lifecycle or version ordering.
#[derive(Debug, Default)]
pub struct Timeline {
    entities: HashMap<EntityId, Entity>,
    order: Vec<EntityId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: &UiOp) -> Result<(), TimelineError> {
        match op {
            UiOp::Created(created) => {
                if self.entities.contains_key(&created.id) {
                    return Err(TimelineError::Duplicate(created.id.clone()));
                }
                self.order.push(created.id.clone());
                self.entities.insert(
                    created.id.clone(),
                    Entity {
                        id: created.id.clone(),
                        version: created.version,
                        props: created.props.clone(),
                        result: None,
                        settled: false,
                    },
                );
            }
            UiOp::Updated(updated) => {
                let entity = self.advance(&updated.id, updated.version)?;
                if entity.is_completed() {
                    let settle_only = updated.patch.keys().all(|k| k == "streaming");
                    if entity.settled || !settle_only {
                        return Err(TimelineError::UpdatedAfterComplete(updated.id.clone()));
                    }
                    entity.settled = true;
                }
                entity.version = updated.version;
                for (key, value) in &updated.patch {
                    entity.props.insert(key.clone(), value.clone());
                }
            }
            UiOp::Completed(completed) => {
                let entity = self.advance(&completed.id, completed.version)?;
                if entity.is_completed() {
                    return Err(TimelineError::AlreadyCompleted(completed.id.clone()));
                }
                entity.version = completed.version;
                entity.result = Some(completed.result.clone());
            }
        }
        Ok(())
    }

    fn advance(&mut self, id: &EntityId, version: i64) -> Result<&mut Entity, TimelineError> {
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| TimelineError::Unknown(id.clone()))?;
        if version <= entity.version {
            return Err(TimelineError::StaleVersion {
                id: id.clone(),
                version,
                last: entity.version,
            });
        }
        Ok(entity)
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Entities in creation order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.order.iter().filter_map(|id| self.entities.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
