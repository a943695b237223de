use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// One entry in a turn's ordered history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    System {
        text: String,
    },
    User {
        text: String,
    },
    Llm {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolUse {
        id: String,
        name: String,
        result: String,
    },
}

/// Conversation state handed to a tool-calling run and returned from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl Default for Turn {
    fn default() -> Self {
        Self::new()
    }
}

impl Turn {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            blocks: Vec::new(),
            data: HashMap::new(),
        }
    }

    pub fn append(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn append_user_text(&mut self, text: impl Into<String>) {
        self.append(Block::User { text: text.into() });
    }

    /// Merges `data` into the turn, overwriting existing keys.
    pub fn merge_data(&mut self, data: HashMap<String, Value>) {
        self.data.extend(data);
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.blocks.iter().rev().find_map(|b| match b {
            Block::User { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
