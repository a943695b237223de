use crate::tools::{Tool, ToolError};
use async_trait::async_trait;
use serde_json::Value;

/// Where the agent's tool calls are executed.
///
/// Keeps the loop's decision-making separate from the execution environment.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Tools the agent may call in this runtime.
    fn tools(&self) -> &[Box<dyn Tool>];

    /// Executes the tool named `action` with JSON `args`.
    async fn execute(&self, action: &str, args: Value) -> Result<String, ToolError>;
}

pub mod local;
pub use local::LocalRuntime;
