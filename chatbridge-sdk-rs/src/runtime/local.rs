use crate::runtime::Runtime;
use crate::tools::{Tool, ToolError};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Runs tools in-process.
pub struct LocalRuntime {
    tools: Vec<Box<dyn Tool>>,
}

impl LocalRuntime {
    pub fn new(tools: Vec<Box<dyn Tool>>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    async fn execute(&self, action: &str, args: Value) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == action)
            .ok_or_else(|| ToolError::NotFound(action.to_string()))?;
        debug!(tool = action, "Executing tool");
        tool.call(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::CalcTool;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_runtime_dispatches_by_name() {
        let runtime = LocalRuntime::new(vec![Box::new(CalcTool)]);
        assert_eq!(runtime.tools().len(), 1);
        let out = runtime
            .execute("calc", json!({ "op": "add", "a": 1, "b": 2 }))
            .await
            .unwrap();
        assert_eq!(out, "3");
    }

    #[tokio::test]
    async fn test_local_runtime_unknown_tool() {
        let runtime = LocalRuntime::new(Vec::new());
        let err = runtime.execute("cmd", json!({})).await.unwrap_err();
        assert_eq!(err, ToolError::NotFound("cmd".to_string()));
    }
}
