use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("tool {0} not found")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> String;
    fn description(&self) -> String;
    fn parameters(&self) -> Value; // JSON Schema
    async fn call(&self, args: Value) -> Result<String, ToolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Deserialize)]
struct CalcArgs {
    op: Operation,
    a: f64,
    b: f64,
}

/// Basic arithmetic on two numbers.
pub struct CalcTool;

#[async_trait]
impl Tool for CalcTool {
    fn name(&self) -> String {
        "calc".to_string()
    }

    fn description(&self) -> String {
        "Perform a basic arithmetic operation (add, sub, mul, div) on two numbers".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "op": {
                    "type": "string",
                    "enum": ["add", "sub", "mul", "div"],
                    "description": "The operation to apply"
                },
                "a": { "type": "number", "description": "Left operand" },
                "b": { "type": "number", "description": "Right operand" }
            },
            "required": ["op", "a", "b"]
        })
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let CalcArgs { op, a, b } =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let value = match op {
            Operation::Add => a + b,
            Operation::Sub => a - b,
            Operation::Mul => a * b,
            Operation::Div if b == 0.0 => {
                return Err(ToolError::Failed("division by zero".to_string()));
            }
            Operation::Div => a / b,
        };
        Ok(value.to_string())
    }
}
