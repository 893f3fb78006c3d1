//! Greeting tool.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::mcp::handler::{parse_args, success_result, ToolContext, ToolHandler};
use crate::mcp::protocol::{Tool, ToolResult};
use crate::mcp::schema::input_schema;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HiParams {
    /// the name of the person to greet
    pub name: String,
}

/// Says hi to someone.
pub struct GreetTool;

#[async_trait]
impl ToolHandler for GreetTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "greet".to_string(),
            description: "say hi to someone".to_string(),
            input_schema: input_schema::<HiParams>(),
        }
    }

    async fn execute(&self, _ctx: ToolContext, args: Value) -> Result<ToolResult> {
        let params: HiParams = parse_args(args)?;
        Ok(success_result(format!("Hi {}", params.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition() {
        let def = GreetTool.definition();
        assert_eq!(def.name, "greet");
        assert_eq!(def.input_schema["properties"]["name"]["type"], "string");
        assert_eq!(def.input_schema["required"], serde_json::json!(["name"]));
    }
}
