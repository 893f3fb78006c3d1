//! Streaming sum over a series of numbers.
//!
//! Each element is a unit of work: the tool reports progress after every
//! element and stops at the first cancellation checkpoint it reaches.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mcp::handler::{parse_args, success_result, ToolContext, ToolHandler};
use crate::mcp::protocol::{Tool, ToolResult};
use crate::mcp::schema::input_schema;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SeriesParams {
    /// numbers to add up
    pub numbers: Vec<f64>,
    /// pause before each number, in milliseconds
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// Sums a series, streaming progress as it goes.
pub struct SumSeriesTool;

#[async_trait]
impl ToolHandler for SumSeriesTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "sum".to_string(),
            description: "add up a series of numbers, reporting progress after each one".to_string(),
            input_schema: input_schema::<SeriesParams>(),
        }
    }

    async fn execute(&self, ctx: ToolContext, args: Value) -> Result<ToolResult> {
        let params: SeriesParams = parse_args(args)?;
        let delay = params.delay_ms.map(Duration::from_millis);
        let progress = ctx
            .progress()
            .clone()
            .with_total(Some(params.numbers.len() as u64));

        let mut total = 0.0;
        for (i, n) in params.numbers.iter().enumerate() {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ctx.checkpoint()?;
            total += n;
            progress
                .report(i as u64 + 1, Some(&format!("Running total: {:.2}", total)))
                .await?;
        }

        Ok(success_result(format!("Result: {:.2}", total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition() {
        let def = SumSeriesTool.definition();
        assert_eq!(def.name, "sum");
        assert_eq!(def.input_schema["properties"]["numbers"]["type"], "array");
        assert_eq!(def.input_schema["required"], serde_json::json!(["numbers"]));
    }
}
