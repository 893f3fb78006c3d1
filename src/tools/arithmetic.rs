//! Arithmetic tools.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::mcp::handler::{parse_args, success_result, ToolContext, ToolHandler};
use crate::mcp::protocol::{Tool, ToolResult};
use crate::mcp::schema::input_schema;

/// Error code reported for a zero divisor.
pub const DIVISION_BY_ZERO: i32 = 1001;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ArithmeticParams {
    /// first number
    pub a: f64,
    /// second number
    pub b: f64,
}

/// Binary operation performed by an [`ArithmeticTool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Divide,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Add => "add two numbers",
            Self::Subtract => "subtract second number from first",
            Self::Multiply => "multiply two numbers",
            Self::Divide => "divide first number by second",
        }
    }

    /// Apply the operation.
    pub fn apply(self, a: f64, b: f64) -> Result<f64> {
        match self {
            Self::Add => Ok(a + b),
            Self::Subtract => Ok(a - b),
            Self::Multiply => Ok(a * b),
            Self::Divide if b == 0.0 => {
                Err(Error::handler(DIVISION_BY_ZERO, "Error: Division by zero"))
            }
            Self::Divide => Ok(a / b),
        }
    }
}

/// One arithmetic operation on two numbers.
pub struct ArithmeticTool {
    operation: Operation,
}

impl ArithmeticTool {
    pub fn new(operation: Operation) -> Self {
        Self { operation }
    }
}

#[async_trait]
impl ToolHandler for ArithmeticTool {
    fn definition(&self) -> Tool {
        Tool {
            name: self.operation.name().to_string(),
            description: self.operation.description().to_string(),
            input_schema: input_schema::<ArithmeticParams>(),
        }
    }

    async fn execute(&self, _ctx: ToolContext, args: Value) -> Result<ToolResult> {
        let params: ArithmeticParams = parse_args(args)?;
        let result = self.operation.apply(params.a, params.b)?;
        Ok(success_result(format!("Result: {:.2}", result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply() {
        assert_eq!(Operation::Add.apply(2.0, 3.0).unwrap(), 5.0);
        assert_eq!(Operation::Subtract.apply(2.0, 3.0).unwrap(), -1.0);
        assert_eq!(Operation::Multiply.apply(2.5, 4.0).unwrap(), 10.0);
        assert_eq!(Operation::Divide.apply(7.0, 2.0).unwrap(), 3.5);
    }

    #[test]
    fn test_divide_by_zero_is_a_handler_error() {
        let err = Operation::Divide.apply(1.0, 0.0).unwrap_err();
        assert_eq!(err.code(), DIVISION_BY_ZERO);
        assert_eq!(err.to_string(), "Error: Division by zero");

        // Negative zero is still zero.
        assert!(Operation::Divide.apply(1.0, -0.0).is_err());
    }

    #[test]
    fn test_definitions() {
        let names: Vec<_> = Operation::ALL
            .iter()
            .map(|op| ArithmeticTool::new(*op).definition().name)
            .collect();
        assert_eq!(names, vec!["add", "subtract", "multiply", "divide"]);

        let def = ArithmeticTool::new(Operation::Subtract).definition();
        assert_eq!(def.description, "subtract second number from first");
        assert_eq!(def.input_schema["properties"]["b"]["description"], "second number");
    }
}
