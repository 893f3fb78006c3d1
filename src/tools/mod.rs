//! MCP tool implementations.
//!
//! - `greeting` - `greet`
//! - `arithmetic` - `add`, `subtract`, `multiply`, `divide`
//! - `series` - `sum`, a streaming tool with progress and cancellation

pub mod arithmetic;
pub mod greeting;
pub mod series;

use crate::error::Result;
use crate::mcp::handler::ToolRegistry;

/// Register all tools with the registry.
pub fn register_all_tools(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(greeting::GreetTool)?;

    for operation in arithmetic::Operation::ALL {
        registry.register(arithmetic::ArithmeticTool::new(operation))?;
    }

    registry.register(series::SumSeriesTool)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all_tools() {
        let mut registry = ToolRegistry::new();
        register_all_tools(&mut registry).unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["add", "divide", "greet", "multiply", "subtract", "sum"]
        );

        // A second registration pass collides on the first name.
        assert!(register_all_tools(&mut registry).is_err());
    }
}
