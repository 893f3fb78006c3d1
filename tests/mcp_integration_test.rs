//! MCP Server Integration Tests
//!
//! These tests spawn the server binary and talk JSON-RPC to it over stdio.

#![allow(deprecated)] // Allow deprecated cargo_bin for now

use assert_cmd::cargo::CommandCargoExt;
use assert_cmd::Command as AssertCommand;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// MCP Test Client that communicates with the server via stdio
struct McpTestClient {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    request_id: i64,
}

impl McpTestClient {
    /// Spawn a new MCP server and connect to it
    fn spawn() -> Result<Self, Box<dyn std::error::Error>> {
        let mut child = Command::cargo_bin("streamable-mcp")?
            .arg("--transport")
            .arg("stdio")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().expect("Failed to get stdin");
        let stdout = BufReader::new(child.stdout.take().expect("Failed to get stdout"));

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout,
            request_id: 0,
        })
    }

    fn send_line(&mut self, line: &str) -> Result<(), Box<dyn std::error::Error>> {
        let stdin = self.stdin.as_mut().expect("stdin already closed");
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        let mut line = String::new();
        self.stdout.read_line(&mut line)?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Send a JSON-RPC request and get the response
    fn request(&mut self, method: &str, params: Value) -> Result<Value, Box<dyn std::error::Error>> {
        self.request_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.request_id,
            "method": method,
            "params": params
        });
        self.send_line(&serde_json::to_string(&request)?)?;
        self.read_message()
    }

    fn initialize(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }),
        )
    }

    fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, Box<dyn std::error::Error>> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
    }

    /// Close stdin and collect whatever the server writes before exiting.
    fn finish(mut self) -> Result<String, Box<dyn std::error::Error>> {
        drop(self.stdin.take());
        let mut rest = String::new();
        self.stdout.read_to_string(&mut rest)?;
        let status = self.child.wait()?;
        assert!(status.success(), "server exited with {status}");
        Ok(rest)
    }
}

impl Drop for McpTestClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

fn text_of(response: &Value) -> &str {
    response["result"]["content"][0]["text"]
        .as_str()
        .expect("Expected text content")
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_binary_help() {
    AssertCommand::cargo_bin("streamable-mcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MCP tool server"))
        .stdout(predicate::str::contains("--transport"));
}

#[test]
fn test_binary_version() {
    AssertCommand::cargo_bin("streamable-mcp")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("streamable-mcp"));
}

#[test]
fn test_invalid_transport_is_rejected() {
    AssertCommand::cargo_bin("streamable-mcp")
        .unwrap()
        .args(["--transport", "carrier-pigeon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_mcp_initialize() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");

    let response = client.initialize().expect("Failed to initialize");
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2025-03-26");
    assert_eq!(result["serverInfo"]["name"], "calculator");
    assert!(result["capabilities"]["tools"].is_object());
}

#[test]
fn test_mcp_list_tools() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client.request("tools/list", json!({})).unwrap();
    let tools = response["result"]["tools"]
        .as_array()
        .expect("tools should be array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, vec!["add", "divide", "greet", "multiply", "subtract", "sum"]);

    for tool in tools {
        assert!(tool["description"].is_string());
        assert_eq!(tool["inputSchema"]["type"], "object");
    }
}

#[test]
fn test_mcp_call_tools() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client.call_tool("add", json!({"a": 2, "b": 3})).unwrap();
    assert_eq!(text_of(&response), "Result: 5.00");

    let response = client
        .call_tool("greet", json!({"name": "Ada"}))
        .unwrap();
    assert_eq!(text_of(&response), "Hi Ada");

    // Direct method invocation.
    let response = client.request("multiply", json!({"a": 1.5, "b": 4})).unwrap();
    assert_eq!(text_of(&response), "Result: 6.00");
}

#[test]
fn test_mcp_tool_errors() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client.call_tool("divide", json!({"a": 1, "b": 0})).unwrap();
    assert_eq!(response["error"]["code"], 1001);
    assert_eq!(response["error"]["message"], "Error: Division by zero");

    let response = client.call_tool("nonexistent_tool", json!({})).unwrap();
    assert_eq!(response["error"]["code"], -32002);

    let response = client.call_tool("add", json!({"a": "two", "b": 3})).unwrap();
    assert_eq!(response["error"]["code"], -32602);
}

#[test]
fn test_malformed_line_does_not_end_session() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");

    client.send_line("{not json").unwrap();
    let response = client.read_message().unwrap();
    assert_eq!(response["id"], Value::Null);
    assert_eq!(response["error"]["code"], -32700);

    let response = client.request("ping", json!({})).unwrap();
    assert_eq!(response["result"], json!({}));
}

#[test]
fn test_eof_shuts_down_cleanly() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let rest = client.finish().unwrap();
    assert!(rest.is_empty(), "unexpected output after EOF: {rest}");
}
