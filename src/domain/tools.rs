//! Tools exposed via Model Context Protocol
//!
//! Provides the built-in `greetUser` and `addNumbers` procedures and the `tools/call`
//! adapter that maps procedure registry outcomes onto JSON-RPC responses.

use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::registry::{HandlerResult, InvokeError, ProcedureRegistry, RegistryError};
use crate::mcp::rpc::{json_rpc_error, json_rpc_error_with_data, json_rpc_result};

#[macros::mcp_tool(name = "greetUser", description = "Greet a user by name")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GreetUserTool {
    pub name: String,
}

#[macros::mcp_tool(name = "addNumbers", description = "Add two numbers together")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct AddNumbersTool {
    pub a: f64,
    pub b: f64,
}

/// Registry holding every built-in procedure, in the order they are listed to clients.
pub fn build_registry() -> Result<ProcedureRegistry, RegistryError> {
    let mut registry = ProcedureRegistry::new();
    registry.register(GreetUserTool::tool(), greet_user)?;
    registry.register(AddNumbersTool::tool(), add_numbers)?;
    Ok(registry)
}

pub async fn greet_user(input: GreetUserTool) -> HandlerResult {
    Ok(text_result(format!("Hello, {}!", input.name), None))
}

pub async fn add_numbers(input: AddNumbersTool) -> HandlerResult {
    let sum = input.a + input.b;
    Ok(text_result(
        format!("Sum is {sum}"),
        Some(serde_json::Map::from_iter([("sum".to_string(), json!(sum))])),
    ))
}

fn text_result(
    text: String,
    structured_content: Option<serde_json::Map<String, Value>>,
) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: None,
        meta: None,
        structured_content,
    }
}

pub async fn handle_tools_call(
    registry: &ProcedureRegistry,
    id: Option<Value>,
    params: Option<Value>,
) -> Value {
    let Some(raw_params) = params else {
        return json_rpc_error(id, -32602, "Invalid params");
    };

    let tool_call: CallToolRequestParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => return json_rpc_error(id, -32602, "Invalid params"),
    };

    let arguments = Value::Object(tool_call.arguments.unwrap_or_default());
    match registry.invoke(&tool_call.name, arguments).await {
        Ok(result) => json_rpc_result(
            id,
            serde_json::to_value(result).expect("tool result serialization"),
        ),
        Err(InvokeError::UnknownProcedure(name)) => json_rpc_error_with_data(
            id,
            -32601,
            "Method not found",
            Some(json!({
                "code": "tool_not_found",
                "message": "unknown tool name",
                "details": {
                    "name": name,
                },
            })),
        ),
        Err(InvokeError::Validation(err)) => json_rpc_error_with_data(
            id,
            -32602,
            "Invalid params",
            Some(json!({
                "code": "validation_error",
                "message": err.detail,
                "details": {
                    "name": tool_call.name,
                },
            })),
        ),
        Err(InvokeError::Handler(err)) => {
            tracing::warn!(tool = %tool_call.name, error = %err, "tool handler failed");
            json_rpc_result(
                id,
                serde_json::to_value(CallToolResult {
                    content: vec![ContentBlock::from(TextContent::new(
                        err.message,
                        None,
                        None,
                    ))],
                    is_error: Some(true),
                    meta: None,
                    structured_content: None,
                })
                .expect("tool error result serialization"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn add_numbers_reports_sum() {
        let result = add_numbers(AddNumbersTool { a: 2.0, b: 3.0 })
            .await
            .expect("sum");
        let value = serde_json::to_value(result).expect("serialize");

        assert_eq!(value["content"][0]["text"], "Sum is 5");
        assert_eq!(value["structuredContent"]["sum"], json!(5.0));
    }

    #[tokio::test]
    async fn greet_user_formats_greeting() {
        let result = greet_user(GreetUserTool {
            name: "Ada".to_string(),
        })
        .await
        .expect("greeting");
        let value = serde_json::to_value(result).expect("serialize");

        assert_eq!(value["content"][0]["text"], "Hello, Ada!");
    }

    #[test]
    fn registry_lists_builtin_tools_with_schemas() {
        let registry = build_registry().expect("registry builds");
        let tools = serde_json::to_value(registry.definitions()).expect("serialize tools");

        assert_eq!(tools[0]["name"], "greetUser");
        assert_eq!(tools[1]["name"], "addNumbers");
        assert_eq!(tools[1]["inputSchema"]["properties"]["a"]["type"], "number");
        assert!(tools[1]["inputSchema"]["required"]
            .as_array()
            .expect("required list")
            .contains(&json!("b")));
    }

    #[tokio::test]
    async fn tools_call_with_invalid_arguments_is_invalid_params() {
        let registry = build_registry().expect("registry builds");

        let response = handle_tools_call(
            &registry,
            Some(json!(7)),
            Some(json!({ "name": "addNumbers", "arguments": { "a": "x", "b": 3 } })),
        )
        .await;

        assert_eq!(response["error"]["code"], -32602);
        assert_eq!(response["error"]["data"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn tools_call_unknown_tool_returns_tool_not_found_data() {
        let registry = build_registry().expect("registry builds");

        let response = handle_tools_call(
            &registry,
            Some(json!(8)),
            Some(json!({ "name": "does_not_exist", "arguments": {} })),
        )
        .await;

        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["error"]["data"]["code"], "tool_not_found");
        assert_eq!(response["error"]["data"]["details"]["name"], "does_not_exist");
    }

    #[tokio::test]
    async fn tools_call_handler_failure_is_error_result() {
        let mut registry = ProcedureRegistry::new();
        registry
            .register(GreetUserTool::tool(), |_input: GreetUserTool| async {
                Err::<CallToolResult, _>(crate::domain::registry::HandlerError::new(
                    "greeting service unavailable",
                ))
            })
            .expect("register");

        let response = handle_tools_call(
            &registry,
            Some(json!(9)),
            Some(json!({ "name": "greetUser", "arguments": { "name": "Ada" } })),
        )
        .await;

        assert_eq!(response["result"]["isError"], true);
        assert_eq!(
            response["result"]["content"][0]["text"],
            "greeting service unavailable"
        );
    }
}
