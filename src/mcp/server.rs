//! The central Model Context Protocol engine
//!
//! Provides the MCP JSON-RPC decoding, the `initialize` handshake and protocol version
//! negotiation, and method routing for exchanges on an established session.

use chrono::{SecondsFormat, Utc};
use rust_mcp_sdk::schema::{
    CallToolRequest, Implementation, InitializeRequest, InitializeResult, JsonrpcMessage,
    JsonrpcRequest, ListToolsRequest, ListToolsResult, PingRequest, ServerCapabilities,
    ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tracing::info;

use crate::domain::{registry::ProcedureRegistry, tools::handle_tools_call};
use crate::errors::AppError;
use crate::mcp::rpc::{
    app_error_to_json_rpc, is_json_rpc_error, json_rpc_error, json_rpc_result, request_id_to_value,
};
use crate::session::Session;

pub const INITIALIZE_METHOD: &str = "initialize";
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

/// Outcome of a successful `initialize` request, before any session exists.
#[derive(Debug)]
pub struct Handshake {
    pub protocol_version: String,
    pub client_name: Option<String>,
    pub reply: Value,
}

/// Runs the `initialize` handshake. On failure the JSON-RPC error reply is returned instead.
pub fn handle_initialize(payload: Value) -> Result<Handshake, Value> {
    let request_id = payload.get("id").cloned();
    let request = match serde_json::from_value::<JsonrpcMessage>(payload) {
        Ok(JsonrpcMessage::Request(request)) if request.method == INITIALIZE_METHOD => request,
        _ => return Err(json_rpc_error(request_id, -32600, "Invalid Request")),
    };
    validate_request_shape(&request)?;

    let id = Some(request_id_to_value(request.id));
    let params = request.params.map(Value::Object);
    let protocol_version = negotiate_protocol_version(params.as_ref())
        .map_err(|err| app_error_to_json_rpc(id.clone(), err))?;
    let client_name = params
        .as_ref()
        .and_then(|params| params.get("clientInfo"))
        .and_then(|client| client.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let initialize_result = InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            resources: None,
            prompts: None,
            ..Default::default()
        },
        protocol_version: protocol_version.clone(),
        instructions: None,
        meta: None,
    };

    let mut result =
        serde_json::to_value(initialize_result).expect("initialize result serialization");
    // audit events are pushed as logging notifications
    result["capabilities"]["logging"] = json!({});

    info!(
        method = INITIALIZE_METHOD,
        protocol_version = %protocol_version,
        client = client_name.as_deref().unwrap_or("unknown"),
        outcome = "success",
        "mcp action audited"
    );

    Ok(Handshake {
        protocol_version,
        client_name,
        reply: json_rpc_result(id, result),
    })
}

/// Handles a single JSON-RPC message or a batch on an established session.
pub async fn handle_json_rpc_payload(
    registry: &ProcedureRegistry,
    session: &Session,
    payload: Value,
) -> Option<Value> {
    let batch = match payload {
        Value::Array(batch) => batch,
        single => return handle_json_rpc_value(registry, session, single).await,
    };

    if batch.is_empty() {
        return Some(Value::Array(vec![json_rpc_error(
            None,
            -32600,
            "Invalid Request",
        )]));
    }

    let mut responses = Vec::new();
    for item in batch {
        if let Some(response) = handle_json_rpc_value(registry, session, item).await {
            responses.push(response);
        }
    }

    if responses.is_empty() {
        None
    } else {
        Some(Value::Array(responses))
    }
}

pub async fn handle_json_rpc_value(
    registry: &ProcedureRegistry,
    session: &Session,
    payload: Value,
) -> Option<Value> {
    if !payload.is_object() {
        return Some(json_rpc_error(None, -32600, "Invalid Request"));
    }

    let request_id = payload.get("id").cloned();
    let parsed: JsonrpcMessage = match serde_json::from_value(payload) {
        Ok(message) => message,
        Err(_) => return Some(json_rpc_error(request_id, -32600, "Invalid Request")),
    };

    match parsed {
        JsonrpcMessage::Request(request) => {
            if let Err(error_response) = validate_request_shape(&request) {
                return Some(error_response);
            }

            let request_id = request_id_to_value(request.id);
            if request.method.trim().is_empty() {
                return Some(json_rpc_error(Some(request_id), -32600, "Invalid Request"));
            }

            Some(
                handle_json_rpc_request(
                    registry,
                    session,
                    Some(request_id),
                    request.method,
                    request.params.map(Value::Object),
                )
                .await,
            )
        }
        JsonrpcMessage::Notification(notification) => {
            if notification.method.trim().is_empty() {
                return None;
            }

            let _ = handle_json_rpc_request(
                registry,
                session,
                None,
                notification.method,
                notification.params.map(Value::Object),
            )
            .await;
            None
        }
        // responses to server-initiated requests are accepted and dropped
        JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => None,
    }
}

pub fn validate_request_shape(request: &JsonrpcRequest) -> Result<(), Value> {
    let payload = serde_json::to_value(request).expect("jsonrpc request serialization");
    let request_id = Some(request_id_to_value(request.id.clone()));

    let valid = match request.method.as_str() {
        "tools/call" => serde_json::from_value::<CallToolRequest>(payload).is_ok(),
        "tools/list" => serde_json::from_value::<ListToolsRequest>(payload).is_ok(),
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        INITIALIZE_METHOD => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(json_rpc_error(request_id, -32602, "Invalid params"))
    }
}

pub async fn handle_json_rpc_request(
    registry: &ProcedureRegistry,
    session: &Session,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
) -> Value {
    let audit_params = redact_audit_params(params.as_ref());
    let is_request = id.is_some();

    let response = match method.as_str() {
        INITIALIZE_METHOD => json_rpc_error(id, -32600, "Session already initialized"),
        "ping" => json_rpc_result(id, json!({})),
        "tools/list" => json_rpc_result(
            id,
            serde_json::to_value(ListToolsResult {
                meta: None,
                next_cursor: None,
                tools: registry.definitions(),
            })
            .expect("tools list result serialization"),
        ),
        "tools/call" => handle_tools_call(registry, id, params).await,
        "notifications/initialized" | "notifications/cancelled" => Value::Null,
        _ => json_rpc_error(id, -32601, "Method not found"),
    };

    let outcome = if is_json_rpc_error(&response) {
        "failure"
    } else {
        "success"
    };

    info!(
        session_id = %session.id(),
        method = %method,
        params = %audit_params,
        outcome,
        "mcp action audited"
    );

    if is_request {
        let level = if outcome == "success" { "info" } else { "warning" };
        session.transport().notify(
            "notifications/message",
            json!({
                "level": level,
                "logger": "audit",
                "data": {
                    "method": method,
                    "params": audit_params,
                    "outcome": outcome,
                    "generated_at_utc": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                },
            }),
        );
    }

    response
}

/// Picks the protocol version for a new session.
///
/// A supported requested version is echoed back; any other version is answered with the
/// latest supported one, leaving the client to decide whether to continue.
pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<String, AppError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_protocol_version",
                "initialize params.protocolVersion is required",
            )
        })?;

    if SUPPORTED_PROTOCOL_VERSIONS.contains(&offered_version) {
        Ok(offered_version.to_string())
    } else {
        Ok(LATEST_PROTOCOL_VERSION.to_string())
    }
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn initialize_payload(protocol_version: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": "init-1",
            "method": "initialize",
            "params": {
                "protocolVersion": protocol_version,
                "clientInfo": { "name": "inspector", "version": "0.9.0" },
                "capabilities": {}
            }
        })
    }

    #[test]
    fn redacts_sensitive_fields_in_audit_params() {
        let params = json!({
            "name": "greetUser",
            "arguments": {
                "name": "Ada",
                "session_token": "should-not-appear",
                "api_key": "should-not-appear",
                "nested": {
                    "secret": "should-not-appear"
                }
            }
        });

        let redacted = redact_audit_params(Some(&params));

        assert_eq!(redacted["name"], json!("greetUser"));
        assert_eq!(redacted["arguments"]["name"], json!("Ada"));
        assert_eq!(redacted["arguments"]["session_token"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["api_key"], json!("[REDACTED]"));
        assert_eq!(
            redacted["arguments"]["nested"]["secret"],
            json!("[REDACTED]")
        );
    }

    #[test]
    fn negotiate_protocol_version_echoes_supported_version() {
        let params = json!({ "protocolVersion": "2024-11-05" });

        let version = negotiate_protocol_version(Some(&params)).expect("supported version");
        assert_eq!(version, "2024-11-05");
    }

    #[test]
    fn negotiate_protocol_version_falls_back_to_latest() {
        let params = json!({ "protocolVersion": "2023-01-01" });

        let version = negotiate_protocol_version(Some(&params)).expect("fallback version");
        assert_eq!(version, LATEST_PROTOCOL_VERSION);
    }

    #[test]
    fn negotiate_protocol_version_requires_version() {
        let error = negotiate_protocol_version(Some(&json!({}))).expect_err("missing version");
        assert!(error.to_string().contains("bad request"));
    }

    #[test]
    fn initialize_handshake_reports_capabilities() {
        let handshake = handle_initialize(initialize_payload("2025-03-26")).expect("handshake");

        assert_eq!(handshake.protocol_version, "2025-03-26");
        assert_eq!(handshake.client_name.as_deref(), Some("inspector"));
        assert_eq!(handshake.reply["id"], "init-1");
        assert_eq!(handshake.reply["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(
            handshake.reply["result"]["serverInfo"]["name"],
            env!("CARGO_PKG_NAME")
        );
        assert!(handshake.reply["result"]["capabilities"]["tools"].is_object());
        assert!(handshake.reply["result"]["capabilities"]["logging"].is_object());
    }

    #[test]
    fn initialize_notification_is_not_a_handshake() {
        let error = handle_initialize(json!({ "jsonrpc": "2.0", "method": "initialize" }))
            .expect_err("notification");
        assert_eq!(error["error"]["code"], -32600);
    }
}
