//! JSON-RPC bridge into the router.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};
use wshrpc_core::{RpcClient, RpcError, RpcOpts};

/// JSON-RPC 2.0 request structure.
///
/// `method` names the command, `params` is its payload, `opts` optionally
/// addresses another route or sets a timeout.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub opts: RpcOpts,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, err: &RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code: err.to_rpc_error_code(),
                message: err.to_string(),
                data: Some(json!({"kind": err.kind()})),
            }),
            id,
        }
    }
}

/// Executes bridged calls.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync {
    async fn dispatch(&self, method: &str, params: Value, opts: RpcOpts) -> wshrpc_core::Result<Value>;
}

#[async_trait::async_trait]
impl RpcDispatch for RpcClient {
    async fn dispatch(&self, method: &str, params: Value, opts: RpcOpts) -> wshrpc_core::Result<Value> {
        self.call_value(method, params, opts).await
    }
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "route": state.router.route(),
        "connections": state.router.connection_count(),
        "routes": state.router.routes().len(),
    }))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let JsonRpcRequest {
        method,
        params,
        opts,
        id,
        ..
    } = request;
    let params = params.unwrap_or(Value::Object(Default::default()));

    debug!("RPC call: {}({:?})", method, params);

    if method == "health_check" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(id, json!({"status": "ok"}))),
        );
    }

    match state.gateway.dispatch(&method, params, opts).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            (StatusCode::OK, Json(JsonRpcResponse::error(id, &e)))
        }
    }
}
