//! Axum handlers for the bridge API
//!
//! Each handler delegates straight to the `ToolBridge`; error kinds map to
//! status codes in `errors.rs`.

use axum::{extract::State, Json};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::supervisor::WorkerState;
use crate::bridge::ToolDescriptor;
use crate::errors::BridgeError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub state: WorkerState,
    pub generation: u64,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub tools_endpoint: &'static str,
    pub invoke_endpoint: &'static str,
    pub health_endpoint: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolDescriptor>,
    pub generated_at_utc: String,
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(serde_json::Map::new())
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        state: state.bridge.health(),
        generation: state.bridge.generation(),
    })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        tools_endpoint: "/tools",
        invoke_endpoint: "/invoke",
        health_endpoint: "/health",
    })
}

pub async fn list_tools(
    State(state): State<AppState>,
) -> Result<Json<ToolsResponse>, BridgeError> {
    let tools = state.bridge.list_tools().await?;
    Ok(Json(ToolsResponse {
        tools,
        generated_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

pub async fn invoke(
    State(state): State<AppState>,
    Json(request): Json<InvokeRequest>,
) -> Result<Json<Value>, BridgeError> {
    let result = state.bridge.invoke(&request.name, request.arguments).await?;
    Ok(Json(result))
}

pub async fn restart(State(state): State<AppState>) -> Result<Json<HealthResponse>, BridgeError> {
    state.bridge.restart().await?;
    Ok(Json(HealthResponse {
        state: state.bridge.health(),
        generation: state.bridge.generation(),
    }))
}
