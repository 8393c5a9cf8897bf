//! The bridge between HTTP callers and the worker process.
//!
//! Composes the correlation router, frame codec, and process supervisor
//! behind the `ToolBridge` contract the HTTP layer consumes. One bridge owns
//! exactly one supervised worker; callers multiplex onto it through
//! correlation ids.

pub mod codec;
pub mod router;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::bridge::router::CorrelationRouter;
use crate::bridge::supervisor::{RestartPolicy, Supervisor, WorkerState};
use crate::config::Config;
use crate::errors::BridgeError;

/// Tool metadata as reported by the worker. The input schema is opaque to
/// the bridge; interpreting it is the worker's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// The contract consumed by the HTTP layer. Kept as a trait so router tests
/// run against a scripted mock instead of a live worker.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError>;
    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, BridgeError>;
    fn health(&self) -> WorkerState;
    fn generation(&self) -> u64;
    async fn restart(&self) -> Result<(), BridgeError>;
    async fn stop(&self, graceful: bool);
}

struct CatalogCache {
    generation: u64,
    tools: Vec<ToolDescriptor>,
}

/// Bridge implementation backed by one supervised worker process.
pub struct WorkerBridge {
    router: Arc<CorrelationRouter>,
    supervisor: Arc<Supervisor>,
    invoke_timeout: Duration,
    catalog: Mutex<Option<CatalogCache>>,
}

impl std::fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("state", &self.supervisor.state())
            .field("generation", &self.supervisor.generation())
            .finish_non_exhaustive()
    }
}

impl WorkerBridge {
    /// Spawn the worker and return the running bridge.
    pub async fn start(config: &Config) -> Result<Arc<Self>, BridgeError> {
        let router = Arc::new(CorrelationRouter::new(config.max_in_flight));
        let supervisor = Supervisor::new(
            config.worker_command.clone(),
            config.worker_args.clone(),
            RestartPolicy {
                max_restarts: config.max_restarts,
                window: config.restart_window,
            },
            config.shutdown_grace,
            router.clone(),
        );
        supervisor.start().await?;
        Ok(Arc::new(Self {
            router,
            supervisor,
            invoke_timeout: config.invoke_timeout,
            catalog: Mutex::new(None),
        }))
    }

    /// One correlated round trip: register, encode, write, suspend until the
    /// matching reply, the timeout, or worker failure — whichever is first.
    async fn send(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let (id, reply_rx) = self.router.register().await?;
        let frame = codec::encode_request(id, method, &params);

        if let Err(err) = self.supervisor.write(frame).await {
            self.router.discard(id).await;
            return Err(err);
        }

        match tokio::time::timeout(self.invoke_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Reply slot dropped without fulfillment: the router is gone.
            Ok(Err(_)) => Err(BridgeError::WorkerUnavailable),
            Err(_) => {
                // The worker may still answer later; the reply will then be
                // discarded as unmatched.
                self.router.discard(id).await;
                Err(BridgeError::Timeout)
            }
        }
    }
}

#[async_trait]
impl ToolBridge for WorkerBridge {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let generation = self.supervisor.generation();
        if let Some(cache) = self.catalog.lock().await.as_ref() {
            if cache.generation == generation {
                return Ok(cache.tools.clone());
            }
        }

        let payload = self.send("tools/list", json!({})).await?;
        let tools = parse_tool_catalog(&payload)?;
        *self.catalog.lock().await = Some(CatalogCache {
            generation,
            tools: tools.clone(),
        });
        Ok(tools)
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, BridgeError> {
        let tool = tool.trim();
        if tool.is_empty() {
            return Err(BridgeError::invalid_request("tool name must not be empty"));
        }
        self.send(
            "tools/call",
            json!({"name": tool, "arguments": arguments}),
        )
        .await
    }

    fn health(&self) -> WorkerState {
        self.supervisor.state()
    }

    fn generation(&self) -> u64 {
        self.supervisor.generation()
    }

    async fn restart(&self) -> Result<(), BridgeError> {
        self.supervisor.restart().await
    }

    async fn stop(&self, graceful: bool) {
        self.supervisor.stop(graceful).await;
    }
}

fn parse_tool_catalog(payload: &Value) -> Result<Vec<ToolDescriptor>, BridgeError> {
    // Workers reply either {"tools": [...]} or a bare array.
    let tools = payload.get("tools").unwrap_or(payload);
    serde_json::from_value(tools.clone()).map_err(|err| BridgeError::MalformedFrame {
        reason: format!("unparseable tool catalog: {err}"),
    })
}
