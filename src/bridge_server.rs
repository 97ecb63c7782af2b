use crate::bridge::{BridgeReply, SharedBridge};
use crate::error::Result;
use crate::queue::OperationQueue;
use crate::queue_command::{self, Envelope, QueueCommand};
use crate::router::ToolRegistry;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{extract::State, Json};
use color_eyre::eyre::Error;
use rmcp::{
    handler::server::tool::Parameters,
    model::{
        CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    tool, tool_handler, tool_router, ErrorData, ServerHandler,
};
use serde_json::{Map, Value as JsonValue};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Duration;

pub const PLUGIN_CHANNEL_PORT: u16 = 6400;
const LONG_POLL_DURATION: Duration = Duration::from_secs(15);

/// Tool names the editor services through the plugin channel. Registered once
/// at startup; the queue and the direct MCP methods both resolve against this
/// set.
pub const HOST_TOOLS: [&str; 8] = [
    "manage_script",
    "manage_asset",
    "manage_scene",
    "manage_gameobject",
    "manage_shader",
    "manage_editor",
    "read_console",
    "execute_menu_item",
];

#[derive(Clone)]
pub struct EditorMcpServer {
    queue: Arc<OperationQueue>,
    registry: Arc<ToolRegistry>,
    tool_router: rmcp::handler::server::tool::ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for EditorMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Drive the connected editor with the manage_* tools, or use manage_queue \
                 to stage several operations and execute them as one batch"
                    .to_string(),
            ),
        }
    }
}

#[tool_router]
impl EditorMcpServer {
    pub fn new(queue: Arc<OperationQueue>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            queue,
            registry,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Manages the operation queue: add stages a tool invocation, execute runs every pending operation as one batch, list/stats inspect the queue, clear/remove discard operations"
    )]
    async fn manage_queue(
        &self,
        Parameters(command): Parameters<QueueCommand>,
    ) -> Result<CallToolResult, ErrorData> {
        let envelope = queue_command::handle(&self.queue, command).await;
        Ok(envelope_to_call_result(envelope))
    }

    #[tool(description = "Creates, reads, updates, and deletes scripts in the host project")]
    async fn manage_script(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("manage_script", params).await
    }

    #[tool(description = "Imports, moves, and deletes assets in the host project")]
    async fn manage_asset(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("manage_asset", params).await
    }

    #[tool(description = "Loads, saves, and edits scenes in the open editor session")]
    async fn manage_scene(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("manage_scene", params).await
    }

    #[tool(description = "Creates, modifies, and deletes objects in the open scene")]
    async fn manage_gameobject(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("manage_gameobject", params).await
    }

    #[tool(description = "Creates, reads, updates, and deletes shaders in the host project")]
    async fn manage_shader(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("manage_shader", params).await
    }

    #[tool(description = "Controls editor state such as play mode, pause, and selection")]
    async fn manage_editor(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("manage_editor", params).await
    }

    #[tool(description = "Reads captured editor console log entries")]
    async fn read_console(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("read_console", params).await
    }

    #[tool(description = "Executes an editor menu item by its menu path")]
    async fn execute_menu_item(
        &self,
        Parameters(params): Parameters<Map<String, JsonValue>>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch_now("execute_menu_item", params).await
    }

    /// Immediate (non-queued) execution path: resolve the tool and run it now.
    async fn dispatch_now(
        &self,
        tool: &str,
        params: Map<String, JsonValue>,
    ) -> Result<CallToolResult, ErrorData> {
        let handler = match self.registry.resolve(tool) {
            Ok(handler) => handler,
            Err(err) => return Ok(CallToolResult::error(vec![Content::text(err.to_string())])),
        };
        tracing::debug!(%tool, "running tool directly");
        match handler.execute(JsonValue::Object(params)).await {
            Ok(result) => Ok(CallToolResult::success(vec![Content::text(
                result.to_string(),
            )])),
            Err(err) => Ok(CallToolResult::error(vec![Content::text(err.to_string())])),
        }
    }
}

/// Renders a facade envelope as MCP content. The envelope is always
/// well-formed JSON; error envelopes are flagged at the MCP level too.
fn envelope_to_call_result(envelope: Envelope) -> CallToolResult {
    let is_success = envelope.is_success();
    match serde_json::to_string(&envelope) {
        Ok(rendered) if is_success => CallToolResult::success(vec![Content::text(rendered)]),
        Ok(rendered) => CallToolResult::error(vec![Content::text(rendered)]),
        Err(err) => {
            let fallback = Envelope::internal_error(format!("Unable to render response: {err}"));
            let rendered = serde_json::to_string(&fallback).unwrap_or_else(|_| {
                r#"{"status":"error","message":"Unable to render response","error_code":"INTERNAL_ERROR"}"#
                    .to_string()
            });
            CallToolResult::error(vec![Content::text(rendered)])
        }
    }
}

/// HTTP surface the editor plugin polls. `GET /request` long-polls for the
/// next queued invocation, `POST /response` delivers an outcome back.
pub fn plugin_router(bridge: SharedBridge) -> axum::Router {
    axum::Router::new()
        .route("/request", get(request_handler))
        .route("/response", post(response_handler))
        .with_state(bridge)
}

pub async fn request_handler(State(bridge): State<SharedBridge>) -> Result<impl IntoResponse> {
    let timeout = tokio::time::timeout(LONG_POLL_DURATION, async {
        loop {
            let mut waiter = {
                let mut state = bridge.lock().await;
                if let Some(command) = state.pop_next() {
                    return Ok::<_, Error>(command);
                }
                state.waiter()
            };
            waiter.changed().await?
        }
    })
    .await;
    match timeout {
        Ok(command) => Ok(Json(command?).into_response()),
        _ => Ok((StatusCode::LOCKED, String::new()).into_response()),
    }
}

pub async fn response_handler(
    State(bridge): State<SharedBridge>,
    Json(reply): Json<BridgeReply>,
) -> Result<impl IntoResponse> {
    tracing::debug!(id = %reply.id, "received reply from editor");
    bridge.lock().await.complete(reply)?;
    Ok(StatusCode::NO_CONTENT)
}
