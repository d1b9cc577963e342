//! MCP stdio server exposing the daemon as tools. Every tool call goes through
//! [`DaemonClient`], so the MCP process itself never owns a browser.

mod envelope;

use crate::client::{ClientError, DaemonClient};
use crate::config::ClientConfig;
use envelope::{add_envelope_fields, error_obj, ErrorCode};
use rmcp::{
    handler::server::router::tool::ToolRouter as RmcpToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

pub(crate) const SCHEMA_VERSION: u64 = 1;

fn tool_result(payload: serde_json::Value) -> CallToolResult {
    // Structured content for machine consumers, plus a text copy for clients that only
    // read `content[0].text`.
    let mut r = CallToolResult::structured(payload.clone());
    r.content = vec![Content::text(payload.to_string())];
    r
}

fn failure_payload(err: &ClientError) -> serde_json::Value {
    let code = ErrorCode::from_failure(err.code());
    let hint = err
        .hint()
        .unwrap_or_else(|| "Run `warmsearch --status` to inspect the daemon.".to_string());
    let mut payload = serde_json::json!({
        "ok": false,
        "error": error_obj(code, err, hint),
        "daemon_code": err.code(),
    });
    if let ClientError::Server {
        retry_after_ms: Some(ms),
        ..
    } = err
    {
        payload["retry_after_ms"] = serde_json::json!(ms);
    }
    payload
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct WebSearchArgs {
    /// Search query (required).
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct SearchStatusArgs {}

#[derive(Clone)]
pub struct WarmsearchMcp {
    tool_router: RmcpToolRouter<Self>,
    client: Arc<DaemonClient>,
}

#[tool_router]
impl WarmsearchMcp {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            client: Arc::new(DaemonClient::new(config)),
        }
    }

    #[tool(
        description = "Search the web through a warm, persistent browser. Returns results as a markdown list; repeated queries are served from cache."
    )]
    async fn web_search(
        &self,
        params: Parameters<Option<WebSearchArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let kind = "web_search";
        let t0 = std::time::Instant::now();
        let args = params.0.unwrap_or_default();
        let query = args.query.unwrap_or_default().trim().to_string();
        if query.is_empty() {
            let mut payload = serde_json::json!({
                "ok": false,
                "query": query,
                "error": error_obj(
                    ErrorCode::InvalidParams,
                    "query must be non-empty",
                    "Pass a non-empty query string.",
                ),
            });
            add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
            return Ok(tool_result(payload));
        }

        let mut payload = match self.client.search(&query).await {
            Ok(found) => serde_json::json!({
                "ok": true,
                "query": query,
                "markdown": found.markdown,
                "from_cache": found.from_cache,
                "time_ms": found.time_ms,
            }),
            Err(e) => {
                let mut p = failure_payload(&e);
                p["query"] = serde_json::json!(query);
                p
            }
        };
        add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
        Ok(tool_result(payload))
    }

    #[tool(description = "Report whether the search daemon is running, its cache size, and browser state")]
    async fn search_status(
        &self,
        _params: Parameters<Option<SearchStatusArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let kind = "search_status";
        let t0 = std::time::Instant::now();
        let mut payload = match self.client.status().await {
            Ok(status) => serde_json::json!({
                "ok": true,
                "running": true,
                "status": status,
            }),
            Err(ClientError::NotRunning(path)) => serde_json::json!({
                "ok": true,
                "running": false,
                "socket": path.display().to_string(),
            }),
            Err(e) => failure_payload(&e),
        };
        add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
        Ok(tool_result(payload))
    }
}

#[tool_handler]
impl rmcp::ServerHandler for WarmsearchMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Web search through a local browser daemon that stays warm between calls. The daemon starts on first use and exits when idle; outputs are JSON and schema-versioned."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

pub async fn serve_stdio(config: ClientConfig) -> Result<(), McpError> {
    let svc = WarmsearchMcp::new(config);
    let running = svc
        .serve(stdio())
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    running
        .waiting()
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(())
}
