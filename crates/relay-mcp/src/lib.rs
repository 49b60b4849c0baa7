//! MCP (Model Context Protocol) tool surface (C7): `jobs_submit`,
//! `jobs_get`, `jobs_list`, `jobs_cancel` as callable tools, plus
//! `mcp://jobs/{jobId}/status` and `mcp://jobs/{jobId}/artifacts/{kind}` as
//! readable resources (spec.md §4.7). Lets an MCP-aware agent harness drive
//! the scheduler without going through the HTTP Bridge.
//!
//! No crate in this codebase implements MCP — this surface is grounded
//! directly on `rmcp`'s own server API (the `server`/`transport-io`
//! features this workspace already carries); the tool/resource
//! organization mirrors `relay_manager::JobManager`'s own method surface
//! one-to-one rather than inventing a parallel shape.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use relay_core::{JobId, JobSpec, JobState};
use relay_error::{ErrorCode, RelayError};
use relay_manager::JobManager;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorData as McpError, Implementation,
    ListResourcesResult, ListToolsResult, PaginatedRequestParam, ProtocolVersion, RawResource,
    ReadResourceRequestParam, ReadResourceResult, Resource, ResourceContents, ServerCapabilities,
    ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::io::stdio;
use rmcp::{ServerHandler, ServiceExt};
use serde_json::{json, Map, Value};
use tracing::info;

/// MCP server exposing the scheduler's job-control surface.
#[derive(Clone)]
pub struct RelayMcpServer {
    manager: Arc<JobManager>,
}

impl RelayMcpServer {
    /// Wrap an already-wired [`JobManager`]; every tool call and resource
    /// read goes through it exactly as the HTTP Bridge's handlers do.
    #[must_use]
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    /// Serve this handler over stdio until the client disconnects
    /// (spec.md §6's `--transport stdio` default).
    pub async fn serve_stdio(self) -> anyhow::Result<()> {
        info!("mcp server starting on stdio");
        let service = self.serve(stdio()).await?;
        service.waiting().await?;
        Ok(())
    }

    fn tool_defs() -> Vec<Tool> {
        vec![
            tool_def(
                "jobs_submit",
                "Submit a new job, or reuse a non-terminal job already created under the same idempotency key.",
                json!({
                    "type": "object",
                    "properties": { "spec": { "type": "object", "description": "A JobSpec, per spec.md §4.1" } },
                    "required": ["spec"],
                }),
            ),
            tool_def(
                "jobs_get",
                "Fetch the computed status view for one job (state, summary, duration, attempt count, pr artifact).",
                json!({
                    "type": "object",
                    "properties": { "jobId": { "type": "string" } },
                    "required": ["jobId"],
                }),
            ),
            tool_def(
                "jobs_list",
                "Page through jobs, optionally filtered to a single lifecycle state.",
                json!({
                    "type": "object",
                    "properties": {
                        "state": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 1 },
                        "offset": { "type": "integer", "minimum": 0 },
                    },
                }),
            ),
            tool_def(
                "jobs_cancel",
                "Cancel a non-terminal job; a no-op if it is already terminal.",
                json!({
                    "type": "object",
                    "properties": { "jobId": { "type": "string" } },
                    "required": ["jobId"],
                }),
            ),
        ]
    }

    async fn dispatch(&self, name: &str, args: Map<String, Value>) -> Result<CallToolResult, McpError> {
        match name {
            "jobs_submit" => self.jobs_submit(args).await,
            "jobs_get" => self.jobs_get(args).await,
            "jobs_list" => self.jobs_list(args).await,
            "jobs_cancel" => self.jobs_cancel(args).await,
            other => Err(McpError::invalid_params(format!("unknown tool \"{other}\""), None)),
        }
    }

    async fn jobs_submit(&self, mut args: Map<String, Value>) -> Result<CallToolResult, McpError> {
        let spec_value = args
            .remove("spec")
            .ok_or_else(|| McpError::invalid_params("missing \"spec\"", None))?;
        let spec: JobSpec = serde_json::from_value(spec_value)
            .map_err(|e| McpError::invalid_params(format!("invalid job spec: {e}"), None))?;
        let outcome = self.manager.submit(spec).await.map_err(to_mcp_error)?;
        Ok(success_json(json!({
            "jobId": outcome.job_id.as_str(),
            "reused": outcome.reused,
        })))
    }

    async fn jobs_get(&self, args: Map<String, Value>) -> Result<CallToolResult, McpError> {
        let job_id = required_str(&args, "jobId")?;
        let status = self
            .manager
            .get_status(&JobId::new(job_id.clone()))
            .await
            .map_err(to_mcp_error)?
            .ok_or_else(|| McpError::invalid_params(format!("no such job: {job_id}"), None))?;
        Ok(success_json(json!({
            "id": status.id.as_str(),
            "state": status.state,
            "summary": status.summary,
            "lastUpdate": status.last_update,
            "durationMs": status.duration_ms,
            "attempt": status.attempt,
            "pr": status.pr,
        })))
    }

    async fn jobs_list(&self, args: Map<String, Value>) -> Result<CallToolResult, McpError> {
        let state = args
            .get("state")
            .and_then(Value::as_str)
            .map(|s| serde_json::from_value::<JobState>(Value::String(s.to_string())))
            .transpose()
            .map_err(|e| McpError::invalid_params(format!("invalid state filter: {e}"), None))?;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as u32;
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as u32;
        let page = self.manager.list(state, limit, offset).await.map_err(to_mcp_error)?;
        Ok(success_json(json!({
            "items": page.items,
            "total": page.total,
            "hasMore": page.has_more,
        })))
    }

    async fn jobs_cancel(&self, args: Map<String, Value>) -> Result<CallToolResult, McpError> {
        let job_id = required_str(&args, "jobId")?;
        let outcome = self.manager.cancel(&JobId::new(job_id)).await.map_err(to_mcp_error)?;
        Ok(success_json(json!({ "ok": outcome.ok, "state": outcome.state })))
    }

    async fn read_status(&self, job_id: &str) -> Result<ReadResourceResult, McpError> {
        let status = self
            .manager
            .get_status(&JobId::new(job_id.to_string()))
            .await
            .map_err(to_mcp_error)?
            .ok_or_else(|| McpError::invalid_params(format!("no such job: {job_id}"), None))?;
        let text = serde_json::to_string_pretty(&json!({
            "id": status.id.as_str(),
            "state": status.state,
            "summary": status.summary,
            "lastUpdate": status.last_update,
            "durationMs": status.duration_ms,
            "attempt": status.attempt,
            "pr": status.pr,
        }))
        .unwrap_or_else(|_| "{}".to_string());
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: format!("mcp://jobs/{job_id}/status"),
                mime_type: Some("application/json".to_string()),
                text,
            }],
        })
    }

    async fn read_artifact(&self, job_id: &str, kind_str: &str) -> Result<ReadResourceResult, McpError> {
        let kind = parse_artifact_kind(kind_str)
            .ok_or_else(|| McpError::invalid_params(format!("unknown artifact kind: {kind_str}"), None))?;
        let job_id_typed = JobId::new(job_id.to_string());
        let meta = self
            .manager
            .store()
            .get_artifact(&job_id_typed, kind)
            .await
            .map_err(to_mcp_error)?
            .ok_or_else(|| McpError::invalid_params(format!("no {kind_str} artifact for job {job_id}"), None))?;
        let path = meta.uri.strip_prefix("file://").unwrap_or(&meta.uri);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| McpError::internal_error(format!("failed to read artifact: {e}"), None))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: format!("mcp://jobs/{job_id}/artifacts/{kind_str}"),
                mime_type: Some(kind.mime_type().to_string()),
                text,
            }],
        })
    }
}

fn parse_artifact_kind(raw: &str) -> Option<relay_core::ArtifactKind> {
    use relay_core::ArtifactKind::*;
    match raw {
        "patch.diff" => Some(PatchDiff),
        "out.md" => Some(OutMd),
        "logs.txt" => Some(LogsTxt),
        "pr.json" => Some(PrJson),
        _ => None,
    }
}

/// Parse `mcp://jobs/{jobId}/status` or `mcp://jobs/{jobId}/artifacts/{kind}`.
fn parse_job_resource_uri(uri: &str) -> Option<(String, Option<String>)> {
    let rest = uri.strip_prefix("mcp://jobs/")?;
    let mut parts = rest.splitn(3, '/');
    let job_id = parts.next()?.to_string();
    match (parts.next(), parts.next()) {
        (Some("status"), None) => Some((job_id, None)),
        (Some("artifacts"), Some(kind)) => Some((job_id, Some(kind.to_string()))),
        _ => None,
    }
}

fn tool_def(name: &str, description: &str, schema: Value) -> Tool {
    let schema_map = match schema {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Tool {
        name: name.to_string().into(),
        description: Some(description.to_string().into()),
        input_schema: Arc::new(schema_map),
        annotations: None,
    }
}

fn required_str(args: &Map<String, Value>, key: &str) -> Result<String, McpError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| McpError::invalid_params(format!("missing \"{key}\""), None))
}

fn success_json(value: Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(value.to_string())])
}

fn to_mcp_error(err: RelayError) -> McpError {
    match err.code {
        ErrorCode::JobNotFound | ErrorCode::ValidationFailed | ErrorCode::IllegalTransition | ErrorCode::McpInvalidInput => {
            McpError::invalid_params(err.message, None)
        }
        _ => McpError::internal_error(err.message, None),
    }
}

impl ServerHandler for RelayMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "task-relay-scheduler".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Submit, inspect, list, and cancel jobs on the task-relay scheduler; read job status and artifacts as resources.".to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: Self::tool_defs(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.dispatch(request.name.as_ref(), request.arguments.unwrap_or_default()).await
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            resources: vec![
                Resource {
                    raw: RawResource {
                        uri: "mcp://jobs/{jobId}/status".to_string(),
                        name: "job-status".to_string(),
                        description: Some("Computed status view for a job".to_string()),
                        mime_type: Some("application/json".to_string()),
                        size: None,
                    },
                    annotations: None,
                },
                Resource {
                    raw: RawResource {
                        uri: "mcp://jobs/{jobId}/artifacts/{kind}".to_string(),
                        name: "job-artifact".to_string(),
                        description: Some(
                            "One of the job's fixed artifact kinds: patch.diff, out.md, logs.txt, pr.json"
                                .to_string(),
                        ),
                        mime_type: None,
                        size: None,
                    },
                    annotations: None,
                },
            ],
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let (job_id, kind) = parse_job_resource_uri(&request.uri)
            .ok_or_else(|| McpError::invalid_params(format!("unrecognized resource uri: {}", request.uri), None))?;
        match kind {
            None => self.read_status(&job_id).await,
            Some(kind) => self.read_artifact(&job_id, &kind).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_bus::EventBus;
    use relay_storage::memory::MemoryStore;

    fn sample_spec(key: &str) -> Value {
        json!({
            "repo": { "repoType": "git", "url": "https://example.invalid/repo.git", "baseBranch": "main", "baselineCommit": "deadbeef" },
            "task": { "title": "t", "description": "d", "acceptance": [] },
            "scope": { "readPaths": [], "fileGlobs": null, "disallowReformatting": false },
            "context": null,
            "execution": { "preferredModel": "gpt-4", "sandbox": "read-only", "askPolicy": "untrusted", "timeoutS": null, "priority": "P1", "ttlS": 3600 },
            "idempotencyKey": key,
            "notify": null,
        })
    }

    fn server() -> RelayMcpServer {
        let manager = Arc::new(JobManager::new(Arc::new(MemoryStore::new()), Arc::new(EventBus::new())));
        RelayMcpServer::new(manager)
    }

    #[tokio::test]
    async fn jobs_submit_then_get_round_trips() {
        let srv = server();
        let mut args = Map::new();
        args.insert("spec".to_string(), sample_spec("mcp1"));
        let result = srv.jobs_submit(args).await.unwrap();
        assert!(result.is_error != Some(true));

        let text = match &result.content[0] {
            Content::Text(t) => t.text.clone(),
            _ => panic!("expected text content"),
        };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let job_id = parsed["jobId"].as_str().unwrap().to_string();

        let mut get_args = Map::new();
        get_args.insert("jobId".to_string(), Value::String(job_id));
        let status = srv.jobs_get(get_args).await.unwrap();
        assert!(status.is_error != Some(true));
    }

    #[tokio::test]
    async fn jobs_get_unknown_job_is_invalid_params() {
        let srv = server();
        let mut args = Map::new();
        args.insert("jobId".to_string(), Value::String("nope".to_string()));
        let err = srv.jobs_get(args).await.unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn jobs_cancel_queued_job() {
        let srv = server();
        let mut submit_args = Map::new();
        submit_args.insert("spec".to_string(), sample_spec("mcp2"));
        let result = srv.jobs_submit(submit_args).await.unwrap();
        let text = match &result.content[0] {
            Content::Text(t) => t.text.clone(),
            _ => panic!("expected text content"),
        };
        let job_id = serde_json::from_str::<Value>(&text).unwrap()["jobId"]
            .as_str()
            .unwrap()
            .to_string();

        let mut cancel_args = Map::new();
        cancel_args.insert("jobId".to_string(), Value::String(job_id));
        let cancel_result = srv.jobs_cancel(cancel_args).await.unwrap();
        let text = match &cancel_result.content[0] {
            Content::Text(t) => t.text.clone(),
            _ => panic!("expected text content"),
        };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["ok"], true);
    }

    #[test]
    fn parses_status_and_artifact_uris() {
        assert_eq!(
            parse_job_resource_uri("mcp://jobs/job_1/status"),
            Some(("job_1".to_string(), None))
        );
        assert_eq!(
            parse_job_resource_uri("mcp://jobs/job_1/artifacts/patch.diff"),
            Some(("job_1".to_string(), Some("patch.diff".to_string())))
        );
        assert_eq!(parse_job_resource_uri("mcp://jobs/job_1"), None);
    }

    #[test]
    fn tool_defs_cover_all_four_operations() {
        let names: Vec<_> = RelayMcpServer::tool_defs().into_iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["jobs_submit", "jobs_get", "jobs_list", "jobs_cancel"]);
    }
}
