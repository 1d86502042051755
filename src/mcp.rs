use std::sync::Arc;

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    caller::Caller,
    catalog::Catalog,
    error::{self, Error},
    form::FormId,
    query::{
        SearchFilters,
        SearchHit,
        SearchRequest,
        SortDirection,
        SortOrder,
    },
    workflow::{WorkflowAction, WorkflowStatus},
};

struct FormdexState {
    catalog: Catalog,
    caller: Caller,
}

/// MCP server exposing search, history and workflow transitions, acting as
/// one fixed caller.
#[derive(Clone)]
pub struct FormdexMcpServer {
    state: Arc<FormdexState>,
    tool_router: ToolRouter<Self>,
}

impl FormdexMcpServer {
    pub fn new(catalog: Catalog, caller: Caller) -> Self {
        Self {
            state: Arc::new(FormdexState { catalog, caller }),
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl FormdexMcpServer {
    /// Hybrid keyword and semantic search over the forms the caller can see.
    #[tool(
        name = "formdex_search",
        description = "Search forms by keyword or concept. Supports category, business area, date, status and visibility filters, sorting and paging."
    )]
    pub async fn formdex_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let sort = match params.sort.as_deref() {
            Some(s) => s.parse().map_err(invalid_params)?,
            None => SortOrder::default(),
        };
        let direction = params
            .order
            .as_deref()
            .map(str::parse::<SortDirection>)
            .transpose()
            .map_err(invalid_params)?;
        let status = params
            .status
            .as_deref()
            .map(str::parse::<WorkflowStatus>)
            .transpose()
            .map_err(invalid_params)?;
        let request = SearchRequest {
            text: params.query.clone(),
            filters: SearchFilters {
                category: params.category,
                business_area: params.business_area,
                updated_from: params.updated_from,
                updated_to: params.updated_to,
                status,
                is_public: params.is_public,
            },
            sort,
            direction,
            offset: params.offset.unwrap_or(0),
            limit: params.limit.unwrap_or(0),
            published_only: params.published_only.unwrap_or(false),
        };

        let page = self
            .state
            .catalog
            .search(&request, &self.state.caller)
            .await
            .map_err(|e| mcp_error("search failed", e))?;

        let summary = format_search_summary(&page.items, &params.query);
        let structured = serde_json::to_value(&page)
            .map_err(|e| mcp_error("failed to serialize search results", e))?;

        let mut result = CallToolResult::default();
        result.content = vec![Content::text(summary)];
        result.structured_content = Some(structured);
        result.is_error = Some(false);
        result.meta = None;
        Ok(result)
    }

    /// Ordered workflow events and file versions of one form.
    #[tool(
        name = "formdex_history",
        description = "Show the workflow events and file versions of a form, oldest first."
    )]
    pub async fn formdex_history(
        &self,
        params: Parameters<HistoryParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let id: FormId = params.0.form_id.parse().map_err(invalid_params)?;
        let state = Arc::clone(&self.state);
        let history =
            tokio::task::spawn_blocking(move || state.catalog.history(id))
                .await
                .map_err(|e| mcp_error("history task failed", e))?
                .map_err(tool_error)?;

        let summary = format!(
            "Form {} is {} with {} event(s) and {} version(s)",
            history.form_id,
            history.status,
            history.events.len(),
            history.versions.len()
        );
        let structured = serde_json::to_value(&history)
            .map_err(|e| mcp_error("failed to serialize history", e))?;

        let mut result = CallToolResult::default();
        result.content = vec![Content::text(summary)];
        result.structured_content = Some(structured);
        result.is_error = Some(false);
        result.meta = None;
        Ok(result)
    }

    /// Apply a workflow action to a form.
    #[tool(
        name = "formdex_transition",
        description = "Apply a workflow action (submit_review, approve, reject, publish, unpublish, archive, restore) to a form."
    )]
    pub async fn formdex_transition(
        &self,
        params: Parameters<TransitionParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let id: FormId = params.form_id.parse().map_err(invalid_params)?;
        let action: WorkflowAction =
            params.action.parse().map_err(invalid_params)?;

        let state = Arc::clone(&self.state);
        let reason = params.reason;
        let event = tokio::task::spawn_blocking(move || {
            state.catalog.transition(id, action, &state.caller, reason)
        })
        .await
        .map_err(|e| mcp_error("transition task failed", e))?
        .map_err(tool_error)?;

        let summary = format!("Form {id} is now {}", event.to);
        let structured = serde_json::to_value(&event)
            .map_err(|e| mcp_error("failed to serialize event", e))?;

        let mut result = CallToolResult::default();
        result.content = vec![Content::text(summary)];
        result.structured_content = Some(structured);
        result.is_error = Some(false);
        result.meta = None;
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for FormdexMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut server_info = Implementation::new(
            "formdex".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        server_info.title = Some("formdex MCP".to_string());
        server_info.icons = None;
        server_info.website_url = None;

        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info = server_info;
        info.instructions = Some(
            "Use formdex_search to find forms by keyword or concept, formdex_history to inspect a form, and formdex_transition to move it through review."
                .to_string(),
        );
        info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Search query string. Empty browses all visible forms.
    pub query: String,
    /// Maximum number of results (default: 20).
    pub limit: Option<usize>,
    /// Number of results to skip.
    pub offset: Option<usize>,
    /// relevance, date, created, title or downloads.
    pub sort: Option<String>,
    /// asc or desc. Defaults to the natural direction of the sort.
    pub order: Option<String>,
    /// Restrict to one category.
    pub category: Option<String>,
    /// Restrict to one business area.
    pub business_area: Option<String>,
    /// Updated at or after, in ms since the Unix epoch.
    pub updated_from: Option<u64>,
    /// Updated at or before, in ms since the Unix epoch.
    pub updated_to: Option<u64>,
    /// Restrict to one workflow status, e.g. pending_review.
    pub status: Option<String>,
    /// Restrict to public (true) or internal (false) forms.
    pub is_public: Option<bool>,
    /// Only published forms, even for admins.
    pub published_only: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    /// Form id, e.g. "12" or "#12".
    pub form_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransitionParams {
    /// Form id, e.g. "12" or "#12".
    pub form_id: String,
    /// Workflow action to apply.
    pub action: String,
    /// Reason recorded with the event.
    pub reason: Option<String>,
}

fn format_search_summary(hits: &[SearchHit], query: &str) -> String {
    if hits.is_empty() {
        return format!("No results found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(hits.len() + 1);
    let suffix = if hits.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} result{} for \"{query}\":",
        hits.len(),
        suffix
    ));

    for hit in hits {
        lines.push(format!("{} {:.4} {}", hit.form_id, hit.score, hit.title));
    }

    lines.join("\n")
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

fn invalid_params(error: Error) -> rmcp::ErrorData {
    rmcp::ErrorData::invalid_params(
        error.to_string(),
        Some(json!({ "kind": error.kind() })),
    )
}

/// Domain failures are reported to the agent as tool errors, not protocol
/// errors, so it can read the kind and react.
fn tool_error(error: Error) -> rmcp::ErrorData {
    match error {
        Error::NotFound { .. }
        | Error::InvalidTransition { .. }
        | Error::PermissionDenied { .. }
        | Error::SeparationOfDutyViolation { .. }
        | Error::IncompleteForm { .. }
        | Error::FormNotEditable { .. }
        | Error::ConcurrentModification { .. }
        | Error::Invalid(_) => invalid_params(error),
        other => mcp_error("operation failed", other),
    }
}

/// Serve MCP over stdio until the client disconnects.
pub async fn serve(catalog: Catalog, caller: Caller) -> error::Result<()> {
    let server = FormdexMcpServer::new(catalog, caller);

    let transport = rmcp::transport::stdio();
    let running = server.clone().serve(transport).await.map_err(|e| {
        Error::Config(format!("MCP server initialization failed: {e}"))
    })?;
    running
        .waiting()
        .await
        .map_err(|e| Error::Config(format!("MCP server error: {e}")))?;

    // Writes made through the tools may still have embeddings queued.
    server.state.catalog.flush_embeddings().await
}
