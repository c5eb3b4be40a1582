//! Federation aggregator.
//!
//! Builds the federated view for one agent session: connects the requested
//! servers in parallel, merges capabilities from cache and fresh discovery,
//! resolves duplicate tool names deterministically, and hands the
//! conversation engine a tool→server dispatch map.

use crate::cache::{CacheEntry, CapabilityCache, Ownership, cache_key};
use crate::config::{ServerConfig, TransportKind};
use crate::errors::{WeaveError, WeaveResult};
use crate::events::{
    CachePayload, ConnectionPayload, Event, EventBus, EventKind, TraceContext,
};
use crate::mcp::capability::{Capabilities, PromptSpec, ResourceSpec, ToolSpec};
use crate::mcp::{McpConnection, McpConnector};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sentinel server set meaning "pure LLM, no tools".
pub const NO_SERVERS_SENTINEL: &str = "none";

/// Bound on cache invalidation during fresh-connection recovery. When the
/// invalidation does not finish in time the cache is bypassed for that
/// reconnect rather than assumed stale.
const INVALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Aggregated capabilities plus live connections for one session.
pub struct FederatedView {
    pub clients: HashMap<String, Arc<dyn McpConnection>>,
    /// Tool name → owning server. Only primary owners appear here.
    pub tool_to_server: HashMap<String, String>,
    /// Exposed tools, duplicates removed, in deterministic merge order.
    pub tools: Vec<ToolSpec>,
    pub prompts: Vec<PromptSpec>,
    pub resources: Vec<ResourceSpec>,
    pub system_prompt: String,
    /// Per-server ownership decisions, as recorded in the cache entries.
    pub ownership: HashMap<String, HashMap<String, Ownership>>,
}

impl std::fmt::Debug for FederatedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedView")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("tool_to_server", &self.tool_to_server)
            .field("tools", &self.tools)
            .field("prompts", &self.prompts)
            .field("resources", &self.resources)
            .field("system_prompt", &self.system_prompt)
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl FederatedView {
    fn empty() -> Self {
        Self {
            clients: HashMap::new(),
            tool_to_server: HashMap::new(),
            tools: vec![],
            prompts: vec![],
            resources: vec![],
            system_prompt:
                "You are a helpful assistant. No external tools are available; answer from \
                 your own knowledge."
                    .to_string(),
            ownership: HashMap::new(),
        }
    }

    /// Function declarations for the exposed tools, provider-ready.
    pub fn function_schemas(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(crate::mcp::capability::tool_to_function_schema)
            .collect()
    }

    /// Close every live connection.
    pub async fn shutdown(&self) {
        for (name, client) in &self.clients {
            if let Err(e) = client.close().await {
                warn!(server = %name, error = %e, "Error closing MCP connection");
            }
        }
    }
}

/// Result of one server's discovery pass.
struct ServerDiscovery {
    server: String,
    connection: Arc<dyn McpConnection>,
    capabilities: Capabilities,
    system_prompt: String,
    from_cache: bool,
    config: ServerConfig,
    transport: TransportKind,
}

pub struct Federation {
    configs: HashMap<String, ServerConfig>,
    connector: Arc<dyn McpConnector>,
    cache: Option<Arc<CapabilityCache>>,
    bus: Arc<EventBus>,
}

impl Federation {
    pub fn new(
        configs: HashMap<String, ServerConfig>,
        connector: Arc<dyn McpConnector>,
        cache: Option<Arc<CapabilityCache>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            configs,
            connector,
            cache,
            bus,
        }
    }

    pub fn server_config(&self, name: &str) -> Option<&ServerConfig> {
        self.configs.get(name)
    }

    /// Build the federated view for `requested` servers, in declaration
    /// order. The sentinel `none` (or an empty list) yields an empty but
    /// well-formed view.
    pub async fn federate(
        &self,
        requested: &[String],
        trace: &TraceContext,
    ) -> WeaveResult<FederatedView> {
        if requested.is_empty()
            || (requested.len() == 1 && requested[0].eq_ignore_ascii_case(NO_SERVERS_SENTINEL))
        {
            debug!("No servers requested; returning empty federated view");
            return Ok(FederatedView::empty());
        }

        // Unknown server names are a configuration error, fatal at session
        // creation time.
        for name in requested {
            if !self.configs.contains_key(name) {
                return Err(WeaveError::Config(format!(
                    "requested MCP server '{}' is not configured",
                    name
                )));
            }
        }

        self.bus.emit(Event::point(
            EventKind::McpDiscoveryStart(ConnectionPayload {
                server: requested.join(","),
                ..Default::default()
            }),
            trace,
            1,
            None,
        ));

        // Parallel pass: cache consult + live connect per server. Cached
        // servers still get live connections (needed for tool execution);
        // only the capability listing is skipped.
        let discoveries = join_all(requested.iter().map(|name| {
            let config = self.configs[name].clone();
            async move { self.discover_server(name, config, false, trace).await }
        }))
        .await;

        let mut ordered: Vec<ServerDiscovery> = Vec::new();
        for (name, outcome) in requested.iter().zip(discoveries) {
            match outcome {
                Ok(discovery) => ordered.push(discovery),
                Err(e) => {
                    warn!(server = %name, error = %e, "Skipping unreachable MCP server");
                }
            }
        }

        // Populate the cache for freshly discovered servers, ownership
        // included, so later runs reproduce the same decisions offline.
        let view = self.merge(ordered, trace);

        self.bus.emit(Event::point(
            EventKind::McpDiscoveryEnd(ConnectionPayload {
                server: requested.join(","),
                tool_count: Some(view.tools.len()),
                ..Default::default()
            }),
            trace,
            1,
            None,
        ));

        Ok(view)
    }

    /// Reconnect path for a dead transport observed mid-conversation. The
    /// stale cache entry is invalidated under a 30 s bound; on timeout the
    /// cache is bypassed for this reconnect instead.
    pub async fn get_fresh_connection(
        &self,
        server: &str,
        trace: &TraceContext,
    ) -> WeaveResult<Arc<dyn McpConnection>> {
        let config = self
            .configs
            .get(server)
            .cloned()
            .ok_or_else(|| WeaveError::Config(format!("unknown server '{}'", server)))?;

        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let server_owned = server.to_string();
            let invalidation = tokio::time::timeout(
                INVALIDATION_TIMEOUT,
                tokio::task::spawn_blocking(move || cache.invalidate_by_server(&server_owned)),
            )
            .await;
            match invalidation {
                Ok(Ok(count)) => {
                    self.bus.emit(Event::point(
                        EventKind::CacheInvalidate(CachePayload {
                            server: server.to_string(),
                            detail: Some(format!("{} entries", count)),
                            ..Default::default()
                        }),
                        trace,
                        1,
                        None,
                    ));
                }
                _ => {
                    warn!(server = %server, "Cache invalidation timed out; bypassing cache for reconnect");
                    self.bus.emit(Event::point(
                        EventKind::CacheBypass(CachePayload {
                            server: server.to_string(),
                            detail: Some("invalidation timed out".into()),
                            ..Default::default()
                        }),
                        trace,
                        1,
                        None,
                    ));
                }
            }
        }

        self.bus.emit(Event::point(
            EventKind::McpReconnect(ConnectionPayload {
                server: server.to_string(),
                ..Default::default()
            }),
            trace,
            1,
            None,
        ));

        let discovery = self.discover_server(server, config, true, trace).await?;
        Ok(discovery.connection)
    }

    /// Connect one server and obtain its capabilities, from cache when
    /// allowed and present, freshly otherwise.
    async fn discover_server(
        &self,
        name: &str,
        config: ServerConfig,
        bypass_cache: bool,
        trace: &TraceContext,
    ) -> WeaveResult<ServerDiscovery> {
        let transport = config
            .transport_kind()
            .map_err(|e| WeaveError::Config(format!("server '{}': {}", name, e)))?;
        let key = cache_key(name, &config);

        let cached_entry = if bypass_cache {
            None
        } else {
            self.cache.as_ref().and_then(|cache| {
                cache
                    .get(&key)
                    .or_else(|| cache.reload_from_disk(&key))
            })
        };

        match &cached_entry {
            Some(_) => {
                self.bus.emit(Event::point(
                    EventKind::CacheHit(CachePayload {
                        server: name.to_string(),
                        key: Some(key.clone()),
                        ..Default::default()
                    }),
                    trace,
                    1,
                    None,
                ));
            }
            None => {
                self.bus.emit(Event::point(
                    EventKind::CacheMiss(CachePayload {
                        server: name.to_string(),
                        key: Some(key.clone()),
                        ..Default::default()
                    }),
                    trace,
                    1,
                    None,
                ));
            }
        }

        // Live connection in every case; capability data may come from cache.
        let connect_correlation = crate::events::new_correlation_id();
        self.bus.emit(Event::with_correlation(
            EventKind::McpConnectStart(ConnectionPayload {
                server: name.to_string(),
                transport: transport.to_string(),
                ..Default::default()
            }),
            trace,
            1,
            None,
            connect_correlation.clone(),
        ));

        let connection = match self.connector.connect(name, &config).await {
            Ok(connection) => connection,
            Err(e) => {
                self.bus.emit(Event::with_correlation(
                    EventKind::McpConnectError(ConnectionPayload {
                        server: name.to_string(),
                        transport: transport.to_string(),
                        error: Some(e.to_string()),
                        ..Default::default()
                    }),
                    trace,
                    1,
                    None,
                    connect_correlation,
                ));
                return Err(e);
            }
        };

        let (capabilities, system_prompt, from_cache) = match cached_entry {
            Some(entry) => (
                Capabilities {
                    tools: entry.tools,
                    prompts: entry.prompts,
                    resources: entry.resources,
                },
                entry.system_prompt,
                true,
            ),
            None => {
                let capabilities = self
                    .fresh_capabilities(name, &config, connection.as_ref())
                    .await?;
                let system_prompt = build_server_summary(name, transport, &capabilities);
                (capabilities, system_prompt, false)
            }
        };

        self.bus.emit(Event::with_correlation(
            EventKind::McpConnectEnd(ConnectionPayload {
                server: name.to_string(),
                transport: transport.to_string(),
                tool_count: Some(capabilities.tools.len()),
                ..Default::default()
            }),
            trace,
            1,
            None,
            connect_correlation,
        ));

        Ok(ServerDiscovery {
            server: name.to_string(),
            connection,
            capabilities,
            system_prompt,
            from_cache,
            config,
            transport,
        })
    }

    /// Fresh capability listing, with the server's filters applied and
    /// prompt content fetched eagerly so the cache entry works offline.
    async fn fresh_capabilities(
        &self,
        name: &str,
        config: &ServerConfig,
        connection: &dyn McpConnection,
    ) -> WeaveResult<Capabilities> {
        let mut tools = connection.list_tools().await?;
        if !config.tool_filter.is_empty() {
            tools.retain(|t| config.tool_filter.iter().any(|f| f == &t.name));
        }

        let mut prompts = match connection.list_prompts().await {
            Ok(prompts) => prompts,
            Err(e) => {
                // Plenty of servers expose no prompt surface at all.
                debug!(server = %name, error = %e, "Prompt listing unavailable");
                vec![]
            }
        };
        if !config.prompt_filter.is_empty() {
            prompts.retain(|p| config.prompt_filter.iter().any(|f| f == &p.name));
        }
        for prompt in &mut prompts {
            match connection.get_prompt(&prompt.name).await {
                Ok(content) if !content.is_empty() => prompt.description = content,
                Ok(_) => {}
                Err(e) => {
                    warn!(server = %name, prompt = %prompt.name, error = %e, "Prompt fetch failed");
                }
            }
        }

        let resources = match connection.list_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                debug!(server = %name, error = %e, "Resource listing unavailable");
                vec![]
            }
        };

        info!(
            server = %name,
            tools = tools.len(),
            prompts = prompts.len(),
            resources = resources.len(),
            "Discovered MCP capabilities"
        );

        Ok(Capabilities {
            tools,
            prompts,
            resources,
        })
    }

    /// Merge per-server discoveries into one view. Iteration follows the
    /// requested declaration order, so two runs with the same configuration
    /// produce the same ownership decisions. The first server to register a
    /// tool name becomes its primary owner; later occurrences are recorded
    /// as duplicates and withheld from the exposed tool list (providers
    /// reject duplicate function declarations).
    fn merge(&self, discoveries: Vec<ServerDiscovery>, trace: &TraceContext) -> FederatedView {
        let mut clients = HashMap::new();
        let mut tool_to_server = HashMap::new();
        let mut tools = Vec::new();
        let mut prompts = Vec::new();
        let mut resources = Vec::new();
        let mut sections = Vec::new();
        let mut ownership: HashMap<String, HashMap<String, Ownership>> = HashMap::new();

        for discovery in &discoveries {
            let per_server = ownership.entry(discovery.server.clone()).or_default();
            for tool in &discovery.capabilities.tools {
                if tool_to_server.contains_key(&tool.name) {
                    debug!(
                        server = %discovery.server,
                        tool = %tool.name,
                        "Duplicate tool withheld from federated view"
                    );
                    per_server.insert(tool.name.clone(), Ownership::Duplicate);
                    continue;
                }
                tool_to_server.insert(tool.name.clone(), discovery.server.clone());
                per_server.insert(tool.name.clone(), Ownership::Primary);
                tools.push(tool.clone());
            }

            prompts.extend(discovery.capabilities.prompts.iter().cloned());
            resources.extend(discovery.capabilities.resources.iter().cloned());
            sections.push(discovery.system_prompt.clone());
            clients.insert(discovery.server.clone(), discovery.connection.clone());
        }

        // Persist fresh discoveries with their ownership decisions.
        if let Some(cache) = &self.cache {
            for discovery in &discoveries {
                if discovery.from_cache {
                    continue;
                }
                let entry = CacheEntry {
                    server_name: discovery.server.clone(),
                    cache_key: String::new(),
                    tools: discovery.capabilities.tools.clone(),
                    prompts: discovery.capabilities.prompts.clone(),
                    resources: discovery.capabilities.resources.clone(),
                    system_prompt: discovery.system_prompt.clone(),
                    protocol: discovery.transport,
                    created_at: Utc::now(),
                    last_accessed: Utc::now(),
                    ttl_minutes: cache.default_ttl_minutes(),
                    tool_ownership: ownership
                        .get(&discovery.server)
                        .cloned()
                        .unwrap_or_default(),
                    is_valid: true,
                };
                match cache.put(entry, &discovery.config) {
                    Ok(key) => {
                        self.bus.emit(Event::point(
                            EventKind::CacheWrite(CachePayload {
                                server: discovery.server.clone(),
                                key: Some(key),
                                ..Default::default()
                            }),
                            trace,
                            1,
                            None,
                        ));
                    }
                    Err(e) => {
                        // Cache failures are never fatal.
                        warn!(server = %discovery.server, error = %e, "Cache write failed");
                    }
                }
            }
        }

        let system_prompt = build_system_prompt(&sections, &prompts);

        FederatedView {
            clients,
            tool_to_server,
            tools,
            prompts,
            resources,
            system_prompt,
            ownership,
        }
    }
}

/// Per-server capability summary, stored in the cache entry so cached runs
/// can rebuild the system prompt without touching the server.
fn build_server_summary(name: &str, transport: TransportKind, caps: &Capabilities) -> String {
    let mut summary = format!("## Server: {} ({})\n", name, transport);
    if caps.tools.is_empty() {
        summary.push_str("No tools.\n");
    } else {
        summary.push_str("Tools:\n");
        for tool in &caps.tools {
            let _ = writeln!(summary, "- {}: {}", tool.name, first_line(&tool.description));
        }
    }
    if !caps.resources.is_empty() {
        summary.push_str("Resources:\n");
        for resource in &caps.resources {
            let _ = writeln!(summary, "- {} ({})", resource.uri, resource.mime_type);
        }
    }
    summary
}

fn build_system_prompt(sections: &[String], prompts: &[PromptSpec]) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant with access to tools from connected MCP servers. \
         Use them when they help answer the question; call a tool rather than guessing \
         about external state.\n\n",
    );
    for section in sections {
        prompt.push_str(section);
        prompt.push('\n');
    }
    if !prompts.is_empty() {
        prompt.push_str("## Server prompts\n");
        for spec in prompts {
            let _ = writeln!(prompt, "### {} ({})\n{}", spec.name, spec.server, spec.description);
        }
    }
    prompt
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
