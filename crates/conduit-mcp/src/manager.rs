// SPDX-License-Identifier: Apache-2.0
//! C5 — server manager: a pool of [`McpSession`]s, aggregated tool routing,
//! and coordinated shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::McpError;
use crate::session::{McpSession, SessionLimits, ToolCallOutcome, ToolDescriptor};
use crate::transport::TransportSpec;

/// Declares one MCP child before it is started.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub tee_stderr: bool,
    pub limits: SessionLimits,
}

/// Resolve the transport for `entry`: nested mode (§4.2, `MCP_NESTED=1`)
/// dials a Unix socket first and falls back to spawning the configured
/// stdio command with a warning if the dial fails.
pub fn resolve_transport(entry: &ServerEntry) -> TransportSpec {
    let stdio = TransportSpec::Stdio {
        command: entry.command.clone(),
        args: entry.args.clone(),
        env: entry.env.clone(),
        tee_stderr: entry.tee_stderr,
    };

    if std::env::var("MCP_NESTED").as_deref() != Ok("1") {
        return stdio;
    }

    let env_key = format!("MCP_{}_SOCKET", entry.name.to_uppercase().replace('-', "_"));
    let socket_path = std::env::var(&env_key).ok().or_else(|| {
        std::env::var("MCP_SOCKET_DIR")
            .ok()
            .map(|dir| format!("{dir}/{}.sock", entry.name))
    });

    match socket_path {
        Some(path) => TransportSpec::Socket { path: path.into() },
        None => stdio,
    }
}

struct Routed {
    server: String,
    descriptor: ToolDescriptor,
}

/// Owns every connected MCP child and routes `tools/call` to whichever
/// session first claimed a tool name.
pub struct ServerManager {
    sessions: HashMap<String, Arc<McpSession>>,
    routing: HashMap<String, String>,
    catalog: Vec<Routed>,
}

impl ServerManager {
    /// Start every entry concurrently. Entries that fail to connect are
    /// reported alongside the manager rather than aborting the whole pool —
    /// a single misbehaving server should not block the others.
    pub async fn connect_all(entries: Vec<ServerEntry>) -> (Self, Vec<(String, McpError)>) {
        let attempts = entries.into_iter().map(|entry| async move {
            // Falling back to stdio when a nested socket dial fails is done
            // here rather than inside `resolve_transport`, since that needs
            // an actual connect attempt, not just a path decision.
            let nested_spec = resolve_transport(&entry);
            let result = McpSession::start(&entry.name, &nested_spec, entry.limits.clone()).await;
            let result = match (result, &nested_spec) {
                (Err(e), TransportSpec::Socket { .. }) => {
                    warn!(server = %entry.name, error = %e, "nested socket dial failed, falling back to stdio");
                    let stdio = TransportSpec::Stdio {
                        command: entry.command.clone(),
                        args: entry.args.clone(),
                        env: entry.env.clone(),
                        tee_stderr: entry.tee_stderr,
                    };
                    McpSession::start(&entry.name, &stdio, entry.limits.clone()).await
                }
                (other, _) => other,
            };
            (entry.name, result)
        });

        let results = futures::future::join_all(attempts).await;

        let mut sessions = HashMap::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(session) => {
                    sessions.insert(name, Arc::new(session));
                }
                Err(e) => failures.push((name, e)),
            }
        }

        let mut manager = Self { sessions, routing: HashMap::new(), catalog: Vec::new() };
        manager.refresh_catalog_best_effort().await;
        (manager, failures)
    }

    async fn refresh_catalog_best_effort(&mut self) {
        // Deterministic order so "first-connected-wins" is reproducible
        // across runs rather than depending on HashMap iteration order.
        let mut names: Vec<&String> = self.sessions.keys().collect();
        names.sort();

        for name in names {
            let session = &self.sessions[name];
            match session.list_tools().await {
                Ok(tools) => {
                    for tool in tools {
                        if self.routing.contains_key(&tool.name) {
                            warn!(
                                tool = %tool.name,
                                server = %name,
                                owner = %self.routing[&tool.name],
                                "duplicate tool name across MCP servers; keeping first-connected owner"
                            );
                            continue;
                        }
                        self.routing.insert(tool.name.clone(), name.clone());
                        self.catalog.push(Routed { server: name.clone(), descriptor: tool });
                    }
                }
                Err(e) => warn!(server = %name, error = %e, "could not list tools for server"),
            }
        }
    }

    /// The aggregated, de-duplicated tool catalog across every connected
    /// server, in first-connected-wins order.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.catalog.iter().map(|r| r.descriptor.clone()).collect()
    }

    pub fn server_for_tool(&self, tool_name: &str) -> Option<&str> {
        self.routing.get(tool_name).map(String::as_str)
    }

    /// Route `tool_name` to its owning server and invoke it.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallOutcome, McpError> {
        let server = self
            .routing
            .get(tool_name)
            .ok_or_else(|| McpError::UnknownTool(tool_name.to_string()))?;
        let session = self
            .sessions
            .get(server)
            .ok_or_else(|| McpError::UnknownTool(tool_name.to_string()))?;
        session.call_tool(tool_name, arguments).await
    }

    pub fn connected_servers(&self) -> Vec<&str> {
        self.sessions.keys().map(String::as_str).collect()
    }

    /// Close every session in parallel, each bounded by `per_session_deadline`,
    /// and the whole operation additionally bounded by `global_cap` so one
    /// stuck child can't hold the process open indefinitely.
    pub async fn shutdown(&self, per_session_deadline: Duration, global_cap: Duration) {
        let closes = self.sessions.values().map(|session| {
            let session = session.clone();
            async move {
                if tokio::time::timeout(per_session_deadline, session.close()).await.is_err() {
                    warn!(server = %session.server_name, "session did not close within its deadline");
                }
            }
        });

        if tokio::time::timeout(global_cap, futures::future::join_all(closes)).await.is_err() {
            warn!("server manager shutdown exceeded global cap; some sessions may still be exiting");
        } else {
            info!("all MCP sessions closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ServerEntry {
        let script = format!(
            r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"{name}_tool","inputSchema":{{"type":"object"}}}}]}}}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[],"isError":false}}}}\n' "$id" ;;
  esac
done
"#
        );
        ServerEntry {
            name: name.to_string(),
            command: "sh".into(),
            args: vec!["-c".into(), script],
            env: vec![],
            tee_stderr: false,
            limits: SessionLimits::default(),
        }
    }

    #[tokio::test]
    async fn connects_multiple_servers_and_aggregates_tools() {
        let (manager, failures) = ServerManager::connect_all(vec![entry("alpha"), entry("beta")]).await;
        assert!(failures.is_empty());
        let names: Vec<_> = manager.tools().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"alpha_tool".to_string()));
        assert!(names.contains(&"beta_tool".to_string()));
        manager.shutdown(Duration::from_secs(5), Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn execute_tool_routes_to_owning_server() {
        let (manager, _) = ServerManager::connect_all(vec![entry("alpha")]).await;
        let outcome = manager.execute_tool("alpha_tool", serde_json::json!({})).await.unwrap();
        assert_eq!(outcome.content, serde_json::json!([]));
        manager.shutdown(Duration::from_secs(5), Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_panicking() {
        let (manager, _) = ServerManager::connect_all(vec![entry("alpha")]).await;
        let err = manager.execute_tool("nonexistent", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownTool(_)));
        manager.shutdown(Duration::from_secs(5), Duration::from_secs(10)).await;
    }

    #[test]
    fn resolve_transport_stays_stdio_outside_nested_mode() {
        std::env::remove_var("MCP_NESTED");
        let spec = resolve_transport(&entry("alpha"));
        assert!(!matches!(spec, TransportSpec::Socket { .. }));
    }

    #[test]
    fn resolve_transport_picks_per_server_socket_env_in_nested_mode() {
        std::env::set_var("MCP_NESTED", "1");
        std::env::set_var("MCP_ALPHA_SOCKET", "/tmp/alpha.sock");
        let spec = resolve_transport(&entry("alpha"));
        assert!(matches!(spec, TransportSpec::Socket { path } if path == std::path::Path::new("/tmp/alpha.sock")));
        std::env::remove_var("MCP_NESTED");
        std::env::remove_var("MCP_ALPHA_SOCKET");
    }

    #[tokio::test]
    async fn failing_server_does_not_block_the_others() {
        let mut bad = entry("broken");
        bad.command = "/nonexistent/binary/conduit-test".into();
        bad.args = vec![];
        let (manager, failures) = ServerManager::connect_all(vec![entry("alpha"), bad]).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");
        assert_eq!(manager.connected_servers(), vec!["alpha"]);
        manager.shutdown(Duration::from_secs(5), Duration::from_secs(10)).await;
    }
}
