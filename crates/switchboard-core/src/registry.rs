//! Live application registry
//!
//! Maps connection → application identity → tool catalog. The registry owns
//! its synchronization; callers never lock around it and it never performs
//! I/O, so a slow application socket cannot stall registry readers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::ConnectionId;
use crate::error::RouteError;
use crate::protocol::ToolDefinition;
use crate::router::{self, AppTools, CatalogEntry, Route};

/// Everything known about one application connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub connection_id: ConnectionId,
    pub name: String,
    pub tools: Vec<ToolDefinition>,
    pub registered_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Result of [`Registry::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First registration on this connection
    Registered,
    /// The connection re-registered; its catalog was replaced
    Replaced { previous_name: String },
}

/// Shared registry of connected applications
#[derive(Debug, Default)]
pub struct Registry {
    apps: RwLock<HashMap<ConnectionId, AppRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the registration of a connection
    ///
    /// The catalog is replaced wholesale, never merged. Duplicate tool names
    /// within the new catalog keep their first occurrence.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        name: String,
        tools: Vec<ToolDefinition>,
    ) -> RegisterOutcome {
        let tools = dedup_tools(&name, tools);
        let now = Utc::now();

        let mut apps = self.apps.write().await;
        match apps.get_mut(&connection_id) {
            Some(record) => {
                let previous_name = std::mem::replace(&mut record.name, name);
                record.tools = tools;
                record.connected = true;
                record.disconnected_at = None;
                record.last_activity_at = now;
                debug!(
                    "{} re-registered as '{}' with {} tools",
                    connection_id,
                    record.name,
                    record.tools.len()
                );
                RegisterOutcome::Replaced { previous_name }
            }
            None => {
                info!(
                    "{} registered as '{}' with {} tools",
                    connection_id,
                    name,
                    tools.len()
                );
                apps.insert(
                    connection_id,
                    AppRecord {
                        connection_id,
                        name,
                        tools,
                        registered_at: now,
                        last_activity_at: now,
                        connected: true,
                        disconnected_at: None,
                    },
                );
                RegisterOutcome::Registered
            }
        }
    }

    /// Mark a connection as gone
    ///
    /// The record (tools included) stays for diagnostics but is excluded from
    /// routing and the catalog immediately. Returns whether it was connected.
    pub async fn unregister(&self, connection_id: ConnectionId) -> bool {
        let mut apps = self.apps.write().await;
        match apps.get_mut(&connection_id) {
            Some(record) if record.connected => {
                record.connected = false;
                record.disconnected_at = Some(Utc::now());
                info!("{} ('{}') unregistered", connection_id, record.name);
                true
            }
            _ => false,
        }
    }

    /// Record inbound activity on a registered connection
    pub async fn touch(&self, connection_id: ConnectionId) {
        if let Some(record) = self.apps.write().await.get_mut(&connection_id) {
            record.last_activity_at = Utc::now();
        }
    }

    /// Flattened catalog over all connected applications
    pub async fn all_tools(&self) -> Vec<CatalogEntry> {
        let apps = self.apps.read().await;
        let connected = connected_sorted(&apps);
        router::aggregate(&views(&connected))
    }

    /// Resolve a bare or namespaced tool name to its owner
    pub async fn find_owner(&self, tool_name: &str) -> Result<Route, RouteError> {
        let apps = self.apps.read().await;
        let connected = connected_sorted(&apps);
        router::resolve(tool_name, &views(&connected))
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<AppRecord> {
        self.apps.read().await.get(&connection_id).cloned()
    }

    /// Copy of every record, connected or not, ordered by connection
    pub async fn snapshot(&self) -> Vec<AppRecord> {
        let apps = self.apps.read().await;
        let mut records: Vec<AppRecord> = apps.values().cloned().collect();
        records.sort_by_key(|r| r.connection_id);
        records
    }

    pub async fn connected_count(&self) -> usize {
        self.apps.read().await.values().filter(|r| r.connected).count()
    }

    /// Drop disconnected records older than `retention`
    pub async fn evict_disconnected(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_disconnected_before(cutoff).await
    }

    /// Drop disconnected records whose disconnect happened before `cutoff`
    pub async fn evict_disconnected_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut apps = self.apps.write().await;
        let before = apps.len();
        apps.retain(|_, record| {
            record.connected || record.disconnected_at.is_some_and(|at| at >= cutoff)
        });
        let evicted = before - apps.len();
        if evicted > 0 {
            debug!("Evicted {} disconnected application records", evicted);
        }
        evicted
    }
}

fn connected_sorted(apps: &HashMap<ConnectionId, AppRecord>) -> Vec<&AppRecord> {
    let mut connected: Vec<&AppRecord> = apps.values().filter(|r| r.connected).collect();
    connected.sort_by_key(|r| r.connection_id);
    connected
}

fn views<'a>(records: &[&'a AppRecord]) -> Vec<AppTools<'a>> {
    records
        .iter()
        .map(|record| AppTools {
            connection_id: record.connection_id,
            app_name: &record.name,
            tools: &record.tools,
        })
        .collect()
}

fn dedup_tools(app_name: &str, tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
    let mut seen = HashSet::new();
    tools
        .into_iter()
        .filter(|tool| {
            let first = seen.insert(tool.name.clone());
            if !first {
                warn!(
                    "'{}' declared tool '{}' more than once; keeping the first",
                    app_name, tool.name
                );
            }
            first
        })
        .collect()
}
