//! Advisory `ResourceRegistry` table mirror.
//!
//! The registry duplicates the authoritative tag state into a table for
//! query convenience. It is never read for decisions and is rebuildable
//! from tags, so writes are best-effort and failures only warn.

use std::sync::Arc;

use log::warn;

use crate::cloud::types::TableRow;
use crate::cloud::{Role, TableApi, Tags};

pub const REGISTRY_TABLE: &str = "ResourceRegistry";

#[derive(Clone)]
pub struct Registry {
    tables: Arc<dyn TableApi>,
}

impl Registry {
    pub fn new(tables: Arc<dyn TableApi>) -> Self {
        Self { tables }
    }

    /// Mirrors one resource's tag snapshot. Never fails the caller.
    pub async fn record(&self, role: Role, name: &str, tags: &Tags) {
        let row = TableRow {
            partition_key: role.as_str().to_string(),
            row_key: name.to_string(),
            body: serde_json::json!(tags),
        };
        if let Err(err) = self.tables.upsert_row(REGISTRY_TABLE, row).await {
            warn!("registry: failed to mirror {} ({}): {}", name, role.as_str(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudClients;

    #[tokio::test]
    async fn record_upserts_latest_snapshot() {
        let (clients, _cloud) = CloudClients::in_memory();
        let registry = Registry::new(clients.tables.clone());

        let mut tags = Tags::new();
        tags.insert("shellbox:status".into(), "free".into());
        registry.record(Role::Instance, "shellbox-a-box-1", &tags).await;

        tags.insert("shellbox:status".into(), "connected".into());
        registry.record(Role::Instance, "shellbox-a-box-1", &tags).await;

        let rows = clients
            .tables
            .query_partition(REGISTRY_TABLE, "instance")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body["shellbox:status"], "connected");
    }
}
