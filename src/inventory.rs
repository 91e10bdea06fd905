//! Read-only, status-tag-aware enumeration of pool resources.
//!
//! Queries re-read the cloud on every call; there is no cache. The next
//! reconciliation tick is the consistency mechanism, so serving slightly
//! stale pages here is fine; mutations will be re-observed.

use chrono::{DateTime, Utc};
use log::warn;

use crate::cloud::types::{
    DiskRecord, Tags, VmRecord, TAG_CREATED, TAG_LAST_USED, TAG_ROLE, TAG_STATUS, TAG_USER_ID,
    TAG_VOLUME_ID,
};
use crate::cloud::{CloudClients, Role, Status};
use crate::error::Result;
use crate::naming::Namer;

/// Whether a pool resource is backed by a VM or a managed disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Instance,
    Volume,
}

/// Unified tag-parsed view of one pool member.
#[derive(Debug, Clone)]
pub struct PoolResource {
    pub name: String,
    pub resource_id: String,
    /// Pool id extracted from the name (instance id or volume id)
    pub id: String,
    pub kind: ResourceKind,
    pub role: Role,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Private IP in the boxes subnet (instances only)
    pub private_ip: Option<String>,
    /// Volume bound to this instance, or this volume's own id
    pub volume_id: Option<String>,
    /// Fingerprint of the lessee, once leased
    pub user_id: Option<String>,
}

/// Free/leased/total counts for one resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub free: usize,
    pub connected: usize,
    pub attached: usize,
    pub deallocated: usize,
    pub total: usize,
}

fn parse_common(tags: &Tags) -> Option<(Role, Status, DateTime<Utc>, DateTime<Utc>)> {
    let role = Role::parse(tags.get(TAG_ROLE)?).ok()?;
    let status = Status::parse(tags.get(TAG_STATUS)?).ok()?;
    let created = DateTime::parse_from_rfc3339(tags.get(TAG_CREATED)?)
        .ok()?
        .with_timezone(&Utc);
    let last_used = tags
        .get(TAG_LAST_USED)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(created);
    Some((role, status, created, last_used))
}

pub struct Inventory {
    clients: CloudClients,
    namer: Namer,
}

impl Inventory {
    pub fn new(clients: CloudClients, namer: Namer) -> Self {
        Self { clients, namer }
    }

    fn resource_from_vm(&self, record: &VmRecord) -> Option<PoolResource> {
        let (role, status, created_at, last_used_at) = match parse_common(&record.tags) {
            Some(parsed) => parsed,
            None => {
                warn!("inventory: vm {} has no readable pool tags, skipping", record.name);
                return None;
            }
        };
        let id = self
            .namer
            .instance_id(&record.name)
            .map(|s| s.to_string())
            .unwrap_or_else(|| record.name.clone());
        Some(PoolResource {
            name: record.name.clone(),
            resource_id: record.resource_id.clone(),
            id,
            kind: ResourceKind::Instance,
            role,
            status,
            created_at,
            last_used_at,
            private_ip: Some(record.private_ip.clone()),
            volume_id: record.tags.get(TAG_VOLUME_ID).cloned(),
            user_id: record.tags.get(TAG_USER_ID).cloned(),
        })
    }

    fn resource_from_disk(&self, record: &DiskRecord) -> Option<PoolResource> {
        let (role, status, created_at, last_used_at) = match parse_common(&record.tags) {
            Some(parsed) => parsed,
            None => {
                warn!("inventory: disk {} has no readable pool tags, skipping", record.name);
                return None;
            }
        };
        let id = self.namer.volume_id(&record.name)?.to_string();
        Some(PoolResource {
            name: record.name.clone(),
            resource_id: record.resource_id.clone(),
            id: id.clone(),
            kind: ResourceKind::Volume,
            role,
            status,
            created_at,
            last_used_at,
            private_ip: None,
            volume_id: Some(id),
            user_id: record.tags.get(TAG_USER_ID).cloned(),
        })
    }

    async fn vms_with_prefix(&self, prefix: &str) -> Result<Vec<PoolResource>> {
        let mut out = Vec::new();
        let mut page = self.clients.compute.list_vms(prefix, None).await?;
        loop {
            out.extend(page.items.iter().filter_map(|r| self.resource_from_vm(r)));
            match page.next {
                Some(token) => page = self.clients.compute.list_vms(prefix, Some(token)).await?,
                None => break,
            }
        }
        Ok(out)
    }

    /// Pool member box VMs of this deployment, every page. Temp VMs from
    /// golden builds are excluded.
    pub async fn instances(&self) -> Result<Vec<PoolResource>> {
        let mut out = self.vms_with_prefix(&self.namer.box_prefix()).await?;
        out.retain(|r| r.role == Role::Instance);
        Ok(out)
    }

    /// Pool member data volumes of this deployment, every page. Temp disks
    /// from golden builds share the name prefix and are excluded by role.
    pub async fn volumes(&self) -> Result<Vec<PoolResource>> {
        let prefix = self.namer.volume_prefix();
        let mut out = Vec::new();
        let mut page = self.clients.disks.list_disks(&prefix, None).await?;
        loop {
            out.extend(page.items.iter().filter_map(|r| self.resource_from_disk(r)));
            match page.next {
                Some(token) => page = self.clients.disks.list_disks(&prefix, Some(token)).await?,
                None => break,
            }
        }
        out.retain(|r| r.role == Role::Volume);
        Ok(out)
    }

    async fn of_kind(&self, kind: ResourceKind) -> Result<Vec<PoolResource>> {
        match kind {
            ResourceKind::Instance => self.instances().await,
            ResourceKind::Volume => self.volumes().await,
        }
    }

    pub async fn list_by_role(&self, role: Role) -> Result<Vec<PoolResource>> {
        match role {
            Role::Instance => self.instances().await,
            Role::Volume => self.volumes().await,
            Role::Temp => self.vms_with_prefix(&self.namer.temp_prefix()).await,
            Role::Bastion | Role::Golden => {
                let mut out = self.vms_with_prefix(&self.namer.bastion_vm()).await?;
                out.retain(|r| r.role == role);
                Ok(out)
            }
        }
    }

    pub async fn list_by_status(
        &self,
        kind: ResourceKind,
        status: Status,
    ) -> Result<Vec<PoolResource>> {
        let mut resources = self.of_kind(kind).await?;
        resources.retain(|r| r.status == status);
        Ok(resources)
    }

    pub async fn count_by_status(&self, kind: ResourceKind) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for resource in self.of_kind(kind).await? {
            counts.total += 1;
            match resource.status {
                Status::Free => counts.free += 1,
                Status::Connected => counts.connected += 1,
                Status::Attached => counts.attached += 1,
                Status::Deallocated => counts.deallocated += 1,
            }
        }
        Ok(counts)
    }

    /// The `n` oldest free resources, FIFO by `created_at`, ties broken by
    /// pool id so concurrent observers agree on the victims.
    pub async fn oldest_free(&self, kind: ResourceKind, n: usize) -> Result<Vec<PoolResource>> {
        let mut free = self.list_by_status(kind, Status::Free).await?;
        free.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        free.truncate(n);
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::types::{DiskSpec, NicSpec, NsgSpec, VmSpec};
    use crate::config::Deployment;

    async fn seed_instance(
        cloud: &crate::cloud::InMemoryCloud,
        namer: &Namer,
        id: &str,
        status: Status,
        created: &str,
    ) {
        use crate::cloud::{ComputeApi, NetworkApi};
        cloud
            .create_nsg(NsgSpec {
                name: namer.nsg(id),
                rules: vec![],
            })
            .await
            .unwrap();
        cloud
            .create_nic(NicSpec {
                name: namer.nic(id),
                subnet: namer.boxes_subnet(),
                nsg: namer.nsg(id),
            })
            .await
            .unwrap();
        let mut tags = Tags::new();
        tags.insert(TAG_ROLE.into(), Role::Instance.as_str().into());
        tags.insert(TAG_STATUS.into(), status.as_str().into());
        tags.insert(TAG_CREATED.into(), created.into());
        tags.insert(TAG_LAST_USED.into(), created.into());
        cloud
            .create_vm(VmSpec {
                name: namer.box_vm(id),
                computer_name: namer.computer_name(id),
                nic: namer.nic(id),
                os_disk: namer.os_disk(id),
                user_data: String::new(),
                ssh_public_key: "ssh-ed25519 AAAA test".into(),
                tags,
            })
            .await
            .unwrap();
    }

    async fn seed_volume(
        cloud: &crate::cloud::InMemoryCloud,
        namer: &Namer,
        id: &str,
        status: Status,
        created: &str,
    ) {
        use crate::cloud::DiskApi;
        let mut tags = Tags::new();
        tags.insert(TAG_ROLE.into(), Role::Volume.as_str().into());
        tags.insert(TAG_STATUS.into(), status.as_str().into());
        tags.insert(TAG_CREATED.into(), created.into());
        cloud
            .create_disk(DiskSpec {
                name: namer.volume(id),
                size_gb: 64,
                source_snapshot: None,
                tags,
            })
            .await
            .unwrap();
    }

    fn setup() -> (std::sync::Arc<crate::cloud::InMemoryCloud>, Namer, Inventory) {
        let (clients, cloud) = CloudClients::in_memory();
        let namer = Namer::new(&Deployment::new("alpha", "westeurope").unwrap());
        let inventory = Inventory::new(clients, namer.clone());
        (cloud, namer, inventory)
    }

    #[tokio::test]
    async fn counts_group_by_status() {
        let (cloud, namer, inventory) = setup();
        seed_instance(&cloud, &namer, "a", Status::Free, "2026-01-01T00:00:00Z").await;
        seed_instance(&cloud, &namer, "b", Status::Free, "2026-01-02T00:00:00Z").await;
        seed_instance(&cloud, &namer, "c", Status::Connected, "2026-01-03T00:00:00Z").await;

        let counts = inventory.count_by_status(ResourceKind::Instance).await.unwrap();
        assert_eq!(counts.free, 2);
        assert_eq!(counts.connected, 1);
        assert_eq!(counts.total, 3);
    }

    #[tokio::test]
    async fn oldest_free_is_fifo_with_id_tiebreak() {
        let (cloud, namer, inventory) = setup();
        seed_instance(&cloud, &namer, "young", Status::Free, "2026-01-05T00:00:00Z").await;
        seed_instance(&cloud, &namer, "old-b", Status::Free, "2026-01-01T00:00:00Z").await;
        seed_instance(&cloud, &namer, "old-a", Status::Free, "2026-01-01T00:00:00Z").await;
        seed_instance(&cloud, &namer, "leased", Status::Connected, "2025-12-01T00:00:00Z").await;

        let oldest = inventory.oldest_free(ResourceKind::Instance, 2).await.unwrap();
        let ids: Vec<&str> = oldest.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["old-a", "old-b"]);
    }

    #[tokio::test]
    async fn listing_spans_pages() {
        let (cloud, namer, inventory) = setup();
        for i in 0..25 {
            seed_volume(
                &cloud,
                &namer,
                &format!("v{:02}", i),
                Status::Free,
                "2026-01-01T00:00:00Z",
            )
            .await;
        }
        let volumes = inventory.volumes().await.unwrap();
        assert_eq!(volumes.len(), 25);
    }

    #[tokio::test]
    async fn deployments_see_disjoint_inventories() {
        let (cloud, namer_a, inventory_a) = setup();
        let namer_b = Namer::new(&Deployment::new("beta", "westeurope").unwrap());
        let inventory_b = Inventory::new(
            {
                // second deployment over the same cloud account
                let clients = CloudClients {
                    compute: cloud.clone(),
                    network: cloud.clone(),
                    disks: cloud.clone(),
                    tables: cloud.clone(),
                    tags: cloud.clone(),
                };
                clients
            },
            namer_b.clone(),
        );
        seed_instance(&cloud, &namer_a, "a1", Status::Free, "2026-01-01T00:00:00Z").await;
        seed_instance(&cloud, &namer_b, "b1", Status::Free, "2026-01-01T00:00:00Z").await;

        let from_a = inventory_a.list_by_status(ResourceKind::Instance, Status::Free).await.unwrap();
        let from_b = inventory_b.list_by_status(ResourceKind::Instance, Status::Free).await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_b.len(), 1);
        assert_ne!(from_a[0].name, from_b[0].name);
    }

    #[tokio::test]
    async fn list_by_role_separates_pool_members() {
        let (cloud, namer, inventory) = setup();
        seed_instance(&cloud, &namer, "a", Status::Free, "2026-01-01T00:00:00Z").await;
        seed_volume(&cloud, &namer, "v", Status::Free, "2026-01-01T00:00:00Z").await;

        let instances = inventory.list_by_role(Role::Instance).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].kind, ResourceKind::Instance);

        let volumes = inventory.list_by_role(Role::Volume).await.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].kind, ResourceKind::Volume);

        assert!(inventory.list_by_role(Role::Temp).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn untagged_resources_are_skipped() {
        let (cloud, namer, inventory) = setup();
        use crate::cloud::DiskApi;
        cloud
            .create_disk(DiskSpec {
                name: namer.volume("untagged"),
                size_gb: 64,
                source_snapshot: None,
                tags: Tags::new(),
            })
            .await
            .unwrap();
        assert!(inventory.volumes().await.unwrap().is_empty());
    }
}
