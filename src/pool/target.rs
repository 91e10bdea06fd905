//! What the reconciliation loop scales: instances or volumes.
//!
//! Both pools share one controller; the target hides which resource kind is
//! being counted, created and deleted. All state lives in cloud tags, so a
//! target is stateless and safe to share.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cloud::Role;
use crate::error::Result;
use crate::golden::GoldenManager;
use crate::inventory::{Inventory, PoolResource, ResourceKind, StatusCounts};
use crate::lifecycle::{InstanceConfig, Lifecycle};

#[async_trait]
pub trait PoolTarget: Send + Sync {
    /// Label used in log lines ("instance" / "volume")
    fn kind(&self) -> &'static str;

    async fn counts(&self) -> Result<StatusCounts>;

    async fn oldest_free(&self, n: usize) -> Result<Vec<PoolResource>>;

    /// Creates one free resource, returning its name.
    async fn create_one(&self, cancel: &CancellationToken) -> Result<String>;

    async fn delete_one(&self, resource: &PoolResource, cancel: &CancellationToken) -> Result<()>;
}

pub struct InstancePoolTarget {
    inventory: Arc<Inventory>,
    lifecycle: Lifecycle,
    ssh_public_key: String,
}

impl InstancePoolTarget {
    pub fn new(inventory: Arc<Inventory>, lifecycle: Lifecycle, ssh_public_key: String) -> Self {
        Self {
            inventory,
            lifecycle,
            ssh_public_key,
        }
    }
}

#[async_trait]
impl PoolTarget for InstancePoolTarget {
    fn kind(&self) -> &'static str {
        "instance"
    }

    async fn counts(&self) -> Result<StatusCounts> {
        self.inventory.count_by_status(ResourceKind::Instance).await
    }

    async fn oldest_free(&self, n: usize) -> Result<Vec<PoolResource>> {
        self.inventory.oldest_free(ResourceKind::Instance, n).await
    }

    async fn create_one(&self, cancel: &CancellationToken) -> Result<String> {
        let info = self
            .lifecycle
            .create_instance(
                &InstanceConfig {
                    ssh_public_key: self.ssh_public_key.clone(),
                    role: Role::Instance,
                },
                cancel,
            )
            .await?;
        Ok(info.name)
    }

    async fn delete_one(&self, resource: &PoolResource, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.delete_instance(&resource.name, cancel).await
    }
}

pub struct VolumePoolTarget {
    inventory: Arc<Inventory>,
    lifecycle: Lifecycle,
    golden: Arc<GoldenManager>,
    volume_size_gb: u32,
}

impl VolumePoolTarget {
    pub fn new(
        inventory: Arc<Inventory>,
        lifecycle: Lifecycle,
        golden: Arc<GoldenManager>,
        volume_size_gb: u32,
    ) -> Self {
        Self {
            inventory,
            lifecycle,
            golden,
            volume_size_gb,
        }
    }
}

#[async_trait]
impl PoolTarget for VolumePoolTarget {
    fn kind(&self) -> &'static str {
        "volume"
    }

    async fn counts(&self) -> Result<StatusCounts> {
        self.inventory.count_by_status(ResourceKind::Volume).await
    }

    async fn oldest_free(&self, n: usize) -> Result<Vec<PoolResource>> {
        self.inventory.oldest_free(ResourceKind::Volume, n).await
    }

    /// New volumes hydrate from the golden snapshot, which is ensured (and
    /// deduplicated) on every creation.
    async fn create_one(&self, cancel: &CancellationToken) -> Result<String> {
        let snapshot = self.golden.ensure_golden_snapshot(cancel).await?;
        let info = self
            .lifecycle
            .create_volume_from_snapshot(&snapshot.name, self.volume_size_gb, cancel)
            .await?;
        Ok(info.name)
    }

    async fn delete_one(&self, resource: &PoolResource, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.delete_volume(&resource.name, cancel).await
    }
}
