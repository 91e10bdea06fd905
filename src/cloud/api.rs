//! Contracts of the IaaS SDK shim.
//!
//! The real SDK wrappers live outside this repository; the pool controller
//! and the broker depend only on these traits. Implementations must be
//! `Send + Sync` object-safe so the whole bundle can be shared across the
//! listener and both reconciliation loops.

use async_trait::async_trait;

use super::types::{
    DiskRecord, DiskSpec, NicRecord, NicSpec, NsgSpec, Page, PageToken, SnapshotRecord,
    SnapshotSpec, TableRow, Tags, VmRecord, VmSpec,
};
use crate::error::Result;

#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Creates a VM. `Error::Conflict` when the name exists with an
    /// incompatible configuration.
    async fn create_vm(&self, spec: VmSpec) -> Result<VmRecord>;

    async fn get_vm(&self, name: &str) -> Result<Option<VmRecord>>;

    /// Lists VMs whose name starts with `name_prefix`, at most
    /// `MAX_QUERY_RESULTS` per page.
    async fn list_vms(&self, name_prefix: &str, page: Option<PageToken>) -> Result<Page<VmRecord>>;

    /// Deletes a VM. Absence is not an error.
    async fn delete_vm(&self, name: &str) -> Result<()>;

    /// Powers a VM off without deleting it.
    async fn deallocate_vm(&self, name: &str) -> Result<()>;

    /// LUN-attaches a data disk. `Error::Conflict` when the disk is already
    /// attached or the LUN is taken.
    async fn attach_data_disk(&self, vm_name: &str, disk_name: &str, lun: u8) -> Result<()>;
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Creates a network security group, returning its resource id.
    async fn create_nsg(&self, spec: NsgSpec) -> Result<String>;

    async fn delete_nsg(&self, name: &str) -> Result<()>;

    async fn create_nic(&self, spec: NicSpec) -> Result<NicRecord>;

    async fn delete_nic(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait DiskApi: Send + Sync {
    async fn create_disk(&self, spec: DiskSpec) -> Result<DiskRecord>;

    async fn get_disk(&self, name: &str) -> Result<Option<DiskRecord>>;

    async fn list_disks(
        &self,
        name_prefix: &str,
        page: Option<PageToken>,
    ) -> Result<Page<DiskRecord>>;

    async fn delete_disk(&self, name: &str) -> Result<()>;

    async fn create_snapshot(&self, spec: SnapshotSpec) -> Result<SnapshotRecord>;

    async fn get_snapshot(&self, name: &str) -> Result<Option<SnapshotRecord>>;

    async fn delete_snapshot(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait TableApi: Send + Sync {
    /// Inserts a row; `Error::Conflict` when `(partition_key, row_key)`
    /// already exists.
    async fn insert_row(&self, table: &str, row: TableRow) -> Result<()>;

    /// Inserts or replaces a row.
    async fn upsert_row(&self, table: &str, row: TableRow) -> Result<()>;

    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<TableRow>>;
}

/// The cloud-side tag blob, used as the synchronisation fabric.
///
/// Tag blobs exist independently of resources: an advisory lock may tag a
/// name before the resource it guards has been created. The compare-and-set
/// is the only atomic primitive the system relies on; both the pool loops
/// and the broker funnel their ownership transitions through it.
#[async_trait]
pub trait TagStore: Send + Sync {
    async fn get_tags(&self, name: &str) -> Result<Option<Tags>>;

    /// Unconditionally sets one tag.
    async fn put_tag(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Atomically sets `key` to `desired` iff its current value equals
    /// `expected` (`None` = key absent). On success the `extra` tags are
    /// written in the same blob update. Returns whether the write won.
    async fn compare_and_set(
        &self,
        name: &str,
        key: &str,
        expected: Option<&str>,
        desired: &str,
        extra: &Tags,
    ) -> Result<bool>;

    /// Drops the whole tag blob for a name (after resource deletion).
    async fn remove_tags(&self, name: &str) -> Result<()>;
}
