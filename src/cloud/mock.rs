//! In-memory cloud used by the test suite and the `memory` backend.
//!
//! State lives behind one mutex so tag compare-and-set is genuinely atomic
//! with respect to everything else, mirroring the per-resource optimistic
//! concurrency of the real tag blobs. Listing order is the resource name
//! order, which keeps pagination stable across calls.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;

use super::api::{ComputeApi, DiskApi, NetworkApi, TableApi, TagStore};
use super::types::{
    DiskRecord, DiskSpec, NicRecord, NicSpec, NsgSpec, Page, PageToken, PowerState, SnapshotRecord,
    SnapshotSpec, TableRow, Tags, VmRecord, VmSpec, MAX_QUERY_RESULTS,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct VmEntry {
    record: VmRecord,
    os_disk: String,
}

#[derive(Debug, Default)]
struct Inner {
    vms: BTreeMap<String, VmEntry>,
    nics: BTreeMap<String, NicRecord>,
    nsgs: BTreeMap<String, String>,
    disks: BTreeMap<String, DiskRecord>,
    snapshots: BTreeMap<String, SnapshotRecord>,
    tags: BTreeMap<String, Tags>,
    tables: BTreeMap<String, BTreeMap<(String, String), TableRow>>,
    next_ip: u32,
    /// Operation labels that fail their next invocation (test fault injection)
    failures: VecDeque<String>,
}

impl Inner {
    fn take_failure(&mut self, op: &str) -> Option<Error> {
        let pos = self.failures.iter().position(|f| f == op)?;
        self.failures.remove(pos);
        Some(Error::Cloud(format!("injected failure for {}", op)))
    }

    fn allocate_ip(&mut self) -> String {
        // Boxes subnet 10.1.0.0/16, host part starts at .0.4
        let host = 4 + self.next_ip;
        self.next_ip += 1;
        format!("10.1.{}.{}", host / 256, host % 256)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCloud {
    inner: Mutex<Inner>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next invocation of the labelled operation fail with a
    /// transient cloud error. Labels: `create_vm`, `create_nic`,
    /// `create_nsg`, `create_disk`, `create_snapshot`, `attach`.
    pub fn inject_failure(&self, op: &str) {
        self.inner.lock().unwrap().failures.push_back(op.to_string());
    }

    /// Names of every live resource, for leak assertions in tests.
    pub fn resource_names(&self) -> HashSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .vms
            .keys()
            .chain(inner.nics.keys())
            .chain(inner.nsgs.keys())
            .chain(inner.disks.keys())
            .chain(inner.snapshots.keys())
            .cloned()
            .collect()
    }

    fn paginate<T: Clone>(items: Vec<T>, page: Option<PageToken>) -> Page<T> {
        let offset = page.map(|t| t.0).unwrap_or(0);
        let slice: Vec<T> = items
            .iter()
            .skip(offset)
            .take(MAX_QUERY_RESULTS)
            .cloned()
            .collect();
        let consumed = offset + slice.len();
        let next = if consumed < items.len() {
            Some(PageToken(consumed))
        } else {
            None
        };
        Page { items: slice, next }
    }

    fn merged_tags(inner: &Inner, name: &str, base: &Tags) -> Tags {
        inner.tags.get(name).cloned().unwrap_or_else(|| base.clone())
    }
}

#[async_trait]
impl ComputeApi for InMemoryCloud {
    async fn create_vm(&self, spec: VmSpec) -> Result<VmRecord> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure("create_vm") {
            return Err(err);
        }
        if inner.vms.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("vm {} already exists", spec.name)));
        }
        if !inner.nics.contains_key(&spec.nic) {
            return Err(Error::NotFound(format!("nic {} for vm {}", spec.nic, spec.name)));
        }
        if spec.ssh_public_key.is_empty() {
            return Err(Error::Invalid(format!("vm {}: empty ssh key", spec.name)));
        }
        let private_ip = inner.nics.get(&spec.nic).unwrap().private_ip.clone();
        let record = VmRecord {
            name: spec.name.clone(),
            resource_id: format!("/mock/compute/virtualMachines/{}", spec.name),
            private_ip,
            power_state: PowerState::Running,
            data_disk: None,
            tags: spec.tags.clone(),
        };
        // The platform materialises the OS disk alongside the VM; deletion
        // has to remove it separately.
        let os_disk = DiskRecord {
            name: spec.os_disk.clone(),
            resource_id: format!("/mock/compute/disks/{}", spec.os_disk),
            size_gb: 30,
            attached_to: Some(spec.name.clone()),
            lun: None,
            tags: Tags::new(),
        };
        inner.disks.insert(spec.os_disk.clone(), os_disk);
        inner.tags.insert(spec.name.clone(), spec.tags.clone());
        inner.vms.insert(
            spec.name.clone(),
            VmEntry {
                record: record.clone(),
                os_disk: spec.os_disk,
            },
        );
        debug!("mock cloud: created vm {}", spec.name);
        Ok(record)
    }

    async fn get_vm(&self, name: &str) -> Result<Option<VmRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.vms.get(name).map(|entry| {
            let mut record = entry.record.clone();
            record.tags = Self::merged_tags(&inner, name, &record.tags);
            record
        }))
    }

    async fn list_vms(&self, name_prefix: &str, page: Option<PageToken>) -> Result<Page<VmRecord>> {
        let inner = self.inner.lock().unwrap();
        let items: Vec<VmRecord> = inner
            .vms
            .iter()
            .filter(|(name, _)| name.starts_with(name_prefix))
            .map(|(name, entry)| {
                let mut record = entry.record.clone();
                record.tags = Self::merged_tags(&inner, name, &record.tags);
                record
            })
            .collect();
        Ok(Self::paginate(items, page))
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.vms.remove(name) {
            // Detach, but keep, the data disk; the OS disk stays behind too.
            if let Some(data_disk) = entry.record.data_disk {
                if let Some(disk) = inner.disks.get_mut(&data_disk) {
                    disk.attached_to = None;
                    disk.lun = None;
                }
            }
            if let Some(disk) = inner.disks.get_mut(&entry.os_disk) {
                disk.attached_to = None;
            }
            inner.tags.remove(name);
            debug!("mock cloud: deleted vm {}", name);
        }
        Ok(())
    }

    async fn deallocate_vm(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.vms.get_mut(name) {
            Some(entry) => {
                entry.record.power_state = PowerState::Deallocated;
                Ok(())
            }
            None => Err(Error::NotFound(format!("vm {}", name))),
        }
    }

    async fn attach_data_disk(&self, vm_name: &str, disk_name: &str, lun: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure("attach") {
            return Err(err);
        }
        if !inner.vms.contains_key(vm_name) {
            return Err(Error::NotFound(format!("vm {}", vm_name)));
        }
        let disk = inner
            .disks
            .get(disk_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("disk {}", disk_name)))?;
        if disk.attached_to.is_some() {
            return Err(Error::Conflict(format!(
                "disk {} already attached to {}",
                disk_name,
                disk.attached_to.unwrap()
            )));
        }
        if inner.vms.get(vm_name).unwrap().record.data_disk.is_some() {
            return Err(Error::Conflict(format!(
                "vm {} already has a data disk at lun {}",
                vm_name, lun
            )));
        }
        let disk = inner.disks.get_mut(disk_name).unwrap();
        disk.attached_to = Some(vm_name.to_string());
        disk.lun = Some(lun);
        let entry = inner.vms.get_mut(vm_name).unwrap();
        entry.record.data_disk = Some(disk_name.to_string());
        Ok(())
    }
}

#[async_trait]
impl NetworkApi for InMemoryCloud {
    async fn create_nsg(&self, spec: NsgSpec) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure("create_nsg") {
            return Err(err);
        }
        if inner.nsgs.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("nsg {} already exists", spec.name)));
        }
        let resource_id = format!("/mock/network/networkSecurityGroups/{}", spec.name);
        inner.nsgs.insert(spec.name, resource_id.clone());
        Ok(resource_id)
    }

    async fn delete_nsg(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().nsgs.remove(name);
        Ok(())
    }

    async fn create_nic(&self, spec: NicSpec) -> Result<NicRecord> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure("create_nic") {
            return Err(err);
        }
        if inner.nics.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("nic {} already exists", spec.name)));
        }
        if !inner.nsgs.contains_key(&spec.nsg) {
            return Err(Error::NotFound(format!("nsg {} for nic {}", spec.nsg, spec.name)));
        }
        let record = NicRecord {
            name: spec.name.clone(),
            resource_id: format!("/mock/network/networkInterfaces/{}", spec.name),
            private_ip: inner.allocate_ip(),
        };
        inner.nics.insert(spec.name, record.clone());
        Ok(record)
    }

    async fn delete_nic(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().nics.remove(name);
        Ok(())
    }
}

#[async_trait]
impl DiskApi for InMemoryCloud {
    async fn create_disk(&self, spec: DiskSpec) -> Result<DiskRecord> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure("create_disk") {
            return Err(err);
        }
        if spec.size_gb == 0 {
            return Err(Error::Invalid(format!("disk {}: zero size", spec.name)));
        }
        if inner.disks.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("disk {} already exists", spec.name)));
        }
        if let Some(snapshot) = &spec.source_snapshot {
            if !inner.snapshots.contains_key(snapshot) {
                return Err(Error::NotFound(format!(
                    "snapshot {} for disk {}",
                    snapshot, spec.name
                )));
            }
        }
        let record = DiskRecord {
            name: spec.name.clone(),
            resource_id: format!("/mock/compute/disks/{}", spec.name),
            size_gb: spec.size_gb,
            attached_to: None,
            lun: None,
            tags: spec.tags.clone(),
        };
        inner.tags.insert(spec.name.clone(), spec.tags);
        inner.disks.insert(spec.name, record.clone());
        Ok(record)
    }

    async fn get_disk(&self, name: &str) -> Result<Option<DiskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.disks.get(name).map(|disk| {
            let mut record = disk.clone();
            record.tags = Self::merged_tags(&inner, name, &record.tags);
            record
        }))
    }

    async fn list_disks(
        &self,
        name_prefix: &str,
        page: Option<PageToken>,
    ) -> Result<Page<DiskRecord>> {
        let inner = self.inner.lock().unwrap();
        let items: Vec<DiskRecord> = inner
            .disks
            .iter()
            .filter(|(name, _)| name.starts_with(name_prefix))
            .map(|(name, disk)| {
                let mut record = disk.clone();
                record.tags = Self::merged_tags(&inner, name, &record.tags);
                record
            })
            .collect();
        Ok(Self::paginate(items, page))
    }

    async fn delete_disk(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(disk) = inner.disks.get(name) {
            if let Some(vm) = &disk.attached_to {
                if inner.vms.contains_key(vm) {
                    return Err(Error::Conflict(format!(
                        "disk {} is attached to {}",
                        name, vm
                    )));
                }
            }
        }
        inner.disks.remove(name);
        inner.tags.remove(name);
        Ok(())
    }

    async fn create_snapshot(&self, spec: SnapshotSpec) -> Result<SnapshotRecord> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure("create_snapshot") {
            return Err(err);
        }
        if inner.snapshots.contains_key(&spec.name) {
            return Err(Error::Conflict(format!(
                "snapshot {} already exists",
                spec.name
            )));
        }
        let source = inner
            .disks
            .get(&spec.source_disk)
            .ok_or_else(|| Error::NotFound(format!("source disk {}", spec.source_disk)))?;
        let record = SnapshotRecord {
            name: spec.name.clone(),
            resource_id: format!("/mock/compute/snapshots/{}", spec.name),
            size_gb: source.size_gb,
            tags: spec.tags.clone(),
        };
        // Merge into any advisory tags already present on the name.
        let entry = inner.tags.entry(spec.name.clone()).or_default();
        for (key, value) in &spec.tags {
            entry.insert(key.clone(), value.clone());
        }
        inner.snapshots.insert(spec.name, record.clone());
        Ok(record)
    }

    async fn get_snapshot(&self, name: &str) -> Result<Option<SnapshotRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.snapshots.get(name).map(|snap| {
            let mut record = snap.clone();
            record.tags = Self::merged_tags(&inner, name, &record.tags);
            record
        }))
    }

    async fn delete_snapshot(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshots.remove(name);
        inner.tags.remove(name);
        Ok(())
    }
}

#[async_trait]
impl TableApi for InMemoryCloud {
    async fn insert_row(&self, table: &str, row: TableRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let rows = inner.tables.entry(table.to_string()).or_default();
        let key = (row.partition_key.clone(), row.row_key.clone());
        if rows.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "row {}/{} exists in {}",
                key.0, key.1, table
            )));
        }
        rows.insert(key, row);
        Ok(())
    }

    async fn upsert_row(&self, table: &str, row: TableRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let rows = inner.tables.entry(table.to_string()).or_default();
        rows.insert((row.partition_key.clone(), row.row_key.clone()), row);
        Ok(())
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<TableRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|((pk, _), _)| pk == partition_key)
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl TagStore for InMemoryCloud {
    async fn get_tags(&self, name: &str) -> Result<Option<Tags>> {
        Ok(self.inner.lock().unwrap().tags.get(name).cloned())
    }

    async fn put_tag(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tags
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        name: &str,
        key: &str,
        expected: Option<&str>,
        desired: &str,
        extra: &Tags,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let blob = inner.tags.entry(name.to_string()).or_default();
        let current = blob.get(key).map(|s| s.as_str());
        if current != expected {
            return Ok(false);
        }
        blob.insert(key.to_string(), desired.to_string());
        for (k, v) in extra {
            blob.insert(k.clone(), v.clone());
        }
        Ok(true)
    }

    async fn remove_tags(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().tags.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic_spec(name: &str, nsg: &str) -> NicSpec {
        NicSpec {
            name: name.to_string(),
            subnet: "subnet-boxes".to_string(),
            nsg: nsg.to_string(),
        }
    }

    async fn vm_with_nic(cloud: &InMemoryCloud, name: &str) -> VmRecord {
        cloud
            .create_nsg(NsgSpec {
                name: format!("{}-nsg", name),
                rules: vec![],
            })
            .await
            .unwrap();
        cloud
            .create_nic(nic_spec(&format!("{}-nic", name), &format!("{}-nsg", name)))
            .await
            .unwrap();
        cloud
            .create_vm(VmSpec {
                name: name.to_string(),
                computer_name: name.chars().take(8).collect(),
                nic: format!("{}-nic", name),
                os_disk: format!("{}-osdisk", name),
                user_data: "#!/bin/sh\n".to_string(),
                ssh_public_key: "ssh-ed25519 AAAA test".to_string(),
                tags: Tags::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_vm_collision_is_conflict() {
        let cloud = InMemoryCloud::new();
        vm_with_nic(&cloud, "vm-a").await;
        let err = cloud
            .create_vm(VmSpec {
                name: "vm-a".to_string(),
                computer_name: "vm-a".to_string(),
                nic: "vm-a-nic".to_string(),
                os_disk: "other-osdisk".to_string(),
                user_data: String::new(),
                ssh_public_key: "ssh-ed25519 AAAA test".to_string(),
                tags: Tags::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn delete_vm_is_idempotent_and_leaves_disks() {
        let cloud = InMemoryCloud::new();
        vm_with_nic(&cloud, "vm-a").await;
        cloud.delete_vm("vm-a").await.unwrap();
        cloud.delete_vm("vm-a").await.unwrap();
        // The OS disk survives the VM and must be deleted explicitly.
        assert!(cloud.get_disk("vm-a-osdisk").await.unwrap().is_some());
        cloud.delete_disk("vm-a-osdisk").await.unwrap();
        assert!(cloud.get_disk("vm-a-osdisk").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attach_rejects_double_binding() {
        let cloud = InMemoryCloud::new();
        vm_with_nic(&cloud, "vm-a").await;
        vm_with_nic(&cloud, "vm-b").await;
        for disk in ["disk-1", "disk-2"] {
            cloud
                .create_disk(DiskSpec {
                    name: disk.to_string(),
                    size_gb: 64,
                    source_snapshot: None,
                    tags: Tags::new(),
                })
                .await
                .unwrap();
        }
        cloud.attach_data_disk("vm-a", "disk-1", 0).await.unwrap();
        let err = cloud.attach_data_disk("vm-b", "disk-1", 0).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let err = cloud.attach_data_disk("vm-a", "disk-2", 0).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn listing_pages_are_capped() {
        let cloud = InMemoryCloud::new();
        for i in 0..23 {
            vm_with_nic(&cloud, &format!("vm-{:02}", i)).await;
        }
        let mut seen = 0;
        let mut page = cloud.list_vms("vm-", None).await.unwrap();
        loop {
            assert!(page.items.len() <= MAX_QUERY_RESULTS);
            seen += page.items.len();
            match page.next {
                Some(token) => page = cloud.list_vms("vm-", Some(token)).await.unwrap(),
                None => break,
            }
        }
        assert_eq!(seen, 23);
    }

    #[tokio::test]
    async fn tag_cas_single_winner() {
        let cloud = InMemoryCloud::new();
        let won = cloud
            .compare_and_set("golden-qemu-abc", "golden:stage", None, "creating", &Tags::new())
            .await
            .unwrap();
        assert!(won);
        let won = cloud
            .compare_and_set("golden-qemu-abc", "golden:stage", None, "creating", &Tags::new())
            .await
            .unwrap();
        assert!(!won);
        // and the guarded transition succeeds exactly once
        let won = cloud
            .compare_and_set(
                "golden-qemu-abc",
                "golden:stage",
                Some("creating"),
                "ready",
                &Tags::new(),
            )
            .await
            .unwrap();
        assert!(won);
    }

    #[tokio::test]
    async fn cas_applies_extra_tags_only_on_success() {
        let cloud = InMemoryCloud::new();
        cloud.put_tag("vm-a", "shellbox:status", "free").await.unwrap();
        let mut extra = Tags::new();
        extra.insert("shellbox:userid".to_string(), "SHA256:abc".to_string());
        let won = cloud
            .compare_and_set("vm-a", "shellbox:status", Some("connected"), "free", &extra)
            .await
            .unwrap();
        assert!(!won);
        assert!(cloud.get_tags("vm-a").await.unwrap().unwrap().get("shellbox:userid").is_none());

        let won = cloud
            .compare_and_set("vm-a", "shellbox:status", Some("free"), "connected", &extra)
            .await
            .unwrap();
        assert!(won);
        let tags = cloud.get_tags("vm-a").await.unwrap().unwrap();
        assert_eq!(tags.get("shellbox:userid").unwrap(), "SHA256:abc");
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let cloud = InMemoryCloud::new();
        cloud.inject_failure("create_nsg");
        let err = cloud
            .create_nsg(NsgSpec {
                name: "nsg-x".to_string(),
                rules: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cloud");
        cloud
            .create_nsg(NsgSpec {
                name: "nsg-x".to_string(),
                rules: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn table_rows_append_only() {
        let cloud = InMemoryCloud::new();
        let row = TableRow {
            partition_key: "2026-08-01".to_string(),
            row_key: "t1_start".to_string(),
            body: serde_json::json!({"type": "start"}),
        };
        cloud.insert_row("SessionEvents", row.clone()).await.unwrap();
        let err = cloud.insert_row("SessionEvents", row).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let rows = cloud
            .query_partition("SessionEvents", "2026-08-01")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
